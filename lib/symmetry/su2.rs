//! Non-abelian SU(2) spin symmetry backend.
//!
//! Under this backend basis states are organized into spin *multiplets*: runs
//! of `2j + 1` states sharing an electron number, a total spin *j*, and a
//! *flavor* label distinguishing degenerate multiplets, with projections
//! *m* = -*j*, ..., *j* in ascending order. The outer product of two bases is
//! not a simple relabeling as in the abelian case; instead every pair of
//! multiplets is coupled into new total spins
//! |*j*<sub>1</sub> - *j*<sub>2</sub>| ≤ *j* ≤ *j*<sub>1</sub> + *j*<sub>2</sub>
//! with Clebsch-Gordan coefficients, which are kept in a sparse
//! [`SparseFactors`] matrix mapping the plain product basis onto the coupled
//! one.
//!
//! Spin quantum numbers are stored as numbers of halves throughout.

use ndarray as nd;
use rustc_hash::FxHashMap as HashMap;
use wigner_symbols::ClebschGordan;
use crate::{
    config::TruncationParams,
    qn::{ QnEncoder, QnResult },
    store::{ DataIn, DataOut, StoreError, StoreResult },
};
use super::{ StateRecord, select_discarded };

/// A `(2j, 2m)` spin pair.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jm {
    j2: u32,
    m2: i32,
}

impl Jm {
    /// Spin zero.
    pub const ZERO: Self = Self { j2: 0, m2: 0 };

    /// Create a new spin pair if the projection is valid for the total.
    pub fn new(j2: u32, m2: i32) -> Option<Self> {
        let j = i64::from(j2);
        let m = i64::from(m2);
        ((-j..=j).contains(&m) && (j - m) % 2 == 0)
            .then_some(Self { j2, m2 })
    }

    /// Return twice the total spin.
    pub fn j2(self) -> u32 { self.j2 }

    /// Return twice the spin projection.
    pub fn m2(self) -> i32 { self.m2 }

    /// Return the total spin as an `f64`.
    pub fn j(self) -> f64 { f64::from(self.j2) / 2.0 }

    /// Return the spin projection as an `f64`.
    pub fn m(self) -> f64 { f64::from(self.m2) / 2.0 }

    /// Return the position of `self` within its multiplet, counting from the
    /// lowest projection.
    pub fn offset(self) -> usize { ((self.m2 + self.j2 as i32) / 2) as usize }

    /// Iterate over all members of the multiplet with total spin `j2 / 2` by
    /// ascending projection.
    pub fn multiplet(j2: u32) -> impl Iterator<Item = Self> {
        (0..=j2).map(move |k| Self { j2, m2: 2 * k as i32 - j2 as i32 })
    }
}

/// Clebsch-Gordan coefficient ⟨*j*<sub>1</sub> *m*<sub>1</sub>;
/// *j*<sub>2</sub> *m*<sub>2</sub> | *j* *m*⟩.
pub fn cg(a: Jm, b: Jm, c: Jm) -> f64 {
    ClebschGordan {
        tj1: a.j2 as i32,
        tm1: a.m2,
        tj2: b.j2 as i32,
        tm2: b.m2,
        tj12: c.j2 as i32,
        tm12: c.m2,
    }
    .value()
    .into()
}

/// Sparse real matrix in compressed-row form.
#[derive(Clone, Debug, PartialEq)]
pub struct SparseFactors {
    nrows: usize,
    ncols: usize,
    rowptr: Vec<usize>, // length nrows + 1
    cols: Vec<usize>,
    values: Vec<f64>,
}

impl SparseFactors {
    fn from_parts(
        nrows: usize,
        ncols: usize,
        rowptr: Vec<usize>,
        cols: Vec<usize>,
        values: Vec<f64>,
    ) -> Option<Self>
    {
        let ok
            = rowptr.len() == nrows + 1
            && rowptr.first() == Some(&0)
            && rowptr.windows(2).all(|w| w[0] <= w[1])
            && rowptr.last() == Some(&cols.len())
            && cols.len() == values.len()
            && cols.iter().all(|c| *c < ncols);
        ok.then_some(Self { nrows, ncols, rowptr, cols, values })
    }

    /// Number of rows (coupled states).
    pub fn nrows(&self) -> usize { self.nrows }

    /// Number of columns (product states).
    pub fn ncols(&self) -> usize { self.ncols }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize { self.values.len() }

    /// Iterate over the stored `(column, value)` pairs of row `i`.
    pub fn row(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.rowptr[i]..self.rowptr[i + 1];
        self.cols[range.clone()].iter().copied()
            .zip(self.values[range].iter().copied())
    }

    /// Return the `(i, j)`-th element.
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.row(i).find(|(c, _)| *c == j).map(|(_, v)| v).unwrap_or(0.0)
    }

    /// Expand into a dense matrix.
    pub fn to_dense(&self) -> nd::Array2<f64> {
        let mut dense: nd::Array2<f64> = nd::Array2::zeros((self.nrows, self.ncols));
        for i in 0..self.nrows {
            self.row(i).for_each(|(j, v)| { dense[[i, j]] += v; });
        }
        dense
    }

    /// Return `true` if `self` is exactly the identity: square, with every row
    /// storing its diagonal element as one and any other stored element as
    /// zero.
    pub fn is_identity(&self) -> bool {
        if self.nrows != self.ncols || self.nrows == 0 { return false; }
        (0..self.nrows).all(|i| {
            let mut has_diag = false;
            let row_ok = self.row(i).all(|(j, v)| {
                if i == j { has_diag = true; v == 1.0 } else { v == 0.0 }
            });
            row_ok && has_diag
        })
    }
}

/// A run of states forming one spin multiplet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Multiplet {
    /// Index of the lowest-projection member.
    pub start: usize,
    /// Twice the total spin; the multiplet has `j2 + 1` members.
    pub j2: u32,
    pub electrons: u32,
    pub flavor: u32,
}

impl Multiplet {
    /// Number of member states.
    pub fn size(&self) -> usize { self.j2 as usize + 1 }
}

/// Identifies a pair of parent multiplets in a product basis.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlavorKey {
    pub flavors: (u32, u32),
    pub electrons: (u32, u32),
    pub j2: (u32, u32),
}

/// SU(2) backend.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Su2Symmetry {
    multiplets: Vec<Multiplet>,
    reduced: Vec<usize>, // length = number of states
    j_vals: Vec<u32>,
    factors: Option<SparseFactors>,
    flavor_index: HashMap<FlavorKey, usize>,
}

struct Coupled {
    electrons: u32,
    j2: u32,
    left: usize,
    right: usize,
    qn: u64,
}

impl Su2Symmetry {
    /// Recompute multiplets, reduced indices, and the list of total spins from
    /// a set of records.
    pub fn rebuild(&mut self, records: &[StateRecord]) {
        self.multiplets.clear();
        self.reduced.clear();
        for (i, rec) in records.iter().enumerate() {
            let starts_new
                = match self.multiplets.last() {
                    None => true,
                    Some(last) => {
                        last.electrons != rec.electrons()
                            || last.j2 != rec.jm.j2()
                            || last.flavor != rec.flavor
                            || rec.jm.m2() == -(rec.jm.j2() as i32)
                    },
                };
            if starts_new {
                self.multiplets.push(Multiplet {
                    start: i,
                    j2: rec.jm.j2(),
                    electrons: rec.electrons(),
                    flavor: rec.flavor,
                });
            }
            self.reduced.push(self.multiplets.len() - 1);
        }
        self.j_vals = self.multiplets.iter().map(|m| m.j2).collect();
        self.j_vals.sort_unstable();
        self.j_vals.dedup();
    }

    /// Update after truncation. The product-to-coupled factors no longer
    /// describe the basis and are dropped.
    pub fn truncate(&mut self, records: &[StateRecord]) {
        self.factors = None;
        self.flavor_index.clear();
        self.rebuild(records);
    }

    /// Build the coupled product of two SU(2) bases.
    ///
    /// Returns the backend for the product together with its records and
    /// per-state quantum numbers. States come out grouped by pseudo effective
    /// number, then flavor, then projection, which is already canonical order.
    pub(crate) fn set_to_product(
        left: &Self,
        left_records: &[StateRecord],
        right: &Self,
        right_records: &[StateRecord],
        qn_base: u64,
    ) -> QnResult<(Self, Vec<StateRecord>, Vec<u64>)>
    {
        let size_left = left_records.len();
        let total = size_left * right_records.len();

        let mut coupled: Vec<Coupled> = Vec::new();
        for (b, mb) in right.multiplets.iter().enumerate() {
            for (a, ma) in left.multiplets.iter().enumerate() {
                let electrons = ma.electrons + mb.electrons;
                let jlo = ma.j2.abs_diff(mb.j2);
                let jhi = ma.j2 + mb.j2;
                for j2 in (jlo..=jhi).step_by(2) {
                    let qn = QnEncoder::pseudo(qn_base, electrons, j2)?;
                    coupled.push(Coupled { electrons, j2, left: a, right: b, qn });
                }
            }
        }
        coupled.sort_by_key(|c| c.qn);

        let mut records: Vec<StateRecord> = Vec::with_capacity(total);
        let mut qns: Vec<u64> = Vec::with_capacity(total);
        let mut rowptr: Vec<usize> = Vec::with_capacity(total + 1);
        let mut cols: Vec<usize> = Vec::new();
        let mut values: Vec<f64> = Vec::new();
        let mut flavor_index: HashMap<FlavorKey, usize> = HashMap::default();
        rowptr.push(0);
        let mut flavor: u32 = 0;
        let mut prev_qn: Option<u64> = None;
        for (k, c) in coupled.iter().enumerate() {
            if prev_qn == Some(c.qn) { flavor += 1; } else { flavor = 0; }
            prev_qn = Some(c.qn);
            let ma = &left.multiplets[c.left];
            let mb = &right.multiplets[c.right];
            let key = FlavorKey {
                flavors: (ma.flavor, mb.flavor),
                electrons: (ma.electrons, mb.electrons),
                j2: (ma.j2, mb.j2),
            };
            flavor_index.entry(key).or_insert(k);
            for jm in Jm::multiplet(c.j2) {
                records.push(StateRecord::with_spin(c.electrons, jm, flavor));
                qns.push(c.qn);
                for jma in Jm::multiplet(ma.j2) {
                    let Some(jmb) = Jm::new(mb.j2, jm.m2() - jma.m2())
                        else { continue; };
                    let coeff = cg(jma, jmb, jm);
                    if coeff == 0.0 { continue; }
                    let i_left = ma.start + jma.offset();
                    let i_right = mb.start + jmb.offset();
                    cols.push(i_left + i_right * size_left);
                    values.push(coeff);
                }
                rowptr.push(cols.len());
            }
        }
        debug_assert_eq!(records.len(), total);

        let factors
            = SparseFactors::from_parts(records.len(), total, rowptr, cols, values);
        debug_assert!(factors.is_some());
        let mut new = Self { factors, flavor_index, ..Self::default() };
        new.rebuild(&records);
        Ok((new, records, qns))
    }

    /// Select whole multiplets to discard.
    pub fn calc_removed_indices(
        &self,
        weights: &[f64],
        kept: usize,
        params: &TruncationParams,
    ) -> Vec<usize>
    {
        let groups: Vec<(f64, Vec<usize>)>
            = self.multiplets.iter()
            .map(|m| {
                let members: Vec<usize> = (m.start..m.start + m.size()).collect();
                let w: f64
                    = members.iter()
                    .map(|i| weights.get(*i).copied().unwrap_or(0.0))
                    .sum();
                (w, members)
            })
            .collect();
        select_discarded(groups, kept, params)
    }

    /// Return the index of the multiplet containing state `i`.
    pub fn reduced_index(&self, i: usize) -> usize { self.reduced[i] }

    /// Return the number of multiplets.
    pub fn reduced_size(&self) -> usize { self.multiplets.len() }

    /// Return all multiplets.
    pub fn multiplets(&self) -> &[Multiplet] { &self.multiplets }

    /// Return the distinct values of `2j`, ascending.
    pub fn j_vals(&self) -> &[u32] { &self.j_vals }

    /// Return the largest value of `2j`.
    pub fn j_max(&self) -> u32 { self.j_vals.last().copied().unwrap_or(0) }

    /// Return the product-to-coupled factors, if `self` came from a product
    /// that hasn't been truncated since.
    pub fn factors(&self) -> Option<&SparseFactors> { self.factors.as_ref() }

    /// Return the index of the first coupled multiplet built from a given pair
    /// of parent multiplets.
    pub fn flavor_to_index(&self, key: &FlavorKey) -> Option<usize> {
        self.flavor_index.get(key).copied()
    }

    pub fn write<W>(&self, out: &mut W, prefix: &str, records: &[StateRecord])
        -> StoreResult<()>
    where W: DataOut
    {
        let group = format!("{prefix}Su2");
        out.create_group(&group)?;
        let j2: Vec<u64> = records.iter().map(|r| u64::from(r.jm.j2())).collect();
        let m2: Vec<i64> = records.iter().map(|r| i64::from(r.jm.m2())).collect();
        let flavors: Vec<u64> = records.iter().map(|r| u64::from(r.flavor)).collect();
        out.write_ints(&format!("{group}/JM_J2"), &j2)?;
        out.write_signed(&format!("{group}/JM_M2"), &m2)?;
        out.write_ints(&format!("{group}/FLAVORS"), &flavors)?;
        if let Some(factors) = &self.factors {
            let shape = [factors.nrows as u64, factors.ncols as u64];
            let rowptr: Vec<u64> = factors.rowptr.iter().map(|x| *x as u64).collect();
            let cols: Vec<u64> = factors.cols.iter().map(|x| *x as u64).collect();
            out.write_ints(&format!("{group}/FACTORS_SHAPE"), &shape)?;
            out.write_ints(&format!("{group}/FACTORS_ROWPTR"), &rowptr)?;
            out.write_ints(&format!("{group}/FACTORS_COLS"), &cols)?;
            out.write_reals(&format!("{group}/FACTORS_VALUES"), &factors.values)?;
        }
        Ok(())
    }

    pub fn read<R>(input: &mut R, prefix: &str, records: &mut [StateRecord])
        -> StoreResult<Self>
    where R: DataIn
    {
        let group = format!("{prefix}Su2");
        let n = records.len();
        let j2 = input.read_ints(&format!("{group}/JM_J2"))?;
        let m2 = input.read_signed(&format!("{group}/JM_M2"))?;
        let flavors = input.read_ints(&format!("{group}/FLAVORS"))?;
        for (label, len) in [("JM_J2", j2.len()), ("JM_M2", m2.len()), ("FLAVORS", flavors.len())] {
            if len != n {
                return Err(StoreError::LengthMismatch {
                    label: format!("{group}/{label}"),
                    expected: n,
                    got: len,
                });
            }
        }
        for (k, rec) in records.iter_mut().enumerate() {
            rec.jm
                = u32::try_from(j2[k]).ok()
                .zip(i32::try_from(m2[k]).ok())
                .and_then(|(j, m)| Jm::new(j, m))
                .ok_or_else(|| StoreError::BadValue(format!("{group}/JM_M2"), k))?;
            rec.flavor
                = u32::try_from(flavors[k])
                .map_err(|_| StoreError::BadValue(format!("{group}/FLAVORS"), k))?;
        }
        let shape_label = format!("{group}/FACTORS_SHAPE");
        let factors
            = if input.contains(&shape_label) {
                let shape = input.read_ints(&shape_label)?;
                let rowptr = input.read_ints(&format!("{group}/FACTORS_ROWPTR"))?;
                let cols = input.read_ints(&format!("{group}/FACTORS_COLS"))?;
                let values = input.read_reals(&format!("{group}/FACTORS_VALUES"))?;
                let &[nrows, ncols] = <&[u64; 2]>::try_from(shape.as_slice())
                    .map_err(|_| StoreError::BadValue(shape_label.clone(), 0))?;
                let f = SparseFactors::from_parts(
                    nrows as usize,
                    ncols as usize,
                    rowptr.into_iter().map(|x| x as usize).collect(),
                    cols.into_iter().map(|x| x as usize).collect(),
                    values,
                )
                .ok_or_else(|| StoreError::BadValue(shape_label.clone(), 0))?;
                Some(f)
            } else {
                None
            };
        let mut new = Self { factors, ..Self::default() };
        new.rebuild(records);
        Ok(new)
    }
}
