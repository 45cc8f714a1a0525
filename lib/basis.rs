//! Canonically ordered, partitioned sets of basis states.
//!
//! A [`Basis`] is a finite list of states, each carrying an effective quantum
//! number (see [`qn`][crate::qn]) and some per-state data
//! ([`StateRecord`]). States are always kept sorted by quantum number, and
//! maximal runs of equal quantum numbers form *partitions*: the blocks on which
//! operators are block-diagonal. Since quantum numbers are constant over a
//! partition, they are stored *shrunk*, i.e. once per partition.
//!
//! The sorting permutation is kept alongside: `permutation[new] = old` maps
//! each position in the sorted basis back to its position in the raw
//! (unsorted) product order, and `permutation_inverse` is its inverse.

use std::{ fmt, ops::Range };
use itertools::Itertools;
use log::{ debug, info };
use thiserror::Error;
use crate::{
    INDEX_BITS,
    StateIndex,
    config::{ EngineConfig, SymmetryKind, TruncationParams },
    qn::{ QnEncoder, QnError },
    store::{ DataIn, DataOut, StoreError },
    symmetry::{ Jm, SparseFactors, StateRecord, Symmetry, su2::FlavorKey },
    to_index,
};

#[derive(Debug, Error)]
pub enum BasisError {
    /// Returned when an outer product has more states than can be indexed.
    #[error("basis too large: current = {current}, max = {max}; rebuild with the `long-index` feature")]
    CapacityExceeded { current: u128, max: u128 },

    /// Returned when bases built under different symmetry backends are
    /// combined.
    #[error("symmetry backend mismatch: expected {0}, got {1}")]
    SymmetryMismatch(SymmetryKind, SymmetryKind),

    /// Returned by [`Basis::find_partition_number`] for out-of-range states.
    #[error("no partition found for state {0}")]
    NoPartition(usize),

    /// Returned when site data vectors have inconsistent lengths.
    #[error("site data: expected {expected} {what}, got {got}")]
    SiteDataLength { what: &'static str, expected: usize, got: usize },

    /// Returned when SU(2) site data is missing spin labels.
    #[error("site data: spin labels are required under the su2 backend")]
    MissingSpins,

    /// Returned when SU(2) site data isn't grouped by pseudo quantum number.
    #[error("site data: state {0} is out of canonical order")]
    NotCanonical(usize),

    /// Returned when an electron vector of the wrong length is supplied.
    #[error("expected {expected} electron counts, got {got}")]
    ElectronsLength { expected: usize, got: usize },

    #[error("quantum number error: {0}")]
    Qn(#[from] QnError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
use BasisError::*;
pub type BasisResult<T> = Result<T, BasisError>;

/// Compute the partition vector of a sorted quantum-number vector.
///
/// A boundary is placed wherever the value changes and the vector is closed by
/// its length, so an empty input gives `[0]`.
pub fn find_partition(qns: &[u64]) -> Vec<StateIndex> {
    let mut partition: Vec<StateIndex>
        = qns.iter().enumerate()
        .filter(|(i, q)| *i == 0 || qns[i - 1] != **q)
        .map(|(i, _)| to_index(i))
        .collect();
    if qns.is_empty() { partition.push(0); } else { partition.push(to_index(qns.len())); }
    partition
}

/// Stably sort `qns` in place and return the permutation such that
/// `sorted[new] = raw[perm[new]]`.
pub fn sort_permutation(qns: &mut [u64]) -> Vec<StateIndex> {
    let mut perm: Vec<StateIndex> = (0..qns.len()).map(to_index).collect();
    perm.sort_by_key(|k| qns[*k as usize]);
    let sorted: Vec<u64> = perm.iter().map(|k| qns[*k as usize]).collect();
    qns.copy_from_slice(&sorted);
    perm
}

/// Invert a permutation.
pub fn invert_permutation(perm: &[StateIndex]) -> Vec<StateIndex> {
    let mut inv: Vec<StateIndex> = vec![0; perm.len()];
    perm.iter().enumerate()
        .for_each(|(i, p)| { inv[*p as usize] = to_index(i); });
    inv
}

fn is_permutation(perm: &[StateIndex]) -> bool {
    let mut seen = vec![false; perm.len()];
    perm.iter().all(|p| {
        let p = *p as usize;
        p < seen.len() && !std::mem::replace(&mut seen[p], true)
    })
}

/// Keep one value per partition.
pub fn shrink<T>(src: &[T], partition: &[StateIndex]) -> Vec<T>
where T: Copy
{
    debug_assert!(!partition.is_empty());
    partition.iter().take(partition.len().saturating_sub(1))
        .map(|p| src[*p as usize])
        .collect()
}

/// Broadcast one value per partition back to one value per state.
pub fn unshrink<T>(src: &[T], partition: &[StateIndex]) -> Vec<T>
where T: Copy
{
    debug_assert_eq!(src.len() + 1, partition.len());
    partition.iter().tuple_windows()
        .zip(src)
        .flat_map(|((a, b), x)| std::iter::repeat(*x).take((b - a) as usize))
        .collect()
}

/// Remove the elements at positions `removed` from `v`, keeping the order of
/// the rest.
pub fn truncate_vector<T>(v: &mut Vec<T>, removed: &[usize]) {
    if removed.is_empty() { return; }
    let mut drop = vec![false; v.len()];
    removed.iter().for_each(|k| { if let Some(d) = drop.get_mut(*k) { *d = true; } });
    let mut k: usize = 0;
    v.retain(|_| { let keep = !drop[k]; k += 1; keep });
}

/// Total weight discarded by removing the states at `removed`, computed as one
/// minus the kept weight and clamped to `[0, 1]`.
///
/// An empty removal list discards nothing, regardless of the weights'
/// normalization.
pub fn discarded_weight(weights: &[f64], removed: &[usize]) -> f64 {
    if removed.is_empty() { return 0.0; }
    let mut drop = vec![false; weights.len()];
    removed.iter().for_each(|k| { if let Some(d) = drop.get_mut(*k) { *d = true; } });
    let kept: f64
        = weights.iter().zip(&drop)
        .filter(|(_, d)| !**d)
        .map(|(w, _)| *w)
        .sum();
    (1.0 - kept).clamp(0.0, 1.0)
}

fn block_union(a: &[usize], b: &[usize]) -> Vec<usize> {
    a.iter().chain(b).copied().unique().collect()
}

/// Model-supplied data for a single-site basis.
#[derive(Clone, Debug, PartialEq)]
pub struct SiteData {
    qns: Vec<u64>,
    electrons: Vec<u32>,
    spins: Option<(Vec<Jm>, Vec<u32>)>,
    block: Vec<usize>,
}

impl SiteData {
    /// Create data for an abelian site from already-encoded quantum numbers and
    /// electron counts.
    pub fn new(qns: Vec<u64>, electrons: Vec<u32>) -> Self {
        Self { qns, electrons, spins: None, block: Vec::new() }
    }

    /// Create data for an SU(2) site. Quantum numbers are derived from the
    /// electron counts and total spins, and states must already be grouped
    /// into multiplets in canonical order.
    pub fn spinful(electrons: Vec<u32>, jm: Vec<Jm>, flavors: Vec<u32>) -> Self {
        Self { qns: Vec::new(), electrons, spins: Some((jm, flavors)), block: Vec::new() }
    }

    /// Attach spin labels to abelian data.
    pub fn with_spins(mut self, jm: Vec<Jm>, flavors: Vec<u32>) -> Self {
        self.spins = Some((jm, flavors));
        self
    }

    /// Set the physical sites the basis lives on.
    pub fn on_sites(mut self, block: Vec<usize>) -> Self {
        self.block = block;
        self
    }

    /// Return the number of states.
    pub fn len(&self) -> usize { self.electrons.len() }

    /// Return `true` if there are no states.
    pub fn is_empty(&self) -> bool { self.electrons.is_empty() }
}

/// Result of [`Basis::change_basis`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Removal {
    /// States to discard, ascending.
    pub indices: Vec<usize>,
    /// `indices[k]` was the `order[k]`-th state selected by the backend.
    pub order: Vec<usize>,
}

impl Removal {
    pub fn is_empty(&self) -> bool { self.indices.is_empty() }

    pub fn len(&self) -> usize { self.indices.len() }
}

/// A partitioned, canonically sorted set of basis states.
#[derive(Clone, Debug, PartialEq)]
pub struct Basis {
    name: String,
    block: Vec<usize>,
    qns: Vec<u64>, // shrunk
    records: Vec<StateRecord>,
    partition: Vec<StateIndex>,
    permutation: Vec<StateIndex>,
    perm_inverse: Vec<StateIndex>,
    transformed: bool,
    symmetry: Symmetry,
    qn_base: u64,
}

impl Basis {
    /// Create a new, empty basis.
    pub fn new(name: &str, config: &EngineConfig) -> Self {
        Self {
            name: name.to_string(),
            block: Vec::new(),
            qns: Vec::new(),
            records: Vec::new(),
            partition: vec![0],
            permutation: Vec::new(),
            perm_inverse: Vec::new(),
            transformed: false,
            symmetry: Symmetry::new(config.symmetry),
            qn_base: config.qn_base,
        }
    }

    /// Create a new single-site basis from model data.
    ///
    /// Under the local backend states are stably sorted by quantum number and
    /// their records reordered along with them. Under the SU(2) backend the
    /// data must already be in canonical order and the permutation is the
    /// identity.
    pub fn from_site(name: &str, config: &EngineConfig, data: SiteData)
        -> BasisResult<Self>
    {
        let n = data.electrons.len();
        let mut basis = Self::new(name, config);
        basis.block = data.block;
        let (qns, records)
            = match config.symmetry {
                SymmetryKind::Local => {
                    if data.qns.len() != n {
                        return Err(SiteDataLength {
                            what: "quantum numbers", expected: n, got: data.qns.len() });
                    }
                    let records: Vec<StateRecord>
                        = data.electrons.iter()
                        .map(|e| StateRecord::new(*e))
                        .collect();
                    (data.qns, records)
                },
                SymmetryKind::Su2 => {
                    let (jm, flavors) = data.spins.ok_or(MissingSpins)?;
                    if jm.len() != n {
                        return Err(SiteDataLength {
                            what: "spin labels", expected: n, got: jm.len() });
                    }
                    if flavors.len() != n {
                        return Err(SiteDataLength {
                            what: "flavors", expected: n, got: flavors.len() });
                    }
                    let records: Vec<StateRecord>
                        = data.electrons.iter().zip(&jm).zip(&flavors)
                        .map(|((e, jm), f)| StateRecord::with_spin(*e, *jm, *f))
                        .collect();
                    let qns: Vec<u64>
                        = records.iter()
                        .map(|r| QnEncoder::pseudo(config.qn_base, r.electrons(), r.jm.j2()))
                        .collect::<Result<_, _>>()?;
                    if let Some(k) = (1..n).find(|k| qns[k - 1] > qns[*k]) {
                        return Err(NotCanonical(k));
                    }
                    (qns, records)
                },
            };
        basis.install(qns, records);
        debug!(
            "basis '{}': {} site states in {} partitions",
            basis.name, basis.size(), basis.num_partitions(),
        );
        Ok(basis)
    }

    /// Create a new basis as the outer product of two others.
    pub fn product(name: &str, config: &EngineConfig, a: &Self, b: &Self)
        -> BasisResult<Self>
    {
        let mut basis = Self::new(name, config);
        basis.set_to_product(a, b, None)?;
        Ok(basis)
    }

    /// Replace the contents of `self` with the outer product `a ⊗ b`.
    ///
    /// Product states are first generated with `a`'s index running fastest,
    /// so that raw product state `ia + ib * a.size()` carries quantum number
    /// `qa + qb` under the local backend, and then sorted. Under the SU(2)
    /// backend composition is delegated to the backend, whose output is
    /// already canonical.
    ///
    /// Neither backend restricts the product to a single pseudo quantum
    /// number, so `pseudo_qn` is accepted and ignored.
    ///
    /// Fails without modifying `self` if the product can't be indexed by
    /// [`StateIndex`].
    pub fn set_to_product(&mut self, a: &Self, b: &Self, pseudo_qn: Option<u64>)
        -> BasisResult<()>
    {
        let kind = self.symmetry.kind();
        for other in [a, b] {
            if other.symmetry.kind() != kind {
                return Err(SymmetryMismatch(kind, other.symmetry.kind()));
            }
        }
        let current = b.size() as u128 * a.size() as u128;
        let max = 1_u128 << (INDEX_BITS - 1);
        if current >= max {
            return Err(CapacityExceeded { current, max });
        }
        if let Some(q) = pseudo_qn {
            debug!("basis '{}': ignoring pseudo quantum number {q}", self.name);
        }

        let block = block_union(&a.block, &b.block);
        match (&a.symmetry, &b.symmetry) {
            (Symmetry::Su2(sa), Symmetry::Su2(sb)) => {
                let (su2, records, qns)
                    = crate::symmetry::Su2Symmetry::set_to_product(
                        sa, &a.records, sb, &b.records, self.qn_base)?;
                self.block = block;
                self.symmetry = Symmetry::Su2(su2);
                self.install(qns, records);
            },
            _ => {
                let n = current as usize;
                let mut qns: Vec<u64> = Vec::with_capacity(n);
                let mut records: Vec<StateRecord> = Vec::with_capacity(n);
                for pb in 0..b.num_partitions() {
                    for ib in b.partition_range(pb) {
                        for pa in 0..a.num_partitions() {
                            for ia in a.partition_range(pa) {
                                qns.push(b.qns[pb] + a.qns[pa]);
                                records.push(StateRecord::new(
                                    a.records[ia].electrons()
                                    + b.records[ib].electrons()
                                ));
                            }
                        }
                    }
                }
                self.block = block;
                self.install(qns, records);
            },
        }
        info!(
            "basis '{}': {} x {} -> {} states in {} partitions",
            self.name, a.size(), b.size(), self.size(), self.num_partitions(),
        );
        Ok(())
    }

    // sort (or not), reorder records, partition, and shrink
    fn install(&mut self, mut qns: Vec<u64>, records: Vec<StateRecord>) {
        let perm: Vec<StateIndex>
            = match self.symmetry {
                Symmetry::Local(_) => sort_permutation(&mut qns),
                Symmetry::Su2(_) => {
                    debug_assert!(qns.windows(2).all(|w| w[0] <= w[1]));
                    (0..qns.len()).map(to_index).collect()
                },
            };
        self.records = perm.iter().map(|old| records[*old as usize]).collect();
        self.partition = find_partition(&qns);
        self.perm_inverse = invert_permutation(&perm);
        self.permutation = perm;
        self.qns = shrink(&qns, &self.partition);
        self.symmetry.rebuild(&self.records);
    }

    /// Ask the symmetry backend which states to discard, given per-state
    /// weights (e.g. reduced density matrix eigenvalues, in basis order) and a
    /// target number of states to keep.
    pub fn change_basis(
        &self,
        weights: &[f64],
        kept: usize,
        params: &TruncationParams,
    ) -> Removal
    {
        let selected = self.symmetry.calc_removed_indices(weights, kept, params);
        if selected.is_empty() { return Removal::default(); }
        let order: Vec<usize>
            = (0..selected.len())
            .sorted_by_key(|k| selected[*k])
            .collect();
        let indices: Vec<usize> = order.iter().map(|k| selected[*k]).collect();
        debug!(
            "basis '{}': selected {} of {} states for removal",
            self.name, indices.len(), self.size(),
        );
        Removal { indices, order }
    }

    /// Discard the states at `removed` (ascending) and return the discarded
    /// weight.
    ///
    /// The remaining states are re-partitioned, but the permutation vectors are
    /// left as they were: they still describe the pre-truncation order, which
    /// is what a subsequent wavefunction transformation needs. The basis is
    /// flagged as transformed even if nothing is removed.
    pub fn truncate_basis(&mut self, weights: &[f64], removed: &[usize]) -> f64 {
        self.transformed = true;
        if removed.is_empty() { return 0.0; }
        debug!("basis '{}': truncating indices...", self.name);
        let mut qns = unshrink(&self.qns, &self.partition);
        truncate_vector(&mut qns, removed);
        truncate_vector(&mut self.records, removed);
        self.symmetry.truncate(&self.records);
        self.partition = find_partition(&qns);
        self.qns = shrink(&qns, &self.partition);
        debug!("basis '{}': done with change_basis", self.name);
        discarded_weight(weights, removed)
    }

    /// Return the name of the basis.
    pub fn name(&self) -> &str { &self.name }

    /// Return the sites the basis is built over.
    pub fn block(&self) -> &[usize] { &self.block }

    /// Return the number of states.
    pub fn size(&self) -> usize {
        self.partition.last().map(|p| *p as usize).unwrap_or(0)
    }

    /// Return the start of partition `p`; `partition(num_partitions())` is the
    /// size of the basis.
    pub fn partition(&self, p: usize) -> usize { self.partition[p] as usize }

    /// Return the full partition vector.
    pub fn partition_vector(&self) -> &[StateIndex] { &self.partition }

    /// Return the number of partitions.
    pub fn num_partitions(&self) -> usize { self.partition.len() - 1 }

    /// Return the states in partition `p`.
    pub fn partition_range(&self, p: usize) -> Range<usize> {
        self.partition[p] as usize..self.partition[p + 1] as usize
    }

    /// Return the effective quantum number of partition `p`.
    pub fn qn(&self, p: usize) -> u64 { self.qns[p] }

    /// Return the shrunk quantum-number vector.
    pub fn qn_vector(&self) -> &[u64] { &self.qns }

    /// Return the effective quantum number of every state.
    pub fn qns_unshrunk(&self) -> Vec<u64> { unshrink(&self.qns, &self.partition) }

    /// Return the pseudo effective number of partition `p`: the same as
    /// [`Self::qn`] under the local backend, and the encoding of electron
    /// number and total spin under the SU(2) backend.
    pub fn pseudo_qn(&self, p: usize) -> BasisResult<u64> {
        match self.symmetry {
            Symmetry::Local(_) => Ok(self.qn(p)),
            Symmetry::Su2(_) => {
                let rec = &self.records[self.partition(p)];
                Ok(QnEncoder::pseudo(self.qn_base, rec.electrons(), rec.jm.j2())?)
            },
        }
    }

    /// Return the raw (pre-sort) position of sorted state `i`.
    pub fn permutation(&self, i: usize) -> usize { self.permutation[i] as usize }

    pub fn permutation_vector(&self) -> &[StateIndex] { &self.permutation }

    /// Return the sorted position of raw state `i`.
    pub fn permutation_inverse(&self, i: usize) -> usize {
        self.perm_inverse[i] as usize
    }

    pub fn permutation_inverse_vector(&self) -> &[StateIndex] { &self.perm_inverse }

    /// Return the index of the partition containing state `i`.
    pub fn find_partition_number(&self, i: usize) -> BasisResult<usize> {
        if i >= self.size() { return Err(NoPartition(i)); }
        Ok(self.partition.partition_point(|p| *p as usize <= i) - 1)
    }

    /// Return the per-state records.
    pub fn records(&self) -> &[StateRecord] { &self.records }

    /// Return the electron count of state `i`, or zero if electron counts
    /// haven't been loaded.
    pub fn electrons(&self, i: usize) -> u32 {
        self.records.get(i).map(|r| r.electrons()).unwrap_or(0)
    }

    pub fn electrons_vector(&self) -> Vec<u32> {
        self.records.iter().map(|r| r.electrons()).collect()
    }

    /// Supply electron counts, e.g. after a minimized read.
    pub fn set_electrons(&mut self, electrons: &[u32]) -> BasisResult<()> {
        if electrons.len() != self.records.len() {
            return Err(ElectronsLength {
                expected: self.records.len(), got: electrons.len() });
        }
        self.records.iter_mut().zip(electrons)
            .for_each(|(r, e)| { r.set_electrons(*e); });
        // multiplets are keyed on electron counts too
        self.symmetry.rebuild(&self.records);
        Ok(())
    }

    /// Return the fermionic parity bit of every state.
    pub fn odd_signs(&self) -> Vec<bool> {
        self.records.iter().map(|r| r.is_odd()).collect()
    }

    /// Return `f` if state `i` has odd electron number and `1` otherwise.
    pub fn fermionic_sign(&self, i: usize, f: i32) -> i32 {
        if self.records[i].is_odd() { f } else { 1 }
    }

    pub fn flavor(&self, i: usize) -> u32 { self.symmetry.flavor(&self.records, i) }

    /// Return the spin labels of state `i`; always zero under the local
    /// backend.
    pub fn jm(&self, i: usize) -> Jm {
        match self.symmetry {
            Symmetry::Local(_) => Jm::ZERO,
            Symmetry::Su2(_) => self.records[i].jm,
        }
    }

    /// Return the multiplet containing state `i` under the SU(2) backend.
    pub fn reduced_index(&self, i: usize) -> Option<usize> {
        match &self.symmetry {
            Symmetry::Su2(su2) => Some(su2.reduced_index(i)),
            Symmetry::Local(_) => None,
        }
    }

    /// Return the number of multiplets under the SU(2) backend.
    pub fn reduced_size(&self) -> Option<usize> {
        match &self.symmetry {
            Symmetry::Su2(su2) => Some(su2.reduced_size()),
            Symmetry::Local(_) => None,
        }
    }

    /// Return the distinct values of `2j`; empty under the local backend.
    pub fn j_vals(&self) -> &[u32] {
        match &self.symmetry {
            Symmetry::Su2(su2) => su2.j_vals(),
            Symmetry::Local(_) => &[],
        }
    }

    /// Return the largest value of `2j`; zero under the local backend.
    pub fn j_max(&self) -> u32 {
        match &self.symmetry {
            Symmetry::Su2(su2) => su2.j_max(),
            Symmetry::Local(_) => 0,
        }
    }

    /// Return the factors mixing the plain product basis into this one, if
    /// there are any.
    pub fn factors(&self) -> Option<&SparseFactors> {
        match &self.symmetry {
            Symmetry::Su2(su2) => su2.factors(),
            Symmetry::Local(_) => None,
        }
    }

    /// Look up the first multiplet coupled from a given pair of parent
    /// multiplets.
    pub fn flavor_to_index(&self, key: &FlavorKey) -> Option<usize> {
        match &self.symmetry {
            Symmetry::Su2(su2) => su2.flavor_to_index(key),
            Symmetry::Local(_) => None,
        }
    }

    /// Return `true` if the basis has been truncated.
    pub fn is_transformed(&self) -> bool { self.transformed }

    pub fn symmetry(&self) -> &Symmetry { &self.symmetry }

    pub fn symmetry_kind(&self) -> SymmetryKind { self.symmetry.kind() }

    /// Write to a store under the group `label`.
    ///
    /// Electron counts and parity bits are skipped if `minimize` is `true`.
    pub fn write<W>(&self, out: &mut W, label: &str, minimize: bool)
        -> BasisResult<()>
    where W: DataOut
    {
        let prefix = format!("{label}/");
        let as_u64 = |v: &[StateIndex]| -> Vec<u64> {
            v.iter().map(|x| *x as u64).collect()
        };
        out.create_group(label)?;
        out.write_flag(&format!("{prefix}useSu2Symmetry"), self.symmetry.kind().is_su2())?;
        let block: Vec<u64> = self.block.iter().map(|s| *s as u64).collect();
        out.write_ints(&format!("{prefix}BLOCK"), &block)?;
        if !minimize {
            let electrons: Vec<u64>
                = self.records.iter().map(|r| u64::from(r.electrons())).collect();
            out.write_ints(&format!("{prefix}ELECTRONS"), &electrons)?;
            out.write_flags(&format!("{prefix}SignsOld"), &self.odd_signs())?;
        }
        out.write_ints(&format!("{prefix}PARTITION"), &as_u64(&self.partition))?;
        out.write_ints(
            &format!("{prefix}PERMUTATIONINVERSE"), &as_u64(&self.perm_inverse))?;
        out.write_ints(&format!("{prefix}QNShrink"), &self.qns)?;
        self.symmetry.write(out, &prefix, &self.records)?;
        Ok(())
    }

    /// Read from a store under the group `label`. The name of the new basis is
    /// the last `/`-separated component of `label`.
    ///
    /// If `minimize` is `true`, electron counts are not read and default to
    /// zero; supply them afterward with [`Self::set_electrons`].
    pub fn read<R>(input: &mut R, label: &str, config: &EngineConfig, minimize: bool)
        -> BasisResult<Self>
    where R: DataIn
    {
        let prefix = format!("{label}/");
        let su2 = input.read_flag(&format!("{prefix}useSu2Symmetry"))?;
        let kind = if su2 { SymmetryKind::Su2 } else { SymmetryKind::Local };
        if kind != config.symmetry {
            return Err(SymmetryMismatch(config.symmetry, kind));
        }
        let block: Vec<usize>
            = input.read_ints(&format!("{prefix}BLOCK"))?
            .into_iter().map(|s| s as usize).collect();

        let read_index = |input: &mut R, name: &str| -> BasisResult<Vec<StateIndex>> {
            let label = format!("{prefix}{name}");
            input.read_ints(&label)?
                .into_iter().enumerate()
                .map(|(k, x)| {
                    StateIndex::try_from(x)
                        .map_err(|_| StoreError::BadValue(label.clone(), k).into())
                })
                .collect()
        };
        let partition = read_index(input, "PARTITION")?;
        let ok_partition
            = partition.first() == Some(&0)
            && partition.windows(2).all(|w| w[0] < w[1]);
        if !ok_partition {
            return Err(StoreError::BadValue(format!("{prefix}PARTITION"), 0).into());
        }
        let perm_inverse = read_index(input, "PERMUTATIONINVERSE")?;
        if !is_permutation(&perm_inverse) {
            return Err(
                StoreError::BadValue(format!("{prefix}PERMUTATIONINVERSE"), 0).into());
        }
        let qns = input.read_ints(&format!("{prefix}QNShrink"))?;
        if qns.len() + 1 != partition.len() {
            return Err(StoreError::LengthMismatch {
                label: format!("{prefix}QNShrink"),
                expected: partition.len() - 1,
                got: qns.len(),
            }.into());
        }
        let size = partition.last().map(|p| *p as usize).unwrap_or(0);

        let mut records: Vec<StateRecord> = vec![StateRecord::default(); size];
        if !minimize {
            let label = format!("{prefix}ELECTRONS");
            let electrons = input.read_ints(&label)?;
            if electrons.len() != size {
                return Err(StoreError::LengthMismatch {
                    label, expected: size, got: electrons.len() }.into());
            }
            for (k, (rec, e)) in records.iter_mut().zip(electrons).enumerate() {
                let e = u32::try_from(e)
                    .map_err(|_| StoreError::BadValue(label.clone(), k))?;
                rec.set_electrons(e);
            }
            let label = format!("{prefix}SignsOld");
            let signs = input.read_flags(&label)?;
            if let Some(k)
                = (0..size).find(|k| signs.get(*k) != Some(&records[*k].is_odd()))
            {
                return Err(StoreError::BadValue(label, k).into());
            }
        }
        let symmetry = Symmetry::read(kind, input, &prefix, &mut records)?;
        let name = label.rsplit('/').next().unwrap_or(label).to_string();
        let basis = Self {
            name,
            block,
            qns,
            records,
            permutation: invert_permutation(&perm_inverse),
            partition,
            perm_inverse,
            transformed: false,
            symmetry,
            qn_base: config.qn_base,
        };
        debug!(
            "basis '{}': read {} states in {} partitions",
            basis.name, basis.size(), basis.num_partitions(),
        );
        Ok(basis)
    }
}

fn write_list<T>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result
where T: fmt::Display
{
    writeln!(f, "{}", items.len())?;
    writeln!(f, "{}", items.iter().join(" "))
}

impl fmt::Display for Basis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "transformed={}", self.transformed)?;
        writeln!(f, "name={}", self.name)?;
        writeln!(f, "symmetry={}", self.symmetry.kind())?;
        writeln!(f, "quantumNumbers")?;
        write_list(f, &self.qns)?;
        writeln!(f, "electrons")?;
        write_list(f, &self.electrons_vector())?;
        writeln!(f, "partition")?;
        write_list(f, &self.partition)?;
        writeln!(f, "permutation")?;
        write_list(f, &self.permutation)?;
        writeln!(f, "block")?;
        write_list(f, &self.block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_site(name: &str, qns: Vec<u64>) -> Basis {
        let electrons = vec![0; qns.len()];
        Basis::from_site(name, &EngineConfig::default(), SiteData::new(qns, electrons))
            .unwrap()
    }

    #[test]
    fn sort_and_partition() {
        let b = local_site("b", vec![9, 3, 3, 8]);
        assert_eq!(b.qns_unshrunk(), vec![3, 3, 8, 9]);
        assert_eq!(b.partition_vector(), &[0, 2, 3, 4]);
        assert_eq!(b.permutation_vector(), &[1, 2, 3, 0]);
        assert_eq!(b.permutation_inverse_vector(), &[3, 0, 1, 2]);
        assert_eq!(b.qn_vector(), &[3, 8, 9]);
    }

    #[test]
    fn partition_edge_cases() {
        assert_eq!(find_partition(&[]), vec![0]);
        assert_eq!(find_partition(&[5]), vec![0, 1]);
        assert_eq!(find_partition(&[1, 1, 1]), vec![0, 3]);
    }

    #[test]
    fn shrink_unshrink() {
        let partition: Vec<StateIndex> = vec![0, 2, 3, 6];
        let full = vec![4, 4, 7, 9, 9, 9];
        let short = shrink(&full, &partition);
        assert_eq!(short, vec![4, 7, 9]);
        assert_eq!(unshrink(&short, &partition), full);
    }

    #[test]
    fn truncate_vector_keeps_order() {
        let mut v = vec!['a', 'b', 'c', 'd', 'e'];
        truncate_vector(&mut v, &[1, 3]);
        assert_eq!(v, vec!['a', 'c', 'e']);
    }

    #[test]
    fn discarded_weight_limits() {
        let w = [0.5, 0.25, 0.125, 0.125];
        assert_eq!(discarded_weight(&w, &[]), 0.0);
        assert_eq!(discarded_weight(&w, &[0, 1, 2, 3]), 1.0);
        assert!((discarded_weight(&w, &[2, 3]) - 0.25).abs() < 1e-15);
    }

    #[test]
    fn find_partition_number() {
        let b = local_site("b", vec![9, 3, 3, 8]);
        assert_eq!(b.find_partition_number(0).unwrap(), 0);
        assert_eq!(b.find_partition_number(1).unwrap(), 0);
        assert_eq!(b.find_partition_number(2).unwrap(), 1);
        assert_eq!(b.find_partition_number(3).unwrap(), 2);
        assert!(matches!(b.find_partition_number(4), Err(NoPartition(4))));
    }

    #[test]
    fn records_follow_permutation() {
        let config = EngineConfig::default();
        let data = SiteData::new(vec![2, 0, 1], vec![2, 0, 1]);
        let b = Basis::from_site("b", &config, data).unwrap();
        assert_eq!(b.electrons_vector(), vec![0, 1, 2]);
        assert_eq!(b.odd_signs(), vec![false, true, false]);
        assert_eq!(b.fermionic_sign(1, -1), -1);
        assert_eq!(b.fermionic_sign(2, -1), 1);
    }

    #[test]
    fn product_truncate_keeps_permutation() {
        let config = EngineConfig::default();
        let a = local_site("a", vec![0, 1]);
        let b = local_site("b", vec![0, 1]);
        let mut ab = Basis::product("ab", &config, &a, &b).unwrap();
        assert_eq!(ab.qns_unshrunk(), vec![0, 1, 1, 2]);
        let perm = ab.permutation_vector().to_vec();

        let weights = [0.1, 0.5, 0.35, 0.05];
        let removal = ab.change_basis(&weights, 2, &TruncationParams::default());
        assert_eq!(removal.indices, vec![0, 3]);
        let err = ab.truncate_basis(&weights, &removal.indices);
        assert!((err - 0.15).abs() < 1e-12);
        assert!(ab.is_transformed());
        assert_eq!(ab.size(), 2);
        assert_eq!(ab.partition_vector(), &[0, 2]);
        assert_eq!(ab.qn_vector(), &[1]);
        assert_eq!(ab.permutation_vector(), perm.as_slice());
    }

    #[test]
    fn empty_truncation_flags_transformed() {
        let mut b = local_site("b", vec![0, 1]);
        assert!(!b.is_transformed());
        assert_eq!(b.truncate_basis(&[0.5, 0.5], &[]), 0.0);
        assert!(b.is_transformed());
        assert_eq!(b.size(), 2);
    }

    #[test]
    fn symmetry_mismatch() {
        let local = local_site("a", vec![0, 1]);
        let su2_config = EngineConfig::with_symmetry(SymmetryKind::Su2);
        let mut target = Basis::new("ab", &su2_config);
        assert!(matches!(
            target.set_to_product(&local, &local, None),
            Err(SymmetryMismatch(SymmetryKind::Su2, SymmetryKind::Local)),
        ));
    }

    #[test]
    fn su2_site_requires_spins() {
        let config = EngineConfig::with_symmetry(SymmetryKind::Su2);
        let data = SiteData::new(vec![0, 0], vec![1, 1]);
        assert!(matches!(Basis::from_site("s", &config, data), Err(MissingSpins)));
    }

    #[test]
    fn block_union_is_ordered() {
        assert_eq!(block_union(&[0, 1], &[1, 2]), vec![0, 1, 2]);
        assert_eq!(block_union(&[3], &[1]), vec![3, 1]);
    }

    fn su2_spin_half(config: &EngineConfig, site: usize) -> Basis {
        let jm: Vec<Jm> = Jm::multiplet(1).collect();
        let data = SiteData::spinful(vec![1, 1], jm, vec![0, 0]).on_sites(vec![site]);
        Basis::from_site("s", config, data).unwrap()
    }

    #[test]
    fn site_data_errors() {
        let config = EngineConfig::default();
        let data = SiteData::new(vec![0, 1, 2], vec![0, 0]);
        assert!(matches!(
            Basis::from_site("s", &config, data),
            Err(SiteDataLength { what: "quantum numbers", expected: 2, got: 3 }),
        ));

        let su2 = EngineConfig::with_symmetry(SymmetryKind::Su2);
        let data = SiteData::spinful(vec![1, 1], vec![Jm::ZERO], vec![0, 0]);
        assert!(matches!(
            Basis::from_site("s", &su2, data),
            Err(SiteDataLength { what: "spin labels", expected: 2, got: 1 }),
        ));
        let data = SiteData::spinful(vec![1], vec![Jm::ZERO], vec![0, 0]);
        assert!(matches!(
            Basis::from_site("s", &su2, data),
            Err(SiteDataLength { what: "flavors", expected: 1, got: 2 }),
        ));

        // a spin-1/2 doublet listed after an empty state
        let jm: Vec<Jm>
            = Jm::multiplet(1).chain(std::iter::once(Jm::ZERO)).collect();
        let data = SiteData::spinful(vec![1, 1, 0], jm, vec![0, 0, 0]);
        assert!(matches!(Basis::from_site("s", &su2, data), Err(NotCanonical(2))));
    }

    #[test]
    fn failed_product_leaves_target_untouched() {
        // four electrons overflow a radix of 4
        let config = EngineConfig { qn_base: 4, ..EngineConfig::with_symmetry(SymmetryKind::Su2) };
        let s0 = su2_spin_half(&config, 0);
        let s1 = su2_spin_half(&config, 1);
        let s2 = su2_spin_half(&config, 2);
        let s3 = su2_spin_half(&config, 3);
        let ab = Basis::product("ab", &config, &s0, &s1).unwrap();
        let abc = Basis::product("abc", &config, &ab, &s2).unwrap();
        let mut target = ab.clone();
        assert!(matches!(target.set_to_product(&abc, &s3, None), Err(Qn(_))));
        assert_eq!(target, ab);
        assert_eq!(target.block(), &[0, 1]);
    }

    #[test]
    fn set_electrons_refreshes_multiplets() {
        let config = EngineConfig::with_symmetry(SymmetryKind::Su2);
        let s = su2_spin_half(&config, 0);
        let ss = Basis::product("ss", &config, &s, &s).unwrap();
        let mut store = crate::store::MemStore::new();
        ss.write(&mut store, "ss", true).unwrap();
        let mut read = Basis::read(&mut store, "ss", &config, true).unwrap();
        read.set_electrons(&ss.electrons_vector()).unwrap();

        let expected = Basis::product("sss", &config, &ss, &s).unwrap();
        let got = Basis::product("sss", &config, &read, &s).unwrap();
        assert_eq!(got.electrons_vector(), vec![3; 8]);
        assert_eq!(got.qn_vector(), expected.qn_vector());
        assert_eq!(got.electrons_vector(), expected.electrons_vector());
    }
}
