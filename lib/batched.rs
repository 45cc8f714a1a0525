//! Batched application of a sum of Kronecker products to a state vector.
//!
//! For connections *c* and output/input patches *o*, *i*, the operator acts as
//! <blockquote>
//!   <p style="font-size:20px">
//!     <i>Y</i><sub><i>o</i></sub> += Σ<sub><i>c</i>,<i>i</i></sub>
//!     <i>A</i><sub><i>coi</i></sub> <i>Y</i><sub><i>i</i></sub>
//!     <i>B</i><sub><i>coi</i></sub><sup>T</sup>
//!   </p>
//! </blockquote>
//! (see [`patch`][crate::patch] for the vector layout). Instead of issuing two
//! small multiplications for every non-zero `(c, o, i)`, all right factors
//! acting on the same input patch are packed side by side into one matrix
//! *R*<sub><i>i</i></sub> = [ … *B*<sub><i>coi</i></sub><sup>T</sup> … ], and
//! all left factors producing the same output patch are packed into one matrix
//! *L*<sub><i>o</i></sub> = [ … *A*<sub><i>coi</i></sub> … ]. A full
//! application is then two rounds of larger multiplications:
//! 1. *Z*<sub><i>i</i></sub> = *Y*<sub><i>i</i></sub> *R*<sub><i>i</i></sub>
//!    for every input patch;
//! 2. *Y*<sub><i>o</i></sub> += *L*<sub><i>o</i></sub> *G*<sub><i>o</i></sub>
//!    for every output patch, where *G*<sub><i>o</i></sub> stacks the column
//!    blocks of the *Z*<sub><i>i</i></sub> that belong to *o*.
//!
//! Packed factors live in a single [`BatchBuffers`] arena built once per
//! basis generation. Both rounds are embarrassingly parallel over patches and
//! are handed to a [`GemmPool`] when more than one thread is requested.

use std::{ ops::Range, sync::Arc };
use log::{ info, trace, warn };
use ndarray::{ self as nd, linalg::general_mat_mul };
use thiserror::Error;
use crate::{
    KronScalar,
    patch::{ KronFactors, patch_view, patch_view_mut },
    pool::{ GemmPool, PoolError },
};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),
}
pub type BatchResult<T> = Result<T, BatchError>;

/// Integer type of the batch layout tables.
pub type BatchInt = i64;

// convert 0-based cumulative bounds to 1-based batch integers
fn one_based(bounds: &[usize]) -> Vec<BatchInt> {
    bounds.iter().map(|b| *b as BatchInt + 1).collect()
}

fn zero_based(bounds: &[BatchInt], p: usize) -> Range<usize> {
    (bounds[p] - 1) as usize..(bounds[p + 1] - 1) as usize
}

/// Location of a packed matrix inside the arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Packed {
    offset: usize,
    rows: usize,
    cols: usize,
}

impl Packed {
    fn len(&self) -> usize { self.rows * self.cols }
}

/// Column block of a *Z* matrix feeding into an output patch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Term {
    conn: usize,
    inp: usize,
    /// First column of the block in *Z*<sub>inp</sub>.
    z_col: usize,
}

/// Arena owning all packed factor batches for one basis generation.
#[derive(Debug)]
pub struct BatchBuffers<A> {
    nconn: usize,
    size: usize,
    left_bounds: Vec<BatchInt>,
    right_bounds: Vec<BatchInt>,
    offsets: Vec<BatchInt>,
    data: Vec<A>,
    right_batch: Vec<Packed>,    // per input patch: nr_i × Σ nr_o
    left_batch: Vec<Packed>,     // per output patch: nl_o × Σ nl_i
    terms: Vec<Vec<Term>>,       // per output patch, in left_batch column order
    gemms: usize,
}

impl<A> BatchBuffers<A>
where A: KronScalar
{
    /// Pack the non-zero factor blocks.
    pub fn new(factors: &KronFactors<A>) -> Self {
        let patches = factors.patches();
        let np = patches.len();
        let nconn = factors.num_connections();
        let left_bounds = one_based(patches.left_bounds());
        let right_bounds = one_based(patches.right_bounds());
        let offsets = one_based(patches.offsets());
        let nl = |p: usize| zero_based(&left_bounds, p).len();
        let nr = |p: usize| zero_based(&right_bounds, p).len();

        // column layout of each Z_i, grouped by output patch then connection;
        // terms for each output patch end up ordered by input patch
        let mut terms: Vec<Vec<Term>> = vec![Vec::new(); np];
        let mut z_width: Vec<usize> = vec![0; np];
        for i in 0..np {
            for (o, terms_o) in terms.iter_mut().enumerate() {
                for c in 0..nconn {
                    if factors.block(c, o, i).is_some() {
                        terms_o.push(Term { conn: c, inp: i, z_col: z_width[i] });
                        z_width[i] += nr(o);
                    }
                }
            }
        }

        let mut data: Vec<A> = Vec::new();
        let mut right_batch: Vec<Packed> = Vec::with_capacity(np);
        for (i, width) in z_width.iter().enumerate() {
            let packed = Packed { offset: data.len(), rows: nr(i), cols: *width };
            data.resize(data.len() + packed.len(), A::zero());
            right_batch.push(packed);
        }
        let mut left_batch: Vec<Packed> = Vec::with_capacity(np);
        for (o, terms_o) in terms.iter().enumerate() {
            let width: usize = terms_o.iter().map(|t| nl(t.inp)).sum();
            let packed = Packed { offset: data.len(), rows: nl(o), cols: width };
            data.resize(data.len() + packed.len(), A::zero());
            left_batch.push(packed);
        }

        let mut gemms: usize = 0;
        for (o, terms_o) in terms.iter().enumerate() {
            let mut l_col: usize = 0;
            for term in terms_o.iter() {
                let Some((a, b)) = factors.block(term.conn, o, term.inp)
                    else { continue; };
                let rp = right_batch[term.inp];
                let mut r_pack = Self::packed_mut(&mut data, rp);
                r_pack.slice_mut(nd::s![.., term.z_col..term.z_col + nr(o)])
                    .assign(&b.t());
                let lp = left_batch[o];
                let mut l_pack = Self::packed_mut(&mut data, lp);
                l_pack.slice_mut(nd::s![.., l_col..l_col + nl(term.inp)])
                    .assign(a);
                l_col += nl(term.inp);
                gemms += 2;
            }
        }

        let buffers = Self {
            nconn,
            size: patches.size(),
            left_bounds,
            right_bounds,
            offsets,
            data,
            right_batch,
            left_batch,
            terms,
            gemms,
        };
        info!(
            "batch setup: {} connections, {} patches, {} non-zero block pairs of {}, {} packed elements",
            nconn, np, factors.nnz_blocks(), nconn * np * np, buffers.data.len(),
        );
        buffers
    }

    fn packed_mut(data: &mut [A], p: Packed) -> nd::ArrayViewMut2<'_, A> {
        nd::ArrayViewMut2::from_shape(
            (p.rows, p.cols), &mut data[p.offset..p.offset + p.len()])
            .expect("packed batch fits its arena slot")
    }

    fn packed(&self, p: Packed) -> nd::ArrayView2<'_, A> {
        nd::ArrayView2::from_shape(
            (p.rows, p.cols), &self.data[p.offset..p.offset + p.len()])
            .expect("packed batch fits its arena slot")
    }

    /// Return the number of patches.
    pub fn num_patches(&self) -> usize { self.right_batch.len() }

    /// Return the number of connections.
    pub fn num_connections(&self) -> usize { self.nconn }

    /// Return the length of state vectors.
    pub fn size(&self) -> usize { self.size }

    /// Cumulative left patch dimensions, 1-based.
    pub fn left_bounds(&self) -> &[BatchInt] { &self.left_bounds }

    /// Cumulative right patch dimensions, 1-based.
    pub fn right_bounds(&self) -> &[BatchInt] { &self.right_bounds }

    /// Patch offsets into state vectors, 1-based.
    pub fn offsets(&self) -> &[BatchInt] { &self.offsets }

    /// Return the number of packed elements.
    pub fn len(&self) -> usize { self.data.len() }

    /// Return `true` if nothing was packed.
    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    /// Number of small multiplications replaced by the batch.
    pub fn replaced_gemms(&self) -> usize { self.gemms }

    /// Return the left and right dimensions of patch `p`.
    pub fn patch_dims(&self, p: usize) -> (usize, usize) { (self.nl(p), self.nr(p)) }

    fn nl(&self, p: usize) -> usize { zero_based(&self.left_bounds, p).len() }

    fn nr(&self, p: usize) -> usize { zero_based(&self.right_bounds, p).len() }

    /// First round for input patch `i`: *Z*<sub>i</sub> =
    /// *Y*<sub>i</sub> *R*<sub>i</sub>.
    pub fn right_product(&self, i: usize, v_in: &[A]) -> nd::Array2<A> {
        let rp = self.right_batch[i];
        let mut z: nd::Array2<A> = nd::Array2::zeros((self.nl(i), rp.cols));
        if rp.cols > 0 {
            let y = patch_view(&v_in[zero_based(&self.offsets, i)], self.nl(i), self.nr(i));
            general_mat_mul(A::one(), &y, &self.packed(rp), A::zero(), &mut z);
        }
        z
    }

    /// Second round for output patch `o`: *Y*<sub>o</sub> +=
    /// *L*<sub>o</sub> *G*<sub>o</sub>, with `y_out` viewed as an
    /// `nl × nr` matrix.
    pub fn left_accumulate(
        &self,
        o: usize,
        z: &[nd::Array2<A>],
        y_out: &mut nd::ArrayViewMut2<'_, A>,
    ) {
        let lp = self.left_batch[o];
        if lp.cols == 0 { return; }
        let nr_o = self.nr(o);
        let mut g: nd::Array2<A> = nd::Array2::zeros((lp.cols, nr_o));
        let mut row: usize = 0;
        for term in self.terms[o].iter() {
            let h = self.nl(term.inp);
            g.slice_mut(nd::s![row..row + h, ..])
                .assign(&z[term.inp].slice(nd::s![.., term.z_col..term.z_col + nr_o]));
            row += h;
        }
        general_mat_mul(A::one(), &self.packed(lp), &g, A::one(), y_out);
    }

    /// Run both rounds on the calling thread.
    fn apply_serial(&self, v_out: &mut [A], v_in: &[A]) {
        let z: Vec<nd::Array2<A>>
            = (0..self.num_patches())
            .map(|i| self.right_product(i, v_in))
            .collect();
        for o in 0..self.num_patches() {
            let (nl, nr) = (self.nl(o), self.nr(o));
            let mut y = patch_view_mut(&mut v_out[zero_based(&self.offsets, o)], nl, nr);
            self.left_accumulate(o, &z, &mut y);
        }
    }

    /// Add per-patch results computed elsewhere into `v_out`.
    fn add_patches(&self, v_out: &mut [A], deltas: Vec<(usize, nd::Array2<A>)>) {
        for (o, delta) in deltas.into_iter() {
            let (nl, nr) = (self.nl(o), self.nr(o));
            let mut y = patch_view_mut(&mut v_out[zero_based(&self.offsets, o)], nl, nr);
            y.zip_mut_with(&delta, |yk, dk| { *yk = *yk + *dk; });
        }
    }
}

impl<A> Drop for BatchBuffers<A> {
    fn drop(&mut self) {
        trace!("releasing batch buffers ({} packed elements)", self.data.len());
    }
}

/// Batched block-Kronecker multiplier for one basis generation.
///
/// Built once from the generation's [`KronFactors`] and then applied any
/// number of times with [`Self::matrix_vector`]. Applications take `&mut self`,
/// so a single multiplier can't be used from two threads at once.
pub struct BatchedKron<A> {
    buffers: Arc<BatchBuffers<A>>,
    pool: Option<GemmPool<A>>,
}

impl<A> BatchedKron<A>
where A: KronScalar + 'static
{
    /// Pack `factors` and, if `threads > 1`, start a pool of that many workers.
    /// `threads == 0` means one worker per logical CPU.
    pub fn new(factors: &KronFactors<A>, threads: usize) -> BatchResult<Self> {
        let buffers = Arc::new(BatchBuffers::new(factors));
        let pool
            = match threads {
                _ if buffers.num_patches() < 2 => None,
                0 => Some(GemmPool::new_cpus(Arc::clone(&buffers))?),
                1 => None,
                n => Some(GemmPool::new(n, Arc::clone(&buffers))?),
            };
        Ok(Self { buffers, pool })
    }

    /// Return the packed batches.
    pub fn buffers(&self) -> &BatchBuffers<A> { &self.buffers }

    /// Return the number of worker threads, or zero if everything runs on the
    /// calling thread.
    pub fn threads(&self) -> usize {
        self.pool.as_ref().map(|p| p.len()).unwrap_or(0)
    }

    /// Compute `v_out += Σ_c (A_c ⊗ B_c) v_in`.
    ///
    /// Both vectors must have length equal to the sector size; this is only
    /// checked in debug builds.
    pub fn matrix_vector(&mut self, v_out: &mut [A], v_in: &[A]) {
        debug_assert_eq!(v_out.len(), self.buffers.size());
        debug_assert_eq!(v_in.len(), self.buffers.size());
        if let Some(pool) = self.pool.as_ref() {
            match Self::apply_pool(pool, v_in) {
                Ok(deltas) => {
                    self.buffers.add_patches(v_out, deltas);
                    return;
                },
                Err(err) => {
                    warn!("{err}; continuing on the calling thread");
                    self.pool = None;
                },
            }
        }
        self.buffers.apply_serial(v_out, v_in);
    }

    fn apply_pool(pool: &GemmPool<A>, v_in: &[A])
        -> BatchResult<Vec<(usize, nd::Array2<A>)>>
    {
        let z = pool.right_round(Arc::new(v_in.to_vec()))?;
        Ok(pool.left_round(Arc::new(z))?)
    }
}
