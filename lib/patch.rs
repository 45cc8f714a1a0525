//! Block layout of a two-part (left ⊗ right) super-basis and the dense factor
//! blocks of operators acting on it.
//!
//! A *patch* is a pair of partitions, one from the left basis and one from the
//! right, whose product states lie in the symmetry sector of interest. Within a
//! state vector, patches are stored one after another, and within patch `p` the
//! amplitude of left state `l` and right state `r` (both counted from the start
//! of their partitions) sits at `offsets[p] + l + r * nl`, i.e. each patch
//! segment is an `nl × nr` column-major matrix *Y*. An operator term
//! *A* ⊗ *B* then acts between patches as
//! <blockquote>
//!   <p style="font-size:20px">
//!     <i>Y</i><sub>out</sub> += <i>A</i> <i>Y</i><sub>in</sub>
//!     <i>B</i><sup>T</sup>
//!   </p>
//! </blockquote>

use std::ops::Range;
use ndarray::{ self as nd, ShapeBuilder, linalg::general_mat_mul };
use thiserror::Error;
use crate::{ KronScalar, basis::Basis };

#[derive(Debug, Error)]
pub enum PatchError {
    /// Returned when a full operator doesn't match the size of its basis.
    #[error("connection {conn}: {side} operator has shape {got:?}, expected {expected:?}")]
    OperatorShape {
        conn: usize,
        side: &'static str,
        expected: (usize, usize),
        got: (usize, usize),
    },

    /// Returned when a factor block doesn't match its patch dimensions.
    #[error("connection {conn}, patches ({out}, {inp}): {side} block has shape {got:?}, expected {expected:?}")]
    BlockShape {
        conn: usize,
        out: usize,
        inp: usize,
        side: &'static str,
        expected: (usize, usize),
        got: (usize, usize),
    },

    /// Returned when the wrong number of blocks is passed.
    #[error("expected {expected} factor blocks, got {got}")]
    BlockCount { expected: usize, got: usize },
}
use PatchError::*;
pub type PatchResult<T> = Result<T, PatchError>;

/// A single pairing of a left and a right partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Patch {
    /// Index of the left partition.
    pub left_partition: usize,
    /// Index of the right partition.
    pub right_partition: usize,
    /// Left basis states covered by the patch.
    pub left: Range<usize>,
    /// Right basis states covered by the patch.
    pub right: Range<usize>,
}

impl Patch {
    /// Number of left states.
    pub fn nl(&self) -> usize { self.left.len() }

    /// Number of right states.
    pub fn nr(&self) -> usize { self.right.len() }

    /// Number of product states.
    pub fn size(&self) -> usize { self.nl() * self.nr() }
}

/// All patches making up one symmetry sector, in order of left partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchDecomposition {
    patches: Vec<Patch>,
    left_bounds: Vec<usize>,
    right_bounds: Vec<usize>,
    offsets: Vec<usize>,
    left_size: usize,
    right_size: usize,
}

impl PatchDecomposition {
    /// Pair every left partition with every right partition whose quantum
    /// numbers `(ql, qr)` satisfy `sector`.
    pub fn new<F>(left: &Basis, right: &Basis, sector: F) -> Self
    where F: Fn(u64, u64) -> bool
    {
        let mut patches: Vec<Patch> = Vec::new();
        for pl in 0..left.num_partitions() {
            for pr in 0..right.num_partitions() {
                if sector(left.qn(pl), right.qn(pr)) {
                    patches.push(Patch {
                        left_partition: pl,
                        right_partition: pr,
                        left: left.partition_range(pl),
                        right: right.partition_range(pr),
                    });
                }
            }
        }
        Self::from_patches(patches, left.size(), right.size())
    }

    /// Select the sector whose quantum numbers add up to `target`.
    pub fn for_target(left: &Basis, right: &Basis, target: u64) -> Self {
        Self::new(left, right, |ql, qr| ql + qr == target)
    }

    /// Build a decomposition directly from a list of patches over left and
    /// right bases of given sizes.
    pub fn from_patches(patches: Vec<Patch>, left_size: usize, right_size: usize)
        -> Self
    {
        let cumulative = |f: &dyn Fn(&Patch) -> usize| -> Vec<usize> {
            std::iter::once(0)
                .chain(patches.iter().scan(0, |acc, p| { *acc += f(p); Some(*acc) }))
                .collect()
        };
        let left_bounds = cumulative(&Patch::nl);
        let right_bounds = cumulative(&Patch::nr);
        let offsets = cumulative(&Patch::size);
        Self { patches, left_bounds, right_bounds, offsets, left_size, right_size }
    }

    /// Return the number of patches.
    pub fn len(&self) -> usize { self.patches.len() }

    /// Return `true` if there are no patches.
    pub fn is_empty(&self) -> bool { self.patches.is_empty() }

    /// Return patch `p`.
    pub fn patch(&self, p: usize) -> &Patch { &self.patches[p] }

    /// Return all patches.
    pub fn patches(&self) -> &[Patch] { &self.patches }

    /// Cumulative left dimensions of the patches, starting at zero.
    pub fn left_bounds(&self) -> &[usize] { &self.left_bounds }

    /// Cumulative right dimensions of the patches, starting at zero.
    pub fn right_bounds(&self) -> &[usize] { &self.right_bounds }

    /// Start of each patch's segment in a state vector, closed by the total
    /// size.
    pub fn offsets(&self) -> &[usize] { &self.offsets }

    /// Return the segment of a state vector belonging to patch `p`.
    pub fn segment(&self, p: usize) -> Range<usize> {
        self.offsets[p]..self.offsets[p + 1]
    }

    /// Return the total number of product states.
    pub fn size(&self) -> usize { self.offsets.last().copied().unwrap_or(0) }

    /// Return the size of the underlying left basis.
    pub fn left_size(&self) -> usize { self.left_size }

    /// Return the size of the underlying right basis.
    pub fn right_size(&self) -> usize { self.right_size }

    /// Map a position in a state vector to its left and right basis states.
    pub fn locate(&self, k: usize) -> Option<(usize, usize)> {
        if k >= self.size() { return None; }
        let p = self.offsets.partition_point(|o| *o <= k) - 1;
        let patch = &self.patches[p];
        let local = k - self.offsets[p];
        Some((patch.left.start + local % patch.nl(), patch.right.start + local / patch.nl()))
    }
}

/// View the segment of a state vector belonging to a patch as an `nl × nr`
/// column-major matrix.
pub(crate) fn patch_view<A>(v: &[A], nl: usize, nr: usize) -> nd::ArrayView2<'_, A> {
    nd::ArrayView2::from_shape((nl, nr).f(), v)
        .expect("patch segment length matches its dimensions")
}

/// Mutable version of [`patch_view`].
pub(crate) fn patch_view_mut<A>(v: &mut [A], nl: usize, nr: usize)
    -> nd::ArrayViewMut2<'_, A>
{
    nd::ArrayViewMut2::from_shape((nl, nr).f(), v)
        .expect("patch segment length matches its dimensions")
}

/// One term of a sum of Kronecker products, as full operators over the
/// (sorted) left and right bases.
#[derive(Clone, Debug, PartialEq)]
pub struct Connection<A> {
    pub left: nd::Array2<A>,
    pub right: nd::Array2<A>,
}

impl<A> Connection<A> {
    pub fn new(left: nd::Array2<A>, right: nd::Array2<A>) -> Self {
        Self { left, right }
    }
}

/// Left and right factor blocks for one connection and one pair of patches.
pub type BlockPair<A> = (nd::Array2<A>, nd::Array2<A>);

fn is_zero_block<A>(a: &nd::Array2<A>) -> bool
where A: KronScalar
{
    a.iter().all(|x| x.is_exact_zero())
}

/// Dense factor blocks for every connection and every ordered pair of
/// (output, input) patches.
///
/// Block pairs where either factor is exactly zero are not stored.
#[derive(Clone, Debug, PartialEq)]
pub struct KronFactors<A> {
    patches: PatchDecomposition,
    nconn: usize,
    blocks: Vec<Option<BlockPair<A>>>, // [conn][out][inp]
}

impl<A> KronFactors<A>
where A: KronScalar
{
    /// Slice full operators into per-patch blocks.
    pub fn from_operators(patches: PatchDecomposition, conns: &[Connection<A>])
        -> PatchResult<Self>
    {
        let (nl, nr) = (patches.left_size(), patches.right_size());
        for (c, conn) in conns.iter().enumerate() {
            if conn.left.dim() != (nl, nl) {
                return Err(OperatorShape {
                    conn: c, side: "left", expected: (nl, nl), got: conn.left.dim() });
            }
            if conn.right.dim() != (nr, nr) {
                return Err(OperatorShape {
                    conn: c, side: "right", expected: (nr, nr), got: conn.right.dim() });
            }
        }
        let np = patches.len();
        let mut blocks: Vec<Option<BlockPair<A>>> = Vec::with_capacity(conns.len() * np * np);
        for conn in conns.iter() {
            for out in patches.patches().iter() {
                for inp in patches.patches().iter() {
                    let a = conn.left
                        .slice(nd::s![out.left.clone(), inp.left.clone()])
                        .to_owned();
                    let b = conn.right
                        .slice(nd::s![out.right.clone(), inp.right.clone()])
                        .to_owned();
                    let keep = !is_zero_block(&a) && !is_zero_block(&b);
                    blocks.push(keep.then_some((a, b)));
                }
            }
        }
        Ok(Self { patches, nconn: conns.len(), blocks })
    }

    /// Use pre-sliced blocks, laid out connection-major, then by output patch,
    /// then by input patch.
    pub fn from_blocks(
        patches: PatchDecomposition,
        nconn: usize,
        blocks: Vec<Option<BlockPair<A>>>,
    ) -> PatchResult<Self>
    {
        let np = patches.len();
        if blocks.len() != nconn * np * np {
            return Err(BlockCount { expected: nconn * np * np, got: blocks.len() });
        }
        let mut checked: Vec<Option<BlockPair<A>>> = Vec::with_capacity(blocks.len());
        for (k, block) in blocks.into_iter().enumerate() {
            let (c, o, i) = (k / (np * np), (k / np) % np, k % np);
            let Some((a, b)) = block else { checked.push(None); continue; };
            let (po, pi) = (patches.patch(o), patches.patch(i));
            if a.dim() != (po.nl(), pi.nl()) {
                return Err(BlockShape {
                    conn: c, out: o, inp: i, side: "left",
                    expected: (po.nl(), pi.nl()), got: a.dim(),
                });
            }
            if b.dim() != (po.nr(), pi.nr()) {
                return Err(BlockShape {
                    conn: c, out: o, inp: i, side: "right",
                    expected: (po.nr(), pi.nr()), got: b.dim(),
                });
            }
            let keep = !is_zero_block(&a) && !is_zero_block(&b);
            checked.push(keep.then_some((a, b)));
        }
        Ok(Self { patches, nconn, blocks: checked })
    }

    /// Return the patch decomposition.
    pub fn patches(&self) -> &PatchDecomposition { &self.patches }

    /// Return the number of connections.
    pub fn num_connections(&self) -> usize { self.nconn }

    /// Return the number of patches.
    pub fn num_patches(&self) -> usize { self.patches.len() }

    /// Return the length of state vectors.
    pub fn size(&self) -> usize { self.patches.size() }

    /// Return the blocks of connection `c` between output patch `out` and
    /// input patch `inp`, if they're non-zero.
    pub fn block(&self, c: usize, out: usize, inp: usize)
        -> Option<(&nd::Array2<A>, &nd::Array2<A>)>
    {
        let np = self.patches.len();
        self.blocks[(c * np + out) * np + inp].as_ref().map(|(a, b)| (a, b))
    }

    /// Return the number of stored (non-zero) block pairs.
    pub fn nnz_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }

    /// Compute `v_out += Σ_c (A_c ⊗ B_c) v_in` with one small multiplication
    /// per block.
    pub fn matrix_vector_unbatched(&self, v_out: &mut [A], v_in: &[A]) {
        debug_assert_eq!(v_out.len(), self.size());
        debug_assert_eq!(v_in.len(), self.size());
        let np = self.patches.len();
        for c in 0..self.nconn {
            for o in 0..np {
                let po = self.patches.patch(o);
                let seg_out = self.patches.segment(o);
                let mut y_out = patch_view_mut(&mut v_out[seg_out], po.nl(), po.nr());
                for i in 0..np {
                    let Some((a, b)) = self.block(c, o, i) else { continue; };
                    let pi = self.patches.patch(i);
                    let y_in = patch_view(&v_in[self.patches.segment(i)], pi.nl(), pi.nr());
                    let ay = a.dot(&y_in);
                    general_mat_mul(A::one(), &ay, &b.t(), A::one(), &mut y_out);
                }
            }
        }
    }

    /// Build the full operator on the sector as a dense matrix.
    pub fn dense_matrix(&self) -> nd::Array2<A> {
        let n = self.size();
        let np = self.patches.len();
        let mut h: nd::Array2<A> = nd::Array2::zeros((n, n));
        for c in 0..self.nconn {
            for o in 0..np {
                let po = self.patches.patch(o);
                let off_o = self.patches.offsets()[o];
                for i in 0..np {
                    let Some((a, b)) = self.block(c, o, i) else { continue; };
                    let pi = self.patches.patch(i);
                    let off_i = self.patches.offsets()[i];
                    for ((lo, li), av) in a.indexed_iter() {
                        for ((ro, ri), bv) in b.indexed_iter() {
                            let row = off_o + lo + ro * po.nl();
                            let col = off_i + li + ri * pi.nl();
                            h[[row, col]] = h[[row, col]] + *av * *bv;
                        }
                    }
                }
            }
        }
        h
    }
}
