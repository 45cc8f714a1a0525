#![allow(dead_code, non_snake_case, non_upper_case_globals)]

//! Block-sparse linear algebra over symmetry-decomposed vector spaces, as used
//! by the inner loop of DMRG-style eigensolvers.
//!
//! Two pieces do the real work:
//!
//! - [`basis::Basis`] keeps a finite set of basis states grouped into
//!   contiguous *partitions* by a conserved quantum number, in a canonical
//!   sorted order with explicit permutation bookkeeping. Bases grow by outer
//!   products ([`basis::Basis::set_to_product`]) and shrink by truncation
//!   ([`basis::Basis::truncate_basis`]) without losing their block structure.
//! - [`batched::BatchedKron`] applies an operator written as a sum of
//!   Kronecker products,
//!   <blockquote>
//!     <p style="font-size:20px">
//!       <i>v</i><sub>out</sub> += Σ<sub><i>c</i></sub>
//!       <i>A</i><sub><i>c</i></sub> ⊗ <i>B</i><sub><i>c</i></sub>
//!       · <i>v</i><sub>in</sub>
//!     </p>
//!   </blockquote>
//!   to a state vector, with all block pairs handled by a couple of large
//!   dense multiplications instead of one small multiplication per block.
//!
//! Everything in between (which blocks exist and which dense factors they
//! carry) lives in [`patch`].
//!
//! ```
//! use ndarray as nd;
//! use block_kron::{
//!     basis::{ Basis, SiteData },
//!     batched::BatchedKron,
//!     config::EngineConfig,
//!     patch::{ Connection, KronFactors, PatchDecomposition },
//! };
//!
//! let config = EngineConfig::default();
//!
//! // a spin-1/2 site; the quantum number counts up spins
//! let site = || SiteData::new(vec![0, 1], vec![1, 1]);
//! let left = Basis::from_site("system", &config, site()).unwrap();
//! let right = Basis::from_site("environ", &config, site()).unwrap();
//!
//! // Sz ⊗ Sz restricted to the Sz_total = 0 sector
//! let sz: nd::Array2<f64> = nd::array![[-0.5, 0.0], [0.0, 0.5]];
//! let patches = PatchDecomposition::for_target(&left, &right, 1);
//! let conn = Connection::new(sz.clone(), sz);
//! let factors = KronFactors::from_operators(patches, &[conn]).unwrap();
//!
//! let mut mult = BatchedKron::new(&factors, config.threads).unwrap();
//! let v_in = vec![1.0; factors.size()];
//! let mut v_out = vec![0.0; factors.size()];
//! mult.matrix_vector(&mut v_out, &v_in);
//! assert_eq!(v_out, vec![-0.25, -0.25]);
//! ```

use ndarray::LinalgScalar;
use num_complex::{ Complex, ComplexFloat };
use num_traits::Float;

pub mod config;
pub mod qn;
pub mod symmetry;
pub mod basis;
pub mod store;
pub mod patch;
pub mod pool;
pub mod batched;

/// Unsigned integer type used to store permutation and partition vectors.
///
/// The default width caps any basis at 2<sup>31</sup> states; build with the
/// `long-index` feature to lift this to 2<sup>63</sup>.
#[cfg(not(feature = "long-index"))]
pub type StateIndex = u32;

/// Unsigned integer type used to store permutation and partition vectors.
#[cfg(feature = "long-index")]
pub type StateIndex = u64;

/// Bit width of [`StateIndex`].
pub const INDEX_BITS: u32 = StateIndex::BITS;

/// Convert a `usize` to a [`StateIndex`].
///
/// Callers are responsible for having checked the capacity beforehand (see
/// [`basis::Basis::set_to_product`]).
#[inline]
pub(crate) fn to_index(k: usize) -> StateIndex {
    debug_assert!(k as u128 <= StateIndex::MAX as u128);
    k as StateIndex
}

/// Convenience trait to identify the scalar types that can flow through the
/// batched multiplier: anything `ndarray` can multiply, that has a modulus, and
/// that can be shipped to worker threads.
///
/// This is implemented for `f32`, `f64`, `Complex<f32>`, and `Complex<f64>`.
pub trait KronScalar
where Self: LinalgScalar + ComplexFloat + Send + Sync + std::fmt::Debug
{
    /// Return `true` if `self` is exactly zero.
    fn is_exact_zero(&self) -> bool { *self == Self::zero() }
}

impl KronScalar for f32 { }
impl KronScalar for f64 { }

impl<T> KronScalar for Complex<T>
where
    T: Float + Send + Sync + std::fmt::Debug + 'static,
    Complex<T>: LinalgScalar + ComplexFloat,
{ }
