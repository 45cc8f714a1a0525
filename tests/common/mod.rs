#![allow(dead_code)]

use ndarray as nd;
use rand::{ Rng, SeedableRng, rngs::StdRng };
use block_kron::{
    basis::{ Basis, SiteData },
    config::{ EngineConfig, SymmetryKind },
    symmetry::Jm,
};

pub fn rng(seed: u64) -> StdRng { StdRng::seed_from_u64(seed) }

/// Local-backend basis of `n` states with random quantum numbers below `qmax`
/// and random electron counts.
pub fn random_basis(rng: &mut StdRng, name: &str, n: usize, qmax: u64) -> Basis {
    let qns: Vec<u64> = (0..n).map(|_| rng.gen_range(0..qmax)).collect();
    let electrons: Vec<u32> = (0..n).map(|_| rng.gen_range(0..4)).collect();
    Basis::from_site(name, &EngineConfig::default(), SiteData::new(qns, electrons))
        .unwrap()
}

/// Local-backend basis with given quantum numbers and no electrons.
pub fn local_basis(name: &str, qns: Vec<u64>) -> Basis {
    let electrons = vec![0; qns.len()];
    Basis::from_site(name, &EngineConfig::default(), SiteData::new(qns, electrons))
        .unwrap()
}

/// Spin-1/2 site under the SU(2) backend.
pub fn su2_spin_half(name: &str) -> Basis {
    let config = EngineConfig::with_symmetry(SymmetryKind::Su2);
    let jm: Vec<Jm> = Jm::multiplet(1).collect();
    Basis::from_site(name, &config, SiteData::spinful(vec![1, 1], jm, vec![0, 0]))
        .unwrap()
}

pub fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> nd::Array2<f64> {
    nd::Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
}

pub fn random_vector(rng: &mut StdRng, n: usize) -> Vec<f64> {
    (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

pub fn assert_close(a: &[f64], b: &[f64], tol: f64) {
    assert_eq!(a.len(), b.len());
    for (k, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "element {k}: {x} != {y}");
    }
}

pub fn is_sorted<T: PartialOrd>(v: &[T]) -> bool {
    v.windows(2).all(|w| w[0] <= w[1])
}
