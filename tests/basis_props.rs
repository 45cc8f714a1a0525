mod common;

use block_kron::{
    StateIndex,
    basis::{ Basis, BasisError, discarded_weight },
    config::{ EngineConfig, SymmetryKind, TruncationParams },
};
use common::*;

fn check_invariants(b: &Basis) {
    let partition = b.partition_vector();
    assert_eq!(partition[0], 0);
    assert_eq!(*partition.last().unwrap() as usize, b.size());
    assert!(partition.windows(2).all(|w| w[0] < w[1]));
    assert!(b.qn_vector().windows(2).all(|w| w[0] != w[1]));
    assert!(is_sorted(b.qn_vector()));

    let qns = b.qns_unshrunk();
    for p in 0..b.num_partitions() {
        assert!(b.partition_range(p).all(|i| qns[i] == b.qn(p)));
    }

    let perm = b.permutation_vector();
    let inv = b.permutation_inverse_vector();
    assert_eq!(perm.len(), inv.len());
    for i in 0..perm.len() {
        assert_eq!(inv[perm[i] as usize] as usize, i);
        assert_eq!(perm[inv[i] as usize] as usize, i);
    }
}

#[test]
fn site_sorting_scenario() {
    let b = local_basis("b", vec![9, 3, 3, 8]);
    assert_eq!(b.qns_unshrunk(), vec![3, 3, 8, 9]);
    let expected: [StateIndex; 4] = [0, 2, 3, 4];
    assert_eq!(b.partition_vector(), &expected);
    let expected: [StateIndex; 4] = [1, 2, 3, 0];
    assert_eq!(b.permutation_vector(), &expected);
    let expected: [StateIndex; 4] = [3, 0, 1, 2];
    assert_eq!(b.permutation_inverse_vector(), &expected);
    check_invariants(&b);
}

#[test]
fn product_raw_order_scenario() {
    let config = EngineConfig::default();
    let a = local_basis("a", vec![0, 2]);
    let b = local_basis("b", vec![0, 1]);
    let ab = Basis::product("ab", &config, &a, &b).unwrap();
    assert_eq!(ab.qns_unshrunk(), vec![0, 1, 2, 3]);
    // recover the pre-sort order from the permutation
    let sorted = ab.qns_unshrunk();
    let mut raw = vec![0; ab.size()];
    for i in 0..ab.size() {
        raw[ab.permutation(i)] = sorted[i];
    }
    assert_eq!(raw, vec![0, 2, 1, 3]);
    check_invariants(&ab);
}

#[test]
fn random_products_keep_invariants() {
    let config = EngineConfig::default();
    let mut rng = rng(10546);
    for _ in 0..20 {
        let a = random_basis(&mut rng, "a", 7, 5);
        let b = random_basis(&mut rng, "b", 5, 4);
        check_invariants(&a);
        check_invariants(&b);
        let ab = Basis::product("ab", &config, &a, &b).unwrap();
        assert_eq!(ab.size(), 35);
        check_invariants(&ab);
        // electrons follow their states through the sort
        for i in 0..ab.size() {
            let raw = ab.permutation(i);
            let (ia, ib) = (raw % a.size(), raw / a.size());
            assert_eq!(ab.electrons(i), a.electrons(ia) + b.electrons(ib));
            assert_eq!(ab.qns_unshrunk()[i], a.qns_unshrunk()[ia] + b.qns_unshrunk()[ib]);
            assert_eq!(ab.odd_signs()[i], ab.electrons(i) % 2 == 1);
        }
    }
}

#[test]
fn composition_is_associative_up_to_order() {
    let config = EngineConfig::default();
    let mut rng = rng(2718);
    let a = random_basis(&mut rng, "a", 4, 3);
    let b = random_basis(&mut rng, "b", 3, 3);
    let c = random_basis(&mut rng, "c", 5, 3);
    let ab = Basis::product("ab", &config, &a, &b).unwrap();
    let ab_c = Basis::product("abc", &config, &ab, &c).unwrap();
    let bc = Basis::product("bc", &config, &b, &c).unwrap();
    let a_bc = Basis::product("abc", &config, &a, &bc).unwrap();
    // both are sorted, so equal multisets means equal vectors
    assert_eq!(ab_c.qns_unshrunk(), a_bc.qns_unshrunk());
    assert_eq!(ab_c.partition_vector(), a_bc.partition_vector());
    let mut e1 = ab_c.electrons_vector();
    let mut e2 = a_bc.electrons_vector();
    e1.sort();
    e2.sort();
    assert_eq!(e1, e2);
}

#[test]
fn block_is_ordered_union() {
    let config = EngineConfig::default();
    let site = |k: usize| {
        Basis::from_site(
            "s",
            &config,
            block_kron::basis::SiteData::new(vec![0, 1], vec![0, 1]).on_sites(vec![k]),
        ).unwrap()
    };
    let ab = Basis::product("ab", &config, &site(0), &site(1)).unwrap();
    let abc = Basis::product("abc", &config, &ab, &site(2)).unwrap();
    assert_eq!(abc.block(), &[0, 1, 2]);
}

#[test]
fn discarded_weight_extremes() {
    let mut rng = rng(99);
    let mut w = random_vector(&mut rng, 10);
    w.iter_mut().for_each(|x| { *x = x.abs(); });
    let z: f64 = w.iter().sum();
    w.iter_mut().for_each(|x| { *x /= z; });
    assert_eq!(discarded_weight(&w, &[]), 0.0);
    let all: Vec<usize> = (0..10).collect();
    assert_eq!(discarded_weight(&w, &all), 1.0);
}

#[test]
fn truncation_round() {
    let config = EngineConfig::default();
    let mut rng = rng(31415);
    let a = random_basis(&mut rng, "a", 6, 4);
    let b = random_basis(&mut rng, "b", 6, 4);
    let mut ab = Basis::product("ab", &config, &a, &b).unwrap();
    let perm_before = ab.permutation_vector().to_vec();
    let qns_before = ab.qns_unshrunk();
    let electrons_before = ab.electrons_vector();

    let mut w: Vec<f64> = (0..ab.size()).map(|k| 1.0 / (k as f64 + 1.0)).collect();
    let z: f64 = w.iter().sum();
    w.iter_mut().for_each(|x| { *x /= z; });

    let removal = ab.change_basis(&w, 20, &TruncationParams::default());
    assert_eq!(removal.len(), 16);
    assert!(is_sorted(&removal.indices));
    // the largest weights sit at the front, so the tail is dropped
    assert_eq!(removal.indices, (20..36).collect::<Vec<usize>>());
    assert_eq!(removal.order.len(), removal.len());

    let err = ab.truncate_basis(&w, &removal.indices);
    let kept: f64 = w[..20].iter().sum();
    assert!((err - (1.0 - kept)).abs() < 1e-12);
    assert!(ab.is_transformed());
    assert_eq!(ab.size(), 20);
    assert_eq!(ab.qns_unshrunk(), qns_before[..20].to_vec());
    assert_eq!(ab.electrons_vector(), electrons_before[..20].to_vec());
    // permutation still describes the pre-truncation basis
    assert_eq!(ab.permutation_vector(), perm_before.as_slice());
    let partition = ab.partition_vector();
    assert_eq!(*partition.last().unwrap(), 20);
    assert!(partition.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn tolerance_truncation() {
    let a = local_basis("a", vec![0, 1, 1, 2]);
    let w = [0.6, 0.3, 0.07, 0.03];
    let params = TruncationParams { tolerance: 0.11, min_kept: 1 };
    let removal = a.change_basis(&w, 4, &params);
    assert_eq!(removal.indices, vec![2, 3]);
    assert_eq!(removal.order, vec![1, 0]);
}

#[test]
fn find_partition_number_out_of_range() {
    let b = local_basis("b", vec![0, 0, 1]);
    assert_eq!(b.find_partition_number(2).unwrap(), 1);
    assert!(matches!(b.find_partition_number(3), Err(BasisError::NoPartition(3))));
}

#[cfg(not(feature = "long-index"))]
#[test]
fn capacity_overflow_is_an_error() {
    let config = EngineConfig::default();
    let big = local_basis("big", vec![0; 1 << 16]);
    let half = local_basis("half", vec![0; 1 << 15]);
    let mut target = Basis::new("target", &config);
    match target.set_to_product(&big, &half, None) {
        Err(BasisError::CapacityExceeded { current, max }) => {
            assert_eq!(current, 1 << 31);
            assert_eq!(max, 1 << 31);
        },
        other => panic!("expected a capacity error, got {other:?}"),
    }
    assert_eq!(target.size(), 0);
}

#[test]
fn su2_two_spins() {
    let config = EngineConfig::with_symmetry(SymmetryKind::Su2);
    let s = su2_spin_half("s");
    assert_eq!(s.size(), 2);
    assert_eq!(s.num_partitions(), 1);
    let ss = Basis::product("ss", &config, &s, &s).unwrap();
    check_invariants(&ss);
    let identity: Vec<StateIndex> = (0..4).collect();
    assert_eq!(ss.permutation_vector(), identity.as_slice());
    assert_eq!(ss.partition_vector(), &[0, 1, 4]);
    assert_eq!(ss.reduced_size(), Some(2));
    assert_eq!(ss.j_vals(), &[0, 2]);
    assert_eq!(ss.j_max(), 2);
    assert_eq!(ss.electrons_vector(), vec![2; 4]);
    assert_eq!(ss.jm(0).j2(), 0);
    assert_eq!(ss.pseudo_qn(1).unwrap(), ss.qn(1));
    let f = ss.factors().unwrap();
    assert_eq!((f.nrows(), f.ncols()), (4, 4));
}

#[test]
fn su2_three_spins() {
    let config = EngineConfig::with_symmetry(SymmetryKind::Su2);
    let s = su2_spin_half("s");
    let ss = Basis::product("ss", &config, &s, &s).unwrap();
    let sss = Basis::product("sss", &config, &ss, &s).unwrap();
    check_invariants(&sss);
    assert_eq!(sss.size(), 8);
    assert_eq!(sss.partition_vector(), &[0, 4, 8]);
    assert_eq!(sss.reduced_size(), Some(3));
    assert_eq!(sss.j_vals(), &[1, 3]);
    // two degenerate spin-1/2 multiplets are told apart by flavor
    let flavors: Vec<u32> = (0..8).map(|i| sss.flavor(i)).collect();
    assert_eq!(flavors, vec![0, 0, 1, 1, 0, 0, 0, 0]);
    let reduced: Vec<usize> = (0..8).map(|i| sss.reduced_index(i).unwrap()).collect();
    assert_eq!(reduced, vec![0, 0, 1, 1, 2, 2, 2, 2]);

    // keeping 3 states must drop whole multiplets
    let w = [0.3, 0.3, 0.15, 0.15, 0.025, 0.025, 0.025, 0.025];
    let mut sss = sss;
    let removal = sss.change_basis(&w, 3, &TruncationParams::default());
    assert_eq!(removal.indices, vec![2, 3, 4, 5, 6, 7]);
    sss.truncate_basis(&w, &removal.indices);
    assert_eq!(sss.size(), 2);
    assert_eq!(sss.reduced_size(), Some(1));
    assert!(sss.factors().is_none());
}

#[test]
fn local_backend_has_no_su2_data() {
    let b = local_basis("b", vec![0, 1]);
    assert_eq!(b.reduced_index(0), None);
    assert_eq!(b.reduced_size(), None);
    assert!(b.j_vals().is_empty());
    assert_eq!(b.j_max(), 0);
    assert!(b.factors().is_none());
    assert_eq!(b.flavor(1), 0);
}

#[test]
fn display_lists_vectors() {
    let b = local_basis("display", vec![1, 0]);
    let text = b.to_string();
    assert!(text.contains("name=display"));
    assert!(text.contains("partition\n3\n0 1 2"));
    assert!(text.contains("permutation\n2\n1 0"));
}
