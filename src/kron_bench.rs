//! Grow a spin-1/2 Heisenberg block, build the superblock Hamiltonian in the
//! zero-magnetization sector as a sum of Kronecker products, and compare and
//! time the batched and unbatched multipliers.
//!
//! Usage: `kron_bench [config.toml] [sites] [max_states] [reps]`

use std::{ error::Error, time::Instant };
use log::info;
use ndarray as nd;
use block_kron::{
    basis::{ Basis, SiteData },
    batched::BatchedKron,
    config::EngineConfig,
    patch::{ Connection, KronFactors, PatchDecomposition },
};

type BenchResult<T> = Result<T, Box<dyn Error>>;

/// A block basis together with the operators needed to grow it, all in the
/// basis's sorted order.
struct Block {
    basis: Basis,
    ham: nd::Array2<f64>,
    sz: nd::Array2<f64>,
    sp: nd::Array2<f64>,
}

fn spin_ops() -> (nd::Array2<f64>, nd::Array2<f64>) {
    // (down, up)
    let sz = nd::array![[-0.5, 0.0], [0.0, 0.5]];
    let sp = nd::array![[0.0, 0.0], [1.0, 0.0]];
    (sz, sp)
}

fn site_basis(name: &str, config: &EngineConfig, site: usize) -> BenchResult<Basis> {
    // quantum number counts up spins
    let data = SiteData::new(vec![0, 1], vec![1, 1]).on_sites(vec![site]);
    Ok(Basis::from_site(name, config, data)?)
}

fn permute(op: &nd::Array2<f64>, basis: &Basis) -> nd::Array2<f64> {
    let n = basis.size();
    nd::Array2::from_shape_fn(
        (n, n),
        |(i, j)| op[[basis.permutation(i), basis.permutation(j)]],
    )
}

fn grow(block: Block, config: &EngineConfig, site: usize) -> BenchResult<Block> {
    let (sz1, sp1) = spin_ops();
    let sm1 = sp1.t().to_owned();
    let eye1: nd::Array2<f64> = nd::Array2::eye(2);
    let eye_b: nd::Array2<f64> = nd::Array2::eye(block.basis.size());
    let site_b = site_basis("site", config, site)?;
    let basis = Basis::product(block.basis.name(), config, &block.basis, &site_b)?;

    // raw product order has the block index running fastest
    let sm = block.sp.t().to_owned();
    let ham_raw
        = nd::linalg::kron(&eye1, &block.ham)
        + nd::linalg::kron(&sz1, &block.sz)
        + nd::linalg::kron(&sp1, &sm) * 0.5
        + nd::linalg::kron(&sm1, &block.sp) * 0.5;
    let ham = permute(&ham_raw, &basis);
    let sz = permute(&nd::linalg::kron(&sz1, &eye_b), &basis);
    let sp = permute(&nd::linalg::kron(&sp1, &eye_b), &basis);
    Ok(Block { basis, ham, sz, sp })
}

// truncate with Boltzmann weights of the diagonal energies
fn truncate(mut block: Block, config: &EngineConfig, max_states: usize) -> Block {
    if block.basis.size() <= max_states { return block; }
    let diag: Vec<f64> = block.ham.diag().to_vec();
    let emin = diag.iter().copied().fold(f64::INFINITY, f64::min);
    let mut weights: Vec<f64> = diag.iter().map(|e| (-(e - emin)).exp()).collect();
    let z: f64 = weights.iter().sum();
    weights.iter_mut().for_each(|w| { *w /= z; });

    let removal = block.basis.change_basis(&weights, max_states, &config.truncation);
    let err = block.basis.truncate_basis(&weights, &removal.indices);
    let kept: Vec<usize>
        = (0..weights.len())
        .filter(|k| removal.indices.binary_search(k).is_err())
        .collect();
    let select = |op: &nd::Array2<f64>| -> nd::Array2<f64> {
        op.select(nd::Axis(0), &kept).select(nd::Axis(1), &kept)
    };
    block.ham = select(&block.ham);
    block.sz = select(&block.sz);
    block.sp = select(&block.sp);
    info!(
        "truncated '{}' to {} states; discarded weight {:.3e}",
        block.basis.name(), block.basis.size(), err,
    );
    block
}

fn main() -> BenchResult<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .try_init()?;

    let mut args = std::env::args().skip(1).peekable();
    let config
        = match args.next_if(|arg| arg.ends_with(".toml")) {
            Some(path) => EngineConfig::from_file(&path)?,
            None => EngineConfig::default(),
        };
    let sites: usize = args.next().map(|s| s.parse()).transpose()?.unwrap_or(6);
    let max_states: usize = args.next().map(|s| s.parse()).transpose()?.unwrap_or(64);
    let reps: usize = args.next().map(|s| s.parse()).transpose()?.unwrap_or(100);
    info!("config: {config:?}; {sites} sites per block, at most {max_states} states");

    let (sz, sp) = spin_ops();
    let mut block = Block {
        basis: site_basis("system", &config, 0)?,
        ham: nd::Array2::zeros((2, 2)),
        sz,
        sp,
    };
    for site in 1..sites {
        block = grow(block, &config, site)?;
        block = truncate(block, &config, max_states);
    }

    // reflected copy as the environment
    let n = block.basis.size();
    let eye: nd::Array2<f64> = nd::Array2::eye(n);
    let sm = block.sp.t().to_owned();
    let conns = vec![
        Connection::new(block.ham.clone(), eye.clone()),
        Connection::new(eye, block.ham.clone()),
        Connection::new(block.sz.clone(), block.sz.clone()),
        Connection::new(&block.sp * 0.5, sm.clone()),
        Connection::new(sm * 0.5, block.sp.clone()),
    ];
    let target = sites as u64; // half of the 2 * sites spins up
    let patches = PatchDecomposition::for_target(&block.basis, &block.basis, target);
    info!(
        "superblock sector: {} states in {} patches",
        patches.size(), patches.len(),
    );
    let factors = KronFactors::from_operators(patches, &conns)?;

    let v_in: Vec<f64>
        = (0..factors.size()).map(|k| ((k as f64) * 0.37).cos()).collect();
    let mut v_ref = vec![0.0; factors.size()];
    let t0 = Instant::now();
    for _ in 0..reps {
        v_ref.iter_mut().for_each(|x| { *x = 0.0; });
        factors.matrix_vector_unbatched(&mut v_ref, &v_in);
    }
    let dt_ref = t0.elapsed().as_secs_f64() / reps as f64;

    let mut mult = BatchedKron::new(&factors, config.worker_threads())?;
    let mut v_out = vec![0.0; factors.size()];
    let t0 = Instant::now();
    for _ in 0..reps {
        v_out.iter_mut().for_each(|x| { *x = 0.0; });
        mult.matrix_vector(&mut v_out, &v_in);
    }
    let dt_batch = t0.elapsed().as_secs_f64() / reps as f64;

    let max_diff
        = v_out.iter().zip(&v_ref)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f64::max);
    info!("unbatched: {:.3e} s per application", dt_ref);
    info!(
        "batched:   {:.3e} s per application ({} threads)",
        dt_batch, mult.threads().max(1),
    );
    info!("max |batched - unbatched| = {max_diff:.3e}");
    Ok(())
}
