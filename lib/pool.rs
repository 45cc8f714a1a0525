//! Simple thread pool for running the two rounds of a batched block-Kronecker
//! multiplication across patches.

use std::{ sync::Arc, thread, time::Duration };
use crossbeam::channel;
use ndarray as nd;
use thiserror::Error;
use crate::{ KronScalar, batched::BatchBuffers };

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("dead worker thread")]
    DeadThread,

    #[error("failed to enqueue patches: closed sender channel")]
    ClosedSenderChannel,

    #[error("failed to receive patch result: receiver error: {0}")]
    ClosedReceiverChannel(channel::RecvError),

    #[error("encountered receiver error from within a thread: receiver error: {0}")]
    WorkerReceiverError(channel::RecvError),

    #[error("received a result from the wrong round")]
    OutOfRound,
}
use PoolError::*;
pub type PoolResult<T> = Result<T, PoolError>;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
enum ToWorker<A> {
    Stop,
    Right { patch: usize, v_in: Arc<Vec<A>> },
    Left { patch: usize, z: Arc<Vec<nd::Array2<A>>> },
}

#[derive(Clone, Debug)]
enum FromWorker<A> {
    RecvError(channel::RecvError),
    Right(usize, nd::Array2<A>),
    Left(usize, nd::Array2<A>),
}

/// A simple thread pool to compute per-patch products in parallel.
///
/// Every worker holds a shared reference to the packed batches. Workload
/// between threads is automatically balanced by means of a single-producer,
/// multiple-consumer channel. The pool is meant to be reused between
/// applications, and is **not** thread-safe.
#[derive(Debug)]
pub struct GemmPool<A> {
    threads: Vec<thread::JoinHandle<()>>,
    npatches: usize,
    workers_in: channel::Sender<ToWorker<A>>,
    workers_out: channel::Receiver<FromWorker<A>>,
}

fn worker<A>(
    buffers: Arc<BatchBuffers<A>>,
    receiver: channel::Receiver<ToWorker<A>>,
    sender: channel::Sender<FromWorker<A>>,
)
where A: KronScalar
{
    loop {
        let output
            = match receiver.recv() {
                Ok(ToWorker::Stop) => { break; },
                Ok(ToWorker::Right { patch, v_in }) => {
                    FromWorker::Right(patch, buffers.right_product(patch, &v_in))
                },
                Ok(ToWorker::Left { patch, z }) => {
                    let (nl, nr) = buffers.patch_dims(patch);
                    let mut y: nd::Array2<A> = nd::Array2::zeros((nl, nr));
                    buffers.left_accumulate(patch, &z, &mut y.view_mut());
                    FromWorker::Left(patch, y)
                },
                Err(err) => {
                    match sender.send(FromWorker::RecvError(err)) {
                        Ok(()) => { panic!("receiver error"); },
                        Err(_) => { panic!("sender error: {err}"); },
                    }
                },
            };
        if let Err(err) = sender.send(output) {
            panic!("sender error: {err}");
        }
    }
}

impl<A> GemmPool<A>
where A: KronScalar + 'static
{
    /// Create a new thread pool of `nthreads` threads working on `buffers`.
    pub fn new(nthreads: usize, buffers: Arc<BatchBuffers<A>>) -> PoolResult<Self> {
        let (tx_in, rx_in) = channel::unbounded();
        let (tx_out, rx_out) = channel::unbounded();
        let npatches = buffers.num_patches();
        let mut threads = Vec::with_capacity(nthreads);
        for k in 0..nthreads {
            let worker_receiver = rx_in.clone();
            let worker_sender = tx_out.clone();
            let worker_buffers = Arc::clone(&buffers);
            let th = thread::Builder::new()
                .name(format!("kron-worker-{k}"))
                .spawn(move || worker(worker_buffers, worker_receiver, worker_sender))?;
            threads.push(th);
        }
        Ok(Self { threads, npatches, workers_in: tx_in, workers_out: rx_out })
    }

    /// Create a new thread pool with the number of threads equal to the number
    /// of logical CPU cores available in the current system.
    pub fn new_cpus(buffers: Arc<BatchBuffers<A>>) -> PoolResult<Self> {
        Self::new(num_cpus::get(), buffers)
    }

    /// Return the number of worker threads.
    pub fn len(&self) -> usize { self.threads.len() }

    /// Return `true` if the pool has no workers.
    pub fn is_empty(&self) -> bool { self.threads.is_empty() }

    fn enqueue<I>(&self, jobs: I) -> PoolResult<usize>
    where I: IntoIterator<Item = ToWorker<A>>
    {
        if self.threads.iter().any(|th| th.is_finished()) {
            return Err(DeadThread);
        }
        let mut count: usize = 0;
        for job in jobs.into_iter() {
            match self.workers_in.send(job) {
                Ok(()) => { count += 1; },
                Err(_) => { return Err(ClosedSenderChannel); },
            }
        }
        Ok(count)
    }

    // surviving workers keep the output channel open, so a worker that died
    // mid-round has to be noticed by polling
    fn receive(&self) -> PoolResult<FromWorker<A>> {
        loop {
            match self.workers_out.recv_timeout(POLL_INTERVAL) {
                Ok(FromWorker::RecvError(err)) => { return Err(WorkerReceiverError(err)); },
                Ok(output) => { return Ok(output); },
                Err(channel::RecvTimeoutError::Timeout) => {
                    if self.threads.iter().any(|th| th.is_finished()) {
                        return Err(DeadThread);
                    }
                },
                Err(channel::RecvTimeoutError::Disconnected) => {
                    return Err(ClosedReceiverChannel(channel::RecvError));
                },
            }
        }
    }

    /// Compute the first-round products for all input patches, returned in
    /// patch order.
    ///
    /// This method will block until all patches have been processed.
    pub fn right_round(&self, v_in: Arc<Vec<A>>) -> PoolResult<Vec<nd::Array2<A>>> {
        let count = self.enqueue(
            (0..self.npatches)
            .map(|patch| ToWorker::Right { patch, v_in: Arc::clone(&v_in) })
        )?;
        let mut output: Vec<Option<nd::Array2<A>>> = vec![None; count];
        for _ in 0..count {
            match self.receive()? {
                FromWorker::Right(patch, z) => { output[patch] = Some(z); },
                _ => { return Err(OutOfRound); },
            }
        }
        output.into_iter()
            .map(|z| z.ok_or(OutOfRound))
            .collect()
    }

    /// Compute the second-round contributions to all output patches, returned
    /// in the order in which they finished.
    ///
    /// This method will block until all patches have been processed.
    pub fn left_round(&self, z: Arc<Vec<nd::Array2<A>>>)
        -> PoolResult<Vec<(usize, nd::Array2<A>)>>
    {
        let count = self.enqueue(
            (0..self.npatches)
            .map(|patch| ToWorker::Left { patch, z: Arc::clone(&z) })
        )?;
        let mut output = Vec::with_capacity(count);
        for _ in 0..count {
            match self.receive()? {
                FromWorker::Left(patch, y) => { output.push((patch, y)); },
                _ => { return Err(OutOfRound); },
            }
        }
        Ok(output)
    }
}

impl<A> Drop for GemmPool<A> {
    fn drop(&mut self) {
        (0..self.threads.len())
            .for_each(|_| { self.workers_in.send(ToWorker::Stop).ok(); });
        self.threads.drain(..)
            .for_each(|th| { th.join().ok(); });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{ KronFactors, Patch, PatchDecomposition };

    fn buffers() -> Arc<BatchBuffers<f64>> {
        let patches = vec![
            Patch { left_partition: 0, right_partition: 1, left: 0..1, right: 1..3 },
            Patch { left_partition: 1, right_partition: 0, left: 1..3, right: 0..1 },
        ];
        let patches = PatchDecomposition::from_patches(patches, 3, 3);
        let blocks = vec![
            Some((nd::Array2::eye(1), nd::Array2::eye(2))),
            None,
            None,
            Some((nd::Array2::eye(2), nd::Array2::eye(1))),
        ];
        let factors = KronFactors::from_blocks(patches, 1, blocks).unwrap();
        Arc::new(BatchBuffers::new(&factors))
    }

    #[test]
    fn rounds_return_every_patch() {
        let pool = GemmPool::new(2, buffers()).unwrap();
        assert_eq!(pool.len(), 2);
        let v_in = Arc::new(vec![1.0, 2.0, 3.0, 4.0]);
        let z = pool.right_round(v_in).unwrap();
        assert_eq!(z.len(), 2);
        let mut y = pool.left_round(Arc::new(z)).unwrap();
        y.sort_by_key(|(p, _)| *p);
        assert_eq!(y[0].1, nd::array![[1.0, 2.0]]);
        assert_eq!(y[1].1, nd::array![[3.0], [4.0]]);
    }

    #[test]
    fn dead_worker_is_reported() {
        let pool = GemmPool::new(2, buffers()).unwrap();
        // no such patch: the worker that picks this up panics
        let bad = ToWorker::Right { patch: 7, v_in: Arc::new(Vec::new()) };
        assert_eq!(pool.enqueue([bad]).unwrap(), 1);
        assert!(matches!(pool.receive(), Err(DeadThread)));
    }
}
