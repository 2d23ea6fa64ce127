//! Worker pool and in-order result collection.
//!
//! Compression and decompression are the CPU-bound parts of every
//! bulk operation, so both engines push that work onto a small pool of
//! threads and keep a single coordinator thread owning all mutable
//! sequence state. Jobs are plain boxed closures; ordering is restored
//! on the coordinator side by tagging each job with a monotonic
//! sequence number.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{Error, Result};

/// How long to block on the result channel before re-checking the
/// cancellation flag.
const CANCEL_POLL: Duration = Duration::from_millis(50);

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Picks the worker count for an optional user setting: `None` means
/// one per available CPU, `Some(0)` means run in the calling thread
/// (readers) or a single worker (writers).
pub(crate) fn effective_parallelism(requested: Option<usize>) -> usize {
    match requested {
        Some(n) => n,
        None => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    }
}

/// A fixed-size pool of job-running threads.
///
/// `stop()` makes workers discard queued jobs without running them, so
/// closing a reader mid-query drains promptly instead of finishing a
/// scan nobody will consume.
pub(crate) struct Pool {
    jobs: Mutex<Option<Sender<Job>>>,
    stop: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    pub(crate) fn new(workers: usize) -> std::io::Result<Pool> {
        let (tx, rx) = channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let stop = Arc::clone(&stop);
            let handle = std::thread::Builder::new()
                .name(format!("zss-worker-{i}"))
                .spawn(move || loop {
                    let job = match rx.lock() {
                        Ok(guard) => guard.recv(),
                        Err(_) => break,
                    };
                    match job {
                        Ok(job) if !stop.load(AtomicOrdering::SeqCst) => job(),
                        Ok(_) => {} // draining: drop the job unrun
                        Err(_) => break,
                    }
                })?;
            handles.push(handle);
        }
        Ok(Pool {
            jobs: Mutex::new(Some(tx)),
            stop,
            handles: Mutex::new(handles),
        })
    }

    /// Enqueues a job. Returns `false` if the pool has been shut down.
    pub(crate) fn submit(&self, job: Job) -> bool {
        match self.jobs.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(tx) => tx.send(job).is_ok(),
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Stops accepting jobs, discards the queue, and joins all workers.
    pub(crate) fn shutdown(&self) {
        self.stop.store(true, AtomicOrdering::SeqCst);
        if let Ok(mut guard) = self.jobs.lock() {
            guard.take();
        }
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                handle.join().ok();
            }
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Collects results of sequence-numbered jobs, restoring submit order
/// (or not, for commutative consumers).
///
/// The buffer is bounded by the caller: submit only while
/// [`in_flight`](Ordered::in_flight) is below the chosen window.
pub(crate) struct Ordered<T> {
    tx: Sender<(u64, std::thread::Result<T>)>,
    rx: Receiver<(u64, std::thread::Result<T>)>,
    pending: BTreeMap<u64, T>,
    submitted: u64,
    yielded: u64,
}

impl<T: Send + 'static> Ordered<T> {
    pub(crate) fn new() -> Ordered<T> {
        let (tx, rx) = channel();
        Ordered {
            tx,
            rx,
            pending: BTreeMap::new(),
            submitted: 0,
            yielded: 0,
        }
    }

    /// Jobs submitted but neither yielded nor waiting in the buffer.
    pub(crate) fn in_flight(&self) -> usize {
        (self.submitted - self.yielded) as usize - self.pending.len()
    }

    /// Runs `f` on the pool (or inline when `pool` is `None`), tagging
    /// it with the next sequence number. Returns `false` if the pool
    /// refused the job (shut down).
    ///
    /// A panic inside `f` is captured and surfaced from `next` rather
    /// than silently wedging the reorder buffer.
    pub(crate) fn submit<F>(&mut self, pool: Option<&Pool>, f: F) -> bool
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let seq = self.submitted;
        let tx = self.tx.clone();
        let job = move || {
            tx.send((seq, catch_unwind(AssertUnwindSafe(f)))).ok();
        };
        let accepted = match pool {
            Some(pool) => pool.submit(Box::new(job)),
            None => {
                job();
                true
            }
        };
        if accepted {
            self.submitted += 1;
        }
        accepted
    }

    /// Next result in submit order, or `Ok(None)` when nothing is
    /// outstanding. Fails `Cancelled` once `closed` is raised.
    pub(crate) fn next(&mut self, closed: &AtomicBool) -> Result<Option<T>> {
        self.recv_until(closed, true)
    }

    /// Next result in completion order (for commutative consumers).
    pub(crate) fn next_any(&mut self, closed: &AtomicBool) -> Result<Option<T>> {
        self.recv_until(closed, false)
    }

    fn recv_until(&mut self, closed: &AtomicBool, in_order: bool) -> Result<Option<T>> {
        loop {
            if closed.load(AtomicOrdering::SeqCst) {
                return Err(Error::Cancelled);
            }
            if in_order {
                if let Some(value) = self.pending.remove(&self.yielded) {
                    self.yielded += 1;
                    return Ok(Some(value));
                }
            } else if let Some(&seq) = self.pending.keys().next() {
                let value = self.pending.remove(&seq);
                self.yielded += 1;
                return Ok(value);
            }
            if self.in_flight() == 0 {
                return Ok(None);
            }
            match self.rx.recv_timeout(CANCEL_POLL) {
                Ok((seq, Ok(value))) => {
                    self.pending.insert(seq, value);
                }
                Ok((_, Err(_))) => {
                    return Err(Error::Io(std::io::Error::other("worker job panicked")))
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(Error::Cancelled),
            }
        }
    }
}
