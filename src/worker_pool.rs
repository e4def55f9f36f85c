//! WorkerPool (C3, spec §4.3).
//!
//! Bounded pool of OS threads for short-lived work (alarm delivery helpers,
//! encode helpers). Detached-thread spawn is forbidden anywhere in the core
//! (spec §5): every unit of fire-and-forget work in this codebase routes
//! through here, and the pool owns and joins every thread it starts.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    sender: Mutex<Option<std_mpsc::Sender<Job>>>,
    queued: std::sync::atomic::AtomicUsize,
}

/// A bounded thread pool. `submit` returns a future the caller can `.await`
/// from async code even though the work itself runs on a plain OS thread.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
    saturation_threshold: usize,
}

impl WorkerPool {
    /// `size` worker threads, draining a shared job queue. `saturation_threshold`
    /// is the number of queued-but-not-started jobs above which `submit`
    /// returns `ResourceExhausted` instead of queuing unbounded work.
    pub fn new(size: usize, saturation_threshold: usize) -> Self {
        assert!(size > 0, "worker pool needs at least one thread");
        let (sender, receiver) = std_mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let shared = Arc::new(Shared {
            sender: Mutex::new(Some(sender)),
            queued: std::sync::atomic::AtomicUsize::new(0),
        });

        let mut workers = Vec::with_capacity(size);
        for idx in 0..size {
            let receiver = receiver.clone();
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("worker-pool-{idx}"))
                .spawn(move || loop {
                    let job = {
                        let rx = receiver.lock();
                        rx.recv()
                    };
                    match job {
                        Ok(job) => {
                            shared.queued.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                            job();
                        }
                        Err(_) => {
                            debug!(worker = idx, "worker pool channel closed, exiting");
                            break;
                        }
                    }
                })
                .expect("failed to spawn worker pool thread");
            workers.push(handle);
        }

        info!(size, "worker pool started");
        WorkerPool {
            shared,
            workers: Mutex::new(workers),
            capacity: size,
            saturation_threshold,
        }
    }

    /// Submit a unit of work, returning a future that resolves to its
    /// output. Rejects with `ResourceExhausted` if the queue is already
    /// saturated past the configured threshold.
    pub fn submit<F, T>(&self, job: F) -> AppResult<impl std::future::Future<Output = Option<T>>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let queued = self.shared.queued.load(std::sync::atomic::Ordering::SeqCst);
        if queued >= self.saturation_threshold {
            return Err(AppError::ResourceExhausted(format!(
                "worker pool saturated ({queued} queued)"
            )));
        }

        let (tx, rx) = oneshot::channel();
        let sender_guard = self.shared.sender.lock();
        let Some(sender) = sender_guard.as_ref() else {
            return Err(AppError::ResourceExhausted("worker pool is shut down".into()));
        };

        self.shared.queued.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let boxed: Job = Box::new(move || {
            let result = job();
            let _ = tx.send(result);
        });
        if sender.send(boxed).is_err() {
            self.shared.queued.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            return Err(AppError::ResourceExhausted("worker pool is shut down".into()));
        }

        Ok(async move { rx.await.ok() })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn queued_count(&self) -> usize {
        self.shared.queued.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Drain then join every worker thread. Further `submit` calls fail.
    pub fn shutdown(&self) {
        // Dropping the sender unblocks every worker's `recv()` once the
        // queue is drained.
        self.shared.sender.lock().take();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if let Err(e) = handle.join() {
                warn!(?e, "worker pool thread panicked during shutdown");
            }
        }
        info!("worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
