//! Off-module work with on-module completion callbacks.
//!
//! [`Worker::spawn`] runs a job on its own task; when the job finishes
//! (normally or by panicking) the completion callback is queued for
//! the owning runloop, which executes it serially alongside RPC,
//! timers and async replies. [`LinearContext`] additionally serializes
//! the *jobs themselves*: submission never blocks, but the jobs of one
//! context run strictly one after another, in submission order.

use futures::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::error;

use crate::panics;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Completion callback executed on the owning runloop.
pub type JobCallback = Box<dyn FnOnce() + Send>;

/// Per-module job helper. One worker per runloop; the pending counter
/// tracks callbacks not yet executed.
pub struct Worker {
    cb_tx: mpsc::Sender<JobCallback>,
    /// Completion queue; the owning runloop selects on this and feeds
    /// each entry to [`Worker::cb`].
    pub chan_cb: mpsc::Receiver<JobCallback>,
    pending: Arc<AtomicUsize>,
}

impl Worker {
    /// Create a worker whose completion queue holds `l` callbacks
    /// (clamped to at least one slot).
    pub fn new(l: usize) -> Self {
        let (cb_tx, chan_cb) = mpsc::channel(l.max(1));
        Self {
            cb_tx,
            chan_cb,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run `f` on its own task; queue `cb` for the owning runloop once
    /// it completes. A panic in `f` is captured and logged, and the
    /// callback still runs.
    pub fn spawn<F>(&self, f: F, cb: impl FnOnce() + Send + 'static)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let cb_tx = self.cb_tx.clone();

        tokio::spawn(async move {
            if let Err(payload) = AssertUnwindSafe(f).catch_unwind().await {
                error!("job panic: {}", panics::describe_panic(payload.as_ref()));
            }
            let _ = cb_tx.send(Box::new(cb) as JobCallback).await;
        });
    }

    /// Execute one completion callback under panic capture.
    pub fn cb(&mut self, cb: JobCallback) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        let result = catch_unwind(AssertUnwindSafe(move || cb()));
        if let Err(payload) = result {
            error!("job callback panic: {}", panics::describe_panic(payload.as_ref()));
        }
    }

    /// Drain outstanding jobs, executing each completion callback.
    pub async fn close(&mut self) {
        while self.pending.load(Ordering::SeqCst) > 0 {
            match self.chan_cb.recv().await {
                Some(cb) => self.cb(cb),
                None => break,
            }
        }
    }

    /// Whether no jobs are in flight.
    pub fn idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }

    /// Create a context whose jobs execute strictly in submission
    /// order.
    pub fn linear_context(&self) -> LinearContext {
        LinearContext {
            cb_tx: self.cb_tx.clone(),
            pending: self.pending.clone(),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            exec_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

struct LinearJob {
    f: Job,
    cb: JobCallback,
}

/// Serializes a sequence of jobs: each submission is queued and
/// spawned, but the execution lock guarantees only one job of this
/// context runs at a time, in FIFO order. Completion callbacks go
/// through the owning worker's queue like any other job.
#[derive(Clone)]
pub struct LinearContext {
    cb_tx: mpsc::Sender<JobCallback>,
    pending: Arc<AtomicUsize>,
    queue: Arc<Mutex<VecDeque<LinearJob>>>,
    exec_lock: Arc<tokio::sync::Mutex<()>>,
}

impl LinearContext {
    /// Queue `f` behind the context's earlier jobs. Never blocks the
    /// caller.
    pub fn spawn<F>(&self, f: F, cb: impl FnOnce() + Send + 'static)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().unwrap().push_back(LinearJob {
            f: Box::pin(f),
            cb: Box::new(cb),
        });

        let ctx = self.clone();
        tokio::spawn(async move {
            let _guard = ctx.exec_lock.lock().await;

            let job = ctx
                .queue
                .lock()
                .unwrap()
                .pop_front()
                .expect("linear queue out of sync");

            if let Err(payload) = AssertUnwindSafe(job.f).catch_unwind().await {
                error!("job panic: {}", panics::describe_panic(payload.as_ref()));
            }
            let _ = ctx.cb_tx.send(job.cb).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawn_runs_job_then_callback() {
        let mut worker = Worker::new(4);
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let job_order = order.clone();
        let cb_order = order.clone();
        worker.spawn(
            async move {
                job_order.lock().unwrap().push("job");
            },
            move || {
                cb_order.lock().unwrap().push("callback");
            },
        );
        assert!(!worker.idle());

        let cb = worker.chan_cb.recv().await.unwrap();
        worker.cb(cb);
        assert!(worker.idle());
        assert_eq!(*order.lock().unwrap(), vec!["job", "callback"]);
    }

    #[tokio::test]
    async fn test_panicking_job_still_delivers_callback() {
        let mut worker = Worker::new(4);
        worker.spawn(async { panic!("job exploded") }, || {});
        let cb = worker.chan_cb.recv().await.unwrap();
        worker.cb(cb);
        assert!(worker.idle());
    }

    #[tokio::test]
    async fn test_close_drains_pending_jobs() {
        let mut worker = Worker::new(8);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = hits.clone();
            worker.spawn(async {}, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        worker.close().await;
        assert!(worker.idle());
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_linear_context_preserves_order() {
        let mut worker = Worker::new(16);
        let ctx = worker.linear_context();
        let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

        for n in 0..8 {
            let sink = order.clone();
            ctx.spawn(
                async move {
                    // Earlier jobs sleeping longer would expose any
                    // reordering.
                    tokio::time::sleep(Duration::from_millis(8 - n as u64)).await;
                    sink.lock().unwrap().push(n);
                },
                || {},
            );
        }
        worker.close().await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }
}
