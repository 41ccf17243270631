//! Timers and cron jobs fanned into a module's runloop.
//!
//! A [`Dispatcher`] owns a bounded channel of expired [`Timer`]s. The
//! clock side runs on its own task; on expiry the timer object is
//! pushed onto the channel and the *owning runloop* invokes the
//! callback serially, so timer callbacks obey the same single-threaded
//! discipline as every other module event.

pub mod cron;

pub use cron::CronExpr;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

use crate::panics;

type TimerCallback = Box<dyn FnOnce() + Send>;

/// Shared callback slot: cleared by [`TimerHandle::stop`] and taken by
/// [`Timer::cb`], whichever comes first.
type CallbackSlot = Arc<Mutex<Option<TimerCallback>>>;

/// An expired timer as delivered on the dispatcher channel.
pub struct Timer {
    cb: CallbackSlot,
}

impl Timer {
    /// Run the callback under panic capture. A timer stopped after its
    /// expiry was already queued has an empty slot; that is a no-op.
    pub fn cb(self) {
        let cb = self.cb.lock().unwrap().take();
        let Some(cb) = cb else { return };

        let result = catch_unwind(AssertUnwindSafe(move || cb()));
        if let Err(payload) = result {
            error!("timer callback panic: {}", panics::describe_panic(payload.as_ref()));
        }
    }
}

/// Cancellation handle returned by [`DispatcherHandle::after`].
pub struct TimerHandle {
    cb: CallbackSlot,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Cancel the clock trigger and clear the callback. The dispatcher
    /// channel may still hold a stale entry; its `cb()` degrades to a
    /// no-op.
    pub fn stop(&self) {
        self.task.abort();
        self.cb.lock().unwrap().take();
    }
}

/// A self-rescheduling cron job.
pub struct Cron {
    timer: Arc<Mutex<Option<TimerHandle>>>,
}

impl Cron {
    pub fn stop(&self) {
        if let Some(timer) = self.timer.lock().unwrap().as_ref() {
            timer.stop();
        }
    }
}

/// Fan-in point for timer expirations, owned by one module's runloop.
pub struct Dispatcher {
    tx: mpsc::Sender<Timer>,
    /// Expiry queue; the owning runloop selects on this and calls
    /// [`Timer::cb`] for each entry.
    pub chan_timer: mpsc::Receiver<Timer>,
}

impl Dispatcher {
    /// Create a dispatcher whose expiry queue holds `l` timers
    /// (clamped to at least one slot).
    pub fn new(l: usize) -> Self {
        let (tx, chan_timer) = mpsc::channel(l.max(1));
        Self { tx, chan_timer }
    }

    /// A cheap, cloneable scheduling handle. Cron jobs hold one to
    /// reschedule themselves from their own firing callback.
    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            tx: self.tx.clone(),
        }
    }

    /// Schedule `cb` to run on the owning runloop after `d`.
    pub fn after(&self, d: Duration, cb: impl FnOnce() + Send + 'static) -> TimerHandle {
        self.handle().after(d, cb)
    }

    /// Install a cron job firing on the owning runloop.
    pub fn cron(&self, expr: CronExpr, cb: impl Fn() + Send + Sync + 'static) -> Cron {
        self.handle().cron(expr, cb)
    }
}

/// Clock-side scheduling handle onto a [`Dispatcher`].
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Timer>,
}

impl DispatcherHandle {
    /// Schedule `cb` to run on the dispatcher's runloop after `d`.
    pub fn after(&self, d: Duration, cb: impl FnOnce() + Send + 'static) -> TimerHandle {
        let slot: CallbackSlot = Arc::new(Mutex::new(Some(Box::new(cb))));
        let timer = Timer { cb: slot.clone() };
        let tx = self.tx.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(d).await;
            let _ = tx.send(timer).await;
        });

        TimerHandle { cb: slot, task }
    }

    /// Install a cron job: each firing runs `cb` on the dispatcher's
    /// runloop and schedules the following firing. Returns a [`Cron`]
    /// whose `stop` cancels the chain; an unsatisfiable expression
    /// yields a cron that never fires.
    pub fn cron(&self, expr: CronExpr, cb: impl Fn() + Send + Sync + 'static) -> Cron {
        let slot = Arc::new(Mutex::new(None));
        let cron = Cron {
            timer: slot.clone(),
        };

        let now = chrono::Utc::now();
        let Some(next) = expr.next(now) else {
            return cron;
        };
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
        schedule_cron(self.clone(), expr, Arc::new(cb), slot, delay);
        cron
    }
}

fn schedule_cron(
    handle: DispatcherHandle,
    expr: CronExpr,
    cb: Arc<dyn Fn() + Send + Sync>,
    slot: Arc<Mutex<Option<TimerHandle>>>,
    delay: Duration,
) {
    let rearm_handle = handle.clone();
    let rearm_slot = slot.clone();
    let user_cb = cb.clone();

    let timer = handle.after(delay, move || {
        // Reschedule before running the user callback so a panic in
        // the callback cannot break the chain.
        let now = chrono::Utc::now();
        if let Some(next) = expr.next(now) {
            let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
            schedule_cron(rearm_handle, expr, user_cb.clone(), rearm_slot, delay);
        }
        user_cb();
    });

    *slot.lock().unwrap() = Some(timer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_after_fires_on_runloop() {
        let mut dispatcher = Dispatcher::new(8);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        dispatcher.after(Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Callback must not run before the runloop invokes it.
        let timer = dispatcher.chan_timer.recv().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.cb();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_cancels_callback() {
        let mut dispatcher = Dispatcher::new(8);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handle = dispatcher.after(Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.stop();

        tokio::time::sleep(Duration::from_millis(40)).await;
        // A stale entry may or may not have been queued before the
        // abort won; either way the callback must not run.
        if let Ok(timer) = dispatcher.chan_timer.try_recv() {
            timer.cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timer_panic_is_contained() {
        let mut dispatcher = Dispatcher::new(8);
        dispatcher.after(Duration::from_millis(5), || panic!("timer exploded"));
        let timer = dispatcher.chan_timer.recv().await.unwrap();
        timer.cb();
    }

    #[tokio::test]
    async fn test_cron_fires_and_reschedules() {
        let mut dispatcher = Dispatcher::new(8);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let cron = dispatcher.cron(CronExpr::parse("* * * * * *").unwrap(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Every-second expression: two firings within ~2.5s proves the
        // job rearms itself.
        for _ in 0..2 {
            let timer = tokio::time::timeout(
                Duration::from_millis(2_500),
                dispatcher.chan_timer.recv(),
            )
            .await
            .expect("cron did not fire in time")
            .unwrap();
            timer.cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        cron.stop();
    }
}
