//! Timer thread for delayed resubmissions and periodic pool maintenance.

use crate::error::ConfigError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A single dedicated thread running timed tasks
///
/// Tasks run on the scheduler thread and must be short; anything doing I/O
/// should hand its work to the pool runtime. Cloning gives another handle to
/// the same thread.
#[derive(Clone, Debug)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    handle: Handle,
    shutdown: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl Scheduler {
    /// Start the scheduler thread
    ///
    /// # Errors
    /// Returns `ConfigError::Runtime` if the thread or its runtime cannot be created
    pub fn start(name: &str) -> Result<Self, ConfigError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(ConfigError::Runtime)?;
        let handle = runtime.handle().clone();
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                runtime.block_on(token.cancelled());
                tracing::trace!("scheduler thread stopped");
            })
            .map_err(ConfigError::Runtime)?;
        let thread_id = thread.thread().id();

        Ok(Self {
            inner: Arc::new(Inner {
                handle,
                shutdown,
                thread: Mutex::new(Some(thread)),
                thread_id,
            }),
        })
    }

    /// Run `task` once after `delay`
    ///
    /// The task is skipped if `cancel` fires or the scheduler shuts down first.
    /// Returns `false` if the scheduler is already shut down.
    #[must_use]
    pub fn schedule<F>(&self, delay: Duration, cancel: CancellationToken, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shut_down() {
            return false;
        }

        let shutdown = self.inner.shutdown.clone();
        self.inner.handle.spawn(async move {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {}
                () = cancel.cancelled() => {
                    tracing::trace!("scheduled task cancelled before it fired");
                }
                () = tokio::time::sleep(delay) => task(),
            }
        });
        true
    }

    /// Run `task` every `period`, first after one full period
    ///
    /// Returns `false` if the scheduler is already shut down, or if `period`
    /// is zero or too large to schedule.
    #[must_use]
    pub fn schedule_at_fixed_rate<F>(&self, period: Duration, task: F) -> bool
    where
        F: Fn() + Send + 'static,
    {
        if self.is_shut_down() || period.is_zero() {
            return false;
        }
        let Some(start) = Instant::now().checked_add(period) else {
            return false;
        };

        let shutdown = self.inner.shutdown.clone();
        self.inner.handle.spawn(async move {
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => task(),
                }
            }
        });
        true
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop the thread; pending tasks are dropped without running
    ///
    /// Waits for the thread to exit unless called from a scheduled task.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if thread::current().id() == self.inner.thread_id {
            return;
        }
        let thread = self.inner.thread.lock().take();
        if let Some(thread) = thread
            && thread.join().is_err()
        {
            tracing::error!("scheduler thread panicked");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Detaches the thread; it exits on its own once cancelled
        self.shutdown.cancel();
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_schedule_runs_after_delay() {
        let scheduler = Scheduler::start("test-scheduler").unwrap();
        let (tx, rx) = mpsc::channel();
        let started = std::time::Instant::now();

        assert!(scheduler.schedule(
            Duration::from_millis(100),
            CancellationToken::new(),
            move || tx.send(()).unwrap()
        ));

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        scheduler.shutdown();
    }

    #[test]
    fn test_cancelled_task_never_runs() {
        let scheduler = Scheduler::start("test-scheduler").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let counter = runs.clone();
        assert!(
            scheduler.schedule(Duration::from_millis(100), cancel.clone(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        );
        cancel.cancel();

        thread::sleep(Duration::from_millis(300));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        scheduler.shutdown();
    }

    #[test]
    fn test_fixed_rate_repeats() {
        let scheduler = Scheduler::start("test-scheduler").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        assert!(
            scheduler.schedule_at_fixed_rate(Duration::from_millis(50), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        );

        thread::sleep(Duration::from_millis(400));
        scheduler.shutdown();
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected several ticks, got {seen}");

        thread::sleep(Duration::from_millis(200));
        assert_eq!(runs.load(Ordering::SeqCst), seen, "no ticks after shutdown");
    }

    #[test]
    fn test_unschedulable_period_is_rejected() {
        let scheduler = Scheduler::start("test-scheduler").unwrap();
        assert!(!scheduler.schedule_at_fixed_rate(Duration::ZERO, || {}));
        assert!(!scheduler.schedule_at_fixed_rate(Duration::MAX, || {}));
        assert!(!scheduler.is_shut_down());
        scheduler.shutdown();
    }

    #[test]
    fn test_schedule_after_shutdown_is_rejected() {
        let scheduler = Scheduler::start("test-scheduler").unwrap();
        scheduler.shutdown();
        assert!(scheduler.is_shut_down());
        assert!(!scheduler.schedule(Duration::ZERO, CancellationToken::new(), || {}));
        assert!(!scheduler.schedule_at_fixed_rate(Duration::from_secs(1), || {}));
    }
}
