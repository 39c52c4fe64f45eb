//! Maintenance scheduler
//!
//! One background thread ticks the deferred-work drivers: WAL processing
//! that was scheduled behind a closed gate, cache persistence flushes, and
//! persistence retries. Tests drive the same closures synchronously via
//! `run_once` instead of starting the thread.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

/// A named maintenance task.
pub struct MaintenanceTask {
    /// Label used in logs
    pub name: &'static str,
    /// The driver closure
    pub run: Box<dyn Fn() + Send + Sync>,
}

struct SchedulerInner {
    tasks: Vec<MaintenanceTask>,
    shutdown: AtomicBool,
    wake: Mutex<()>,
    wake_cond: Condvar,
}

/// Periodic driver for deferred engine work.
pub struct MaintenanceScheduler {
    inner: Arc<SchedulerInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MaintenanceScheduler {
    /// Start the scheduler thread, ticking every `interval`.
    pub fn start(interval: Duration, tasks: Vec<MaintenanceTask>) -> Self {
        let inner = Arc::new(SchedulerInner {
            tasks,
            shutdown: AtomicBool::new(false),
            wake: Mutex::new(()),
            wake_cond: Condvar::new(),
        });
        let worker_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("stowage-maintenance".to_string())
            .spawn(move || {
                while !worker_inner.shutdown.load(Ordering::Acquire) {
                    for task in &worker_inner.tasks {
                        task.run.as_ref()();
                    }
                    let mut guard = worker_inner.wake.lock();
                    if !worker_inner.shutdown.load(Ordering::Acquire) {
                        worker_inner.wake_cond.wait_for(&mut guard, interval);
                    }
                }
                debug!("maintenance scheduler stopped");
            })
            .expect("failed to spawn maintenance thread");
        Self {
            inner,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Build a scheduler that never ticks on its own; callers drive it
    /// with `run_once`. Used by tests for determinism.
    pub fn manual(tasks: Vec<MaintenanceTask>) -> Self {
        let inner = Arc::new(SchedulerInner {
            tasks,
            shutdown: AtomicBool::new(false),
            wake: Mutex::new(()),
            wake_cond: Condvar::new(),
        });
        Self {
            inner,
            worker: Mutex::new(None),
        }
    }

    /// Run every task once on the calling thread.
    pub fn run_once(&self) {
        for task in &self.inner.tasks {
            task.run.as_ref()();
        }
    }

    /// Stop the scheduler thread and wait for it to exit. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wake_cond.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MaintenanceScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
