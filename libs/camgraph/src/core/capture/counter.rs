// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct CounterInner {
    name: String,
    in_flight: Mutex<u32>,
    idle: Condvar,
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Counter of captures currently travelling through a pipeline.
///
/// Each `begin()` hands out a [`CaptureGuard`]; the count drops when that
/// guard is dropped, whichever path the frame took.
#[derive(Clone)]
pub struct CaptureCounter {
    inner: Arc<CounterInner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub started: u64,
    pub in_flight: u32,
    pub succeeded: u64,
    pub failed: u64,
}

impl CaptureCounter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(CounterInner {
                name: name.into(),
                in_flight: Mutex::new(0),
                idle: Condvar::new(),
                started: AtomicU64::new(0),
                succeeded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn begin(&self) -> CaptureGuard {
        *self.inner.in_flight.lock() += 1;
        self.inner.started.fetch_add(1, Ordering::Relaxed);
        CaptureGuard {
            inner: Arc::clone(&self.inner),
            outcome: None,
        }
    }

    pub fn in_flight(&self) -> u32 {
        *self.inner.in_flight.lock()
    }

    /// Block until no capture is in flight. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.inner.in_flight.lock();
        while *in_flight > 0 {
            if self.inner.idle.wait_until(&mut in_flight, deadline).timed_out() {
                return *in_flight == 0;
            }
        }
        true
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            started: self.inner.started.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            succeeded: self.inner.succeeded.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CaptureCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureCounter")
            .field("name", &self.inner.name)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// One in-flight capture. Dropping it settles the count; an unsettled guard
/// counts as failed.
pub struct CaptureGuard {
    inner: Arc<CounterInner>,
    outcome: Option<bool>,
}

impl CaptureGuard {
    pub fn settle(&mut self, success: bool) {
        self.outcome = Some(success);
    }

    pub fn succeed(mut self) {
        self.settle(true);
    }

    pub fn fail(mut self) {
        self.settle(false);
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        if self.outcome.unwrap_or(false) {
            self.inner.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.failed.fetch_add(1, Ordering::Relaxed);
        }

        let mut in_flight = self.inner.in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.inner.idle.notify_all();
        }
        tracing::trace!(
            "[{}] capture settled ({:?}), {} in flight",
            self.inner.name,
            self.outcome,
            *in_flight
        );
    }
}

impl std::fmt::Debug for CaptureGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureGuard")
            .field("counter", &self.inner.name)
            .field("outcome", &self.outcome)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_every_guard_decrements_once() {
        let counter = CaptureCounter::new("still");
        let a = counter.begin();
        let b = counter.begin();
        let c = counter.begin();
        assert_eq!(counter.in_flight(), 3);

        a.succeed();
        b.fail();
        drop(c);

        let snapshot = counter.snapshot();
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.started, 3);
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.failed, 2);
    }

    #[test]
    fn test_wait_idle_wakes_on_last_drop() {
        let counter = CaptureCounter::new("burst");
        let guards: Vec<_> = (0..4).map(|_| counter.begin()).collect();

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            for mut guard in guards {
                guard.settle(true);
            }
        });

        assert!(counter.wait_idle(Duration::from_secs(2)));
        worker.join().unwrap();
        assert_eq!(counter.snapshot().succeeded, 4);
    }

    #[test]
    fn test_wait_idle_times_out() {
        let counter = CaptureCounter::new("stuck");
        let _guard = counter.begin();
        assert!(!counter.wait_idle(Duration::from_millis(10)));
    }
}
