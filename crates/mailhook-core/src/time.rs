//! Time sources for the delivery pipeline.
//!
//! Two readings are needed: a monotonic instant to time webhook requests and
//! a UTC wall-clock timestamp for queued-time headers and error flags.
//! `TestClock` lets tests pin both.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic reading for measuring request durations.
    fn now(&self) -> Instant;

    /// Wall-clock reading in UTC.
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug)]
struct Frozen {
    elapsed: Duration,
    wall: DateTime<Utc>,
}

/// Clock that only moves when told to.
///
/// Clones share the same time.
#[derive(Debug, Clone)]
pub struct TestClock {
    origin: Instant,
    state: Arc<Mutex<Frozen>>,
}

impl TestClock {
    /// Clock frozen at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Clock frozen at `wall`.
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            origin: Instant::now(),
            state: Arc::new(Mutex::new(Frozen { elapsed: Duration::ZERO, wall })),
        }
    }

    /// Moves both readings forward by `step`.
    pub fn advance(&self, step: Duration) {
        let mut state = self.lock();
        state.elapsed += step;
        if let Ok(step) = chrono::Duration::from_std(step) {
            state.wall += step;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Frozen> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.origin + self.lock().elapsed
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.lock().wall
    }
}
