//! Time source used by caches, backoff and keepalive.
//!
//! Everything that waits or compares timestamps goes through [`Clock`], so
//! tests can drive time by hand with [`ManualClock`] or rely on tokio's paused
//! clock through [`TokioClock`].

use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::watch;

pub trait Clock: Send + Sync + 'static {
    /// Monotonic now.
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the Unix epoch, used on the wire.
    fn epoch_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Resolve after `duration` has elapsed on this clock.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Production clock backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }
}

/// Clock that only moves when [`ManualClock::advance`] is called.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    epoch_origin_ms: i64,
    elapsed: watch::Sender<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        let (elapsed, _) = watch::channel(Duration::ZERO);
        Self {
            origin: Instant::now(),
            epoch_origin_ms: chrono::Utc::now().timestamp_millis(),
            elapsed,
        }
    }

    /// Move time forward, waking every sleeper whose deadline has passed.
    pub fn advance(&self, by: Duration) {
        self.elapsed.send_modify(|elapsed| *elapsed += by);
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.borrow()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn epoch_millis(&self) -> i64 {
        self.epoch_origin_ms + self.elapsed().as_millis() as i64
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let mut elapsed = self.elapsed.subscribe();
        let deadline = *elapsed.borrow() + duration;
        async move {
            loop {
                if *elapsed.borrow_and_update() >= deadline {
                    return;
                }
                if elapsed.changed().await.is_err() {
                    // Clock dropped: nothing can advance it any more.
                    return;
                }
            }
        }
        .boxed()
    }
}
