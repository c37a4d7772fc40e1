//! Time source and sleep primitive used by the cache and its reaper.
//!
//! [`TokioClock`] follows tokio's timer, so tests running with a paused
//! runtime (`#[tokio::test(start_paused = true)]`) see virtual time.
//! [`ManualClock`] only moves when told to, for fully deterministic tests.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::sync::watch;

/// Boxed future returned by [`Clock::sleep`].
pub type Sleep<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Injectable clock.
pub trait Clock: Send + Sync + 'static {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Complete once `duration` has elapsed on this clock.
    fn sleep(&self, duration: Duration) -> Sleep<'_>;
}

/// Clock backed by tokio's timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn sleep(&self, duration: Duration) -> Sleep<'_> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Clock that advances only through [`advance`](Self::advance).
///
/// Sleepers wake as soon as the manual time reaches their deadline. The
/// deadline is computed when [`Clock::sleep`] is called, so a task must have
/// started sleeping before the clock is advanced past its deadline.
#[derive(Debug)]
pub struct ManualClock {
    now: watch::Sender<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        let (now, _) = watch::channel(Instant::now());
        Self { now }
    }

    /// Move the clock forward, waking every sleeper whose deadline passed.
    pub fn advance(&self, by: Duration) {
        self.now.send_modify(|now| *now += by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.borrow()
    }

    fn sleep(&self, duration: Duration) -> Sleep<'_> {
        let deadline = self.now() + duration;
        let mut rx = self.now.subscribe();
        Box::pin(async move {
            loop {
                if *rx.borrow_and_update() >= deadline {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(3));
        assert_eq!(clock.now() - start, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn manual_sleep_wakes_after_deadline() {
        let clock = Arc::new(ManualClock::new());
        let woke = Arc::new(AtomicBool::new(false));

        let task = {
            let clock = Arc::clone(&clock);
            let woke = Arc::clone(&woke);
            tokio::spawn(async move {
                clock.sleep(Duration::from_secs(5)).await;
                woke.store(true, Ordering::SeqCst);
            })
        };
        tokio::task::yield_now().await;

        clock.advance(Duration::from_secs(4));
        tokio::task::yield_now().await;
        assert!(!woke.load(Ordering::SeqCst));

        clock.advance(Duration::from_secs(1));
        task.await.unwrap();
        assert!(woke.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let clock = TokioClock;
        let start = clock.now();
        clock.sleep(Duration::from_secs(10)).await;
        assert!(clock.now() - start >= Duration::from_secs(10));
    }
}
