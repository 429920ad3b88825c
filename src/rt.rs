//! Runtime seams.
//!
//! The connection factory needs exactly one thing from the runtime besides
//! spawning: a one-shot timer for the connection timeout. [`Timer`] abstracts
//! that so tests (or other runtimes) can observe and control it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// A future returned by a [`Timer`], completing once the duration elapses.
pub trait Sleep: Future<Output = ()> + Send + Sync {}

impl<T> Sleep for T where T: Future<Output = ()> + Send + Sync {}

/// A source of one-shot timers.
///
/// Dropping the returned [`Sleep`] cancels the timer.
pub trait Timer: fmt::Debug + Send + Sync + 'static {
    /// Return a future that completes after `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>>;
}

/// Timer backed by [`tokio::time`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTimer;

impl TokioTimer {
    /// Create a new tokio timer.
    pub fn new() -> Self {
        Self
    }
}

impl Timer for TokioTimer {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[cfg(any(test, feature = "mocks"))]
pub use self::mock::MockTimer;

#[cfg(any(test, feature = "mocks"))]
mod mock {
    use std::pin::Pin;
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::{Sleep, Timer};

    /// A timer which records every duration it is asked to sleep for.
    ///
    /// Sleeping still goes through [`tokio::time`], so a paused clock controls
    /// when the timers fire.
    #[derive(Debug, Default, Clone)]
    pub struct MockTimer {
        sleeps: Arc<Mutex<Vec<Duration>>>,
    }

    impl MockTimer {
        /// Create a new recording timer.
        pub fn new() -> Self {
            Self::default()
        }

        /// Durations requested so far, oldest first.
        pub fn sleeps(&self) -> Vec<Duration> {
            self.sleeps.lock().clone()
        }
    }

    impl Timer for MockTimer {
        fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>> {
            self.sleeps.lock().push(duration);
            Box::pin(tokio::time::sleep(duration))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(TokioTimer: Timer, Clone);
    assert_impl_all!(MockTimer: Timer, Clone);

    #[tokio::test(start_paused = true)]
    async fn tokio_timer_elapses() {
        let start = tokio::time::Instant::now();
        TokioTimer::new().sleep(Duration::from_secs(5)).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn mock_timer_records() {
        let timer = MockTimer::new();
        timer.sleep(Duration::ZERO).await;
        drop(timer.sleep(Duration::from_secs(3)));
        assert_eq!(timer.sleeps(), vec![Duration::ZERO, Duration::from_secs(3)]);
    }
}
