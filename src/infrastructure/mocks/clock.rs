//! Controllable clock for tests.

use crate::application::ports::Clock;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Clock that only moves when a test moves it.
///
/// Clones share one time value, so a clone handed to a controller can be
/// advanced from the test thread to expire reap grace periods. Queue wait
/// deadlines and context timeouts use real time and are not affected.
///
/// ```
/// use flowgate::infrastructure::mocks::MockClock;
/// use flowgate::application::ports::Clock;
/// use std::time::{Duration, Instant};
///
/// let start = Instant::now();
/// let clock = MockClock::new(start);
/// clock.advance(Duration::from_secs(90));
/// assert_eq!(clock.now(), start + Duration::from_secs(90));
/// ```
#[derive(Debug, Clone)]
pub struct MockClock {
    current: Arc<Mutex<Instant>>,
}

impl MockClock {
    pub fn new(start: Instant) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        *self.current.lock() += by;
    }

    /// Jump to `instant`.
    pub fn set(&self, instant: Instant) {
        *self.current.lock() = instant;
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self.current.lock()
    }
}
