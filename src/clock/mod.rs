//! Time sources for the tick loop.
//!
//! The scheduler never reads the wall clock directly; it asks a
//! [`Clock`] for "now" and asks it to sleep. [`SystemClock`] does the
//! real thing and [`TestingClock`] jumps time forward instantly so
//! tick boundaries can be tested without waiting.

use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;

pub mod system_clock;
pub mod testing_clock;

pub use system_clock::SystemClock;
pub use testing_clock::TestingClock;

pub trait Clock {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the caller for `dur`.
    ///
    /// Implementations must not busy-wait.
    fn sleep(&mut self, dur: Duration);
}
