use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;

use super::Clock;

/// Simulate system time in tests.
///
/// Sleeping returns immediately and moves "now" forward by the
/// requested amount. Clones share the same "now", so a test can keep
/// a handle and move time itself while the scheduler owns another.
#[derive(Debug, Clone)]
pub struct TestingClock {
    current_time: Rc<Cell<DateTime<Utc>>>,
}

impl TestingClock {
    pub fn new(start_at: DateTime<Utc>) -> Self {
        Self {
            current_time: Rc::new(Cell::new(start_at)),
        }
    }

    /// Move time forward without anyone sleeping, as if the process
    /// stalled.
    pub fn advance(&self, dur: Duration) {
        let dur = chrono::Duration::from_std(dur).unwrap_or_else(|_| chrono::Duration::zero());
        self.current_time.set(self.current_time.get() + dur);
    }
}

impl Clock for TestingClock {
    fn now(&self) -> DateTime<Utc> {
        self.current_time.get()
    }

    fn sleep(&mut self, dur: Duration) {
        self.advance(dur);
    }
}

#[test]
fn test_testing_clock() {
    use chrono::TimeZone;

    let start = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
    let mut clock = TestingClock::new(start);
    let handle = clock.clone();
    assert_eq!(clock.now(), start);

    clock.sleep(Duration::from_secs(1));
    assert_eq!(handle.now(), Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 1).unwrap());

    handle.advance(Duration::from_millis(1500));
    assert_eq!(
        clock.now(),
        Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 2).unwrap() + chrono::Duration::milliseconds(500)
    );
}
