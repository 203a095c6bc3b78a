use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;

use super::Clock;

/// Use the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&mut self, dur: Duration) {
        std::thread::sleep(dur);
    }
}

#[test]
fn system_clock_advances() {
    let mut clock = SystemClock::new();
    let before = clock.now();
    clock.sleep(Duration::from_millis(5));
    assert!(clock.now() > before);
}
