//! Where a refresh cycle gets "now" from.
//!
//! A cycle reads the clock exactly once and threads that value through
//! every component, so all writes of one cycle share one timestamp.

use std::cell::Cell;

use chrono::{Duration, Utc};

use crate::model::Timestamp;

pub trait Clock {
    fn now(&self) -> Timestamp;
}

/// Use the current system time.
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from(Utc::now())
    }
}

/// Use to simulate system time in tests.
///
/// "Now" starts at `start_at` and only moves when told to.
#[derive(Debug)]
pub struct TestingClock {
    now: Cell<Timestamp>,
}

impl TestingClock {
    pub fn new(start_at: Timestamp) -> Self {
        Self {
            now: Cell::new(start_at),
        }
    }

    pub fn advance(&self, by: Duration) {
        let micros = by.num_microseconds().unwrap_or(i64::MAX);
        let Timestamp(now) = self.now.get();
        self.now.set(Timestamp(now.saturating_add(micros)));
    }

    /// Jump to an arbitrary time, even backwards.
    pub fn set(&self, at: Timestamp) {
        self.now.set(at);
    }
}

impl Clock for TestingClock {
    fn now(&self) -> Timestamp {
        self.now.get()
    }
}

#[test]
fn testing_clock_only_moves_when_told() {
    let clock = TestingClock::new(Timestamp(10));
    assert_eq!(clock.now(), Timestamp(10));
    assert_eq!(clock.now(), Timestamp(10));

    clock.advance(Duration::milliseconds(2));
    assert_eq!(clock.now(), Timestamp(2_010));

    clock.set(Timestamp(1));
    assert_eq!(clock.now(), Timestamp(1));
}
