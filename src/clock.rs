use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;

/// Provides the current instant, abstracted so that tests can control time without sleeping.
///
/// Mirrors the `TimeSource`/`RealTimeSource` split the event scheduler used, generalized to a
/// trait object usable from both the Orchestrator and the Reminder Dispatcher.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// The current wall date and time in `tz`, derived from `now()`.
    fn local_now(&self, tz: Tz) -> (NaiveDate, NaiveTime) {
        let local = self.now().with_timezone(&tz);
        (local.date_naive(), local.time())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use parking_lot::RwLock;

    /// A `Clock` whose `now()` is fixed until advanced explicitly.
    #[derive(Debug)]
    pub struct TestClock {
        now: RwLock<DateTime<Utc>>,
    }

    impl TestClock {
        pub fn new(now: DateTime<Utc>) -> Self {
            TestClock {
                now: RwLock::new(now),
            }
        }

        pub fn advance(&self, duration: chrono::Duration) {
            let mut now = self.now.write();
            *now = *now + duration;
        }

        pub fn set(&self, now: DateTime<Utc>) {
            *self.now.write() = now;
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.read()
        }
    }
}
