use chrono::{Local, NaiveDateTime};

/// Source of local wall-clock time.
///
/// Returns `None` while the clock has never synchronized; time-dependent
/// filtering is disabled rather than silently wrong in that state.
pub trait Clock: Send + Sync {
    fn now(&self) -> Option<NaiveDateTime>;
}

/// Host system clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Option<NaiveDateTime> {
        Some(Local::now().naive_local())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Fixed clock for tests; `None` models an unsynchronized clock.
    pub struct FixedClock(pub Option<NaiveDateTime>);

    impl Clock for FixedClock {
        fn now(&self) -> Option<NaiveDateTime> {
            self.0
        }
    }

    pub fn local(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M")
            .expect("valid test datetime")
    }
}
