use std::time::{Duration, Instant};

use serde::Serialize;

/// One of the two configured travel directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    pub fn toggled(self) -> Self {
        match self {
            Direction::Outbound => Direction::Inbound,
            Direction::Inbound => Direction::Outbound,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
        }
    }
}

/// One upcoming departure at one stop, normalized from provider data.
#[derive(Debug, Clone, Serialize)]
pub struct Departure {
    pub route: String,
    pub stop_id: String,
    pub stop_name: String,
    pub destination: String,
    /// Display time in HH:MM, or "--:--" when the clock is unsynchronized.
    pub departure_time: String,
    pub minutes_until_departure: i64,
    pub walk_minutes: i64,
    /// True when the provider supplied a real-time estimate.
    pub is_live: bool,
    pub status: String,
}

impl Departure {
    /// Minutes until one must leave to just catch this departure.
    pub fn leave_in(&self) -> i64 {
        self.minutes_until_departure - self.walk_minutes
    }

    pub fn is_catchable(&self) -> bool {
        self.leave_in() >= 0
    }
}

/// Why an acquisition run produced no displayable departures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyReason {
    /// Providers answered but nothing matched the route/destination filters.
    NoData,
    /// Matching departures existed but none can still be caught.
    AllUncatchable,
    /// Every queried stop failed; carries the last provider error.
    Provider(String),
}

impl EmptyReason {
    pub fn describe(&self) -> String {
        match self {
            EmptyReason::NoData => "no departures found".to_string(),
            EmptyReason::AllUncatchable => "no catchable departures".to_string(),
            EmptyReason::Provider(msg) => msg.clone(),
        }
    }
}

/// Outcome of one aggregation run over a direction's stops.
///
/// `departures` holds the full filtered/sorted catchable list, not just the
/// display window, so decay and refetch decisions have spares to fall back on.
#[derive(Debug, Clone)]
pub struct AcquisitionResult {
    pub departures: Vec<Departure>,
    pub calls_used: u32,
    pub fetched_all_stops: bool,
    pub failure: Option<EmptyReason>,
}

impl AcquisitionResult {
    pub fn display(&self, capacity: usize) -> &[Departure] {
        &self.departures[..self.departures.len().min(capacity)]
    }

    pub fn is_empty(&self) -> bool {
        self.departures.is_empty()
    }
}

/// A single scheduling decision: poll again after `interval`.
///
/// Recomputed at every decision point and never cached beyond one decision.
#[derive(Debug, Clone, Copy)]
pub struct PollPlan {
    pub interval: Duration,
    pub issued_at: Instant,
}

impl PollPlan {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            issued_at: Instant::now(),
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now.duration_since(self.issued_at) >= self.interval
    }
}

/// Snapshot published to the render sink after every state change.
#[derive(Debug, Clone, Serialize)]
pub struct BoardState {
    pub direction_label: String,
    pub departures: Vec<Departure>,
    /// True when there is nothing real to show (startup, sleep, empty result).
    pub placeholder: bool,
    pub failure: Option<String>,
}

impl BoardState {
    pub fn empty(direction_label: impl Into<String>) -> Self {
        Self {
            direction_label: direction_label.into(),
            departures: Vec::new(),
            placeholder: true,
            failure: None,
        }
    }
}
