use std::time::Duration;

use chrono::{NaiveDateTime, Timelike};

use crate::config::{ActiveWindowConfig, DirectionConfig, PollConfig};
use crate::engine::quota::QuotaLedger;
use crate::models::PollPlan;

/// Decide how long to wait before the next acquisition run.
///
/// A feedback controller, not a fixed timer: the interval is re-derived from
/// the ledger and the remaining active hours at every decision point, so
/// polling speeds up when a new day frees the budget and stretches out as it
/// is consumed. The returned interval is always within
/// `[min_interval, max_interval]`, whatever the inputs.
pub fn next_interval(
    ledger: &QuotaLedger,
    direction: &DirectionConfig,
    now: Option<NaiveDateTime>,
    window: &ActiveWindowConfig,
    poll: &PollConfig,
) -> PollPlan {
    let target_secs = plan_target_secs(ledger, direction, now, window, poll);
    let secs = target_secs.clamp(poll.min_interval_secs, poll.max_interval_secs);
    PollPlan::new(Duration::from_secs(secs))
}

fn plan_target_secs(
    ledger: &QuotaLedger,
    direction: &DirectionConfig,
    now: Option<NaiveDateTime>,
    window: &ActiveWindowConfig,
    poll: &PollConfig,
) -> u64 {
    // No trusted clock: no quota math either, fall back to the base cadence.
    let Some(now) = now else {
        return poll.base_interval_secs;
    };
    let hour = now.hour();

    if !window.contains(Some(hour)) {
        return poll.base_interval_secs;
    }

    let remaining = ledger.remaining_today();
    if remaining <= 0 {
        tracing::warn!(
            calls_today = ledger.calls_today,
            daily_limit = ledger.daily_limit,
            "Daily call budget exhausted, backing off for the rest of the day"
        );
        return poll.max_interval_secs;
    }

    let max_runs = (remaining as f64 / direction.avg_calls_per_poll).floor() as i64;
    if max_runs <= 0 {
        tracing::warn!(remaining, "Not enough budget for a single run, backing off");
        return poll.max_interval_secs;
    }

    let remaining_secs = u64::from(window.remaining_hours(hour)) * 3600;
    let mut target = remaining_secs / max_runs as u64;

    // Even with budget to burn, do not let the board go stale.
    if target > poll.comfort_interval_secs && remaining > poll.comfort_quota_threshold {
        target = poll.comfort_interval_secs;
    }

    tracing::debug!(
        calls_today = ledger.calls_today,
        remaining,
        remaining_hours = window.remaining_hours(hour),
        avg_calls_per_poll = direction.avg_calls_per_poll,
        target_secs = target,
        "Computed poll interval"
    );
    target
}
