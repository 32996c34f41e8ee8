use chrono::{NaiveDateTime, NaiveTime, Timelike};

use crate::config::{DirectionConfig, StopEntry};
use crate::models::Departure;
use crate::providers::RawDeparture;

/// Times parsed more than this far in the past are reinterpreted as the
/// following calendar day (midnight rollover) instead of discarded.
const ROLLOVER_BOUND_MINUTES: i64 = 60;

/// Countdown used when no usable time exists (unparseable entry, or clock
/// never synchronized with no relative estimate). Large enough to never be
/// filtered as departed; the next successful poll replaces it.
const UNKNOWN_MINUTES: i64 = 999;

/// Estimated-vs-scheduled delta within which a departure reads "On time".
const ON_TIME_TOLERANCE_MINUTES: i64 = 2;

/// Convert one raw provider entry into a canonical departure, or discard it.
///
/// Drops entries outside the direction's route allow-list or destination
/// filter, entries for routes that never call at this stop, and entries that
/// have unambiguously departed. Everything else survives, including entries
/// with unusable times (kept with a conservative countdown rather than
/// wrongly filtered).
pub fn normalize(
    raw: &RawDeparture,
    stop: &StopEntry,
    direction: &DirectionConfig,
    now: Option<NaiveDateTime>,
) -> Option<Departure> {
    if !direction.routes.iter().any(|r| r == &raw.route) {
        return None;
    }
    if stop.skip_routes.iter().any(|r| r == &raw.route) {
        return None;
    }
    if !matches_destination(&raw.destination, direction) {
        return None;
    }

    let best_time = raw.expected_time.as_deref().or(raw.aimed_time.as_deref());
    let parsed_tod = best_time.and_then(time_of_day);

    let minutes_until_departure = if let Some(estimate) = raw.estimate_minutes {
        estimate
    } else if let (Some(now), Some(tod)) = (now, parsed_tod) {
        minutes_until(tod, now.time())
    } else {
        UNKNOWN_MINUTES
    };

    if minutes_until_departure < 0 {
        return None;
    }

    let departure_time = display_time(parsed_tod, raw.estimate_minutes, now);
    let is_live = raw.expected_time.is_some();
    let status = status_text(raw, is_live);

    Some(Departure {
        route: raw.route.clone(),
        stop_id: stop.id.clone(),
        stop_name: stop.name.clone(),
        destination: raw.destination.clone(),
        departure_time,
        minutes_until_departure,
        walk_minutes: stop.walk_minutes,
        is_live,
        status,
    })
}

fn matches_destination(destination: &str, direction: &DirectionConfig) -> bool {
    let lower = destination.to_lowercase();
    direction
        .destinations
        .iter()
        .any(|d| lower.contains(&d.to_lowercase()))
}

/// Extract a local time-of-day from an ISO-8601 timestamp or a bare HH:MM.
fn time_of_day(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    let clock_part = match s.find('T') {
        Some(t) => &s[t + 1..],
        None => s,
    };
    let hhmm = clock_part.get(..5)?;
    NaiveTime::parse_from_str(hhmm, "%H:%M").ok()
}

/// Minutes from `now` until `dep`, both local times of day. Departures more
/// than the rollover bound in the past are taken to mean tomorrow.
fn minutes_until(dep: NaiveTime, now: NaiveTime) -> i64 {
    let dep_minutes = i64::from(dep.hour()) * 60 + i64::from(dep.minute());
    let now_minutes = i64::from(now.hour()) * 60 + i64::from(now.minute());
    let mut diff = dep_minutes - now_minutes;
    if diff < -ROLLOVER_BOUND_MINUTES {
        diff += 24 * 60;
    }
    diff
}

fn display_time(
    parsed_tod: Option<NaiveTime>,
    estimate_minutes: Option<i64>,
    now: Option<NaiveDateTime>,
) -> String {
    if let Some(tod) = parsed_tod {
        return tod.format("%H:%M").to_string();
    }
    if let (Some(estimate), Some(now)) = (estimate_minutes, now) {
        let projected = now + chrono::Duration::minutes(estimate.max(0));
        return projected.time().format("%H:%M").to_string();
    }
    "--:--".to_string()
}

fn status_text(raw: &RawDeparture, is_live: bool) -> String {
    if let (Some(expected), Some(aimed)) = (raw.expected_time.as_deref(), raw.aimed_time.as_deref())
    {
        if let (Some(e), Some(a)) = (time_of_day(expected), time_of_day(aimed)) {
            let delay = wrap_half_day(
                (i64::from(e.hour()) * 60 + i64::from(e.minute()))
                    - (i64::from(a.hour()) * 60 + i64::from(a.minute())),
            );
            return if delay >= ON_TIME_TOLERANCE_MINUTES {
                format!("Delayed {delay} min")
            } else if delay <= -ON_TIME_TOLERANCE_MINUTES {
                format!("Early {} min", -delay)
            } else {
                "On time".to_string()
            };
        }
    }
    if is_live {
        "Live".to_string()
    } else {
        "Scheduled".to_string()
    }
}

/// Fold a time-of-day difference into [-12h, +12h) so a delay straddling
/// midnight reads as minutes, not hours.
fn wrap_half_day(mut minutes: i64) -> i64 {
    if minutes < -12 * 60 {
        minutes += 24 * 60;
    } else if minutes >= 12 * 60 {
        minutes -= 24 * 60;
    }
    minutes
}
