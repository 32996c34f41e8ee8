use crate::models::Departure;

/// What a decay tick did to the live set, and what the control loop owes in
/// response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecayAction {
    /// Nothing removed, or enough departures remain; no refetch needed.
    Stable,
    /// Removals left fewer than the display capacity but more than zero;
    /// refetch once the cooldown allows.
    LowWatermark,
    /// Removals emptied the set; refetch immediately, cooldown or not.
    Depleted,
}

/// Advance cached countdowns by elapsed wall-clock minutes without spending
/// any provider calls.
///
/// Countdowns floor at zero; entries whose leave-in time crosses below zero
/// are removed and never re-added by decay. Ticking by N minutes is
/// equivalent to ticking by one minute N times.
pub fn tick(live: &mut Vec<Departure>, elapsed_minutes: u64, display_capacity: usize) -> DecayAction {
    if elapsed_minutes == 0 || live.is_empty() {
        return DecayAction::Stable;
    }

    for departure in live.iter_mut() {
        departure.minutes_until_departure =
            (departure.minutes_until_departure - elapsed_minutes as i64).max(0);
    }

    let before = live.len();
    live.retain(|d| {
        if d.is_catchable() {
            true
        } else {
            tracing::debug!(
                route = %d.route,
                stop = %d.stop_name,
                leave_in = d.leave_in(),
                "Dropping departure that can no longer be caught"
            );
            false
        }
    });

    if live.len() == before {
        return DecayAction::Stable;
    }
    if live.is_empty() {
        DecayAction::Depleted
    } else if live.len() < display_capacity {
        DecayAction::LowWatermark
    } else {
        DecayAction::Stable
    }
}
