use std::sync::Arc;

use chrono::NaiveDateTime;

use crate::config::{DirectionConfig, FetchConfig};
use crate::engine::normalize::normalize;
use crate::models::{AcquisitionResult, Departure, EmptyReason};
use crate::providers::{fetch_with_retry, Provider};

/// Two candidates this close together in time (same route, same stop) are the
/// same physical departure reported twice.
const DEDUP_TOLERANCE_MINUTES: i64 = 1;

/// Growable container that enforces its capacity on push, so collection loops
/// need no index bookkeeping.
#[derive(Debug)]
pub struct BoundedVec<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T> BoundedVec<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Vec::new(),
            capacity,
        }
    }

    /// Returns false (and drops the value) once the capacity is reached.
    pub fn push(&mut self, value: T) -> bool {
        if self.items.len() >= self.capacity {
            return false;
        }
        self.items.push(value);
        true
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

/// Drives one direction's stops through the provider and distills the raw
/// harvest into the ordered catchable list.
pub struct Aggregator {
    provider: Arc<dyn Provider>,
    fetch: FetchConfig,
}

impl Aggregator {
    pub fn new(provider: Arc<dyn Provider>, fetch: FetchConfig) -> Self {
        Self { provider, fetch }
    }

    /// Query the direction's stops in closest-first order.
    ///
    /// Unless `force_fetch_all` is set, stops querying once enough distinct
    /// catchable candidates are in hand to survive deduplication and still
    /// fill the display. Every stop queried counts one provider call, failed
    /// ones included; a failed stop never aborts the run.
    pub async fn acquire(
        &self,
        direction: &DirectionConfig,
        now: Option<NaiveDateTime>,
        force_fetch_all: bool,
    ) -> AcquisitionResult {
        let total_stops = direction.stops.len();
        let mut candidates: BoundedVec<Departure> = BoundedVec::new(self.fetch.max_candidates);
        let mut calls_used = 0u32;
        let mut stops_queried = 0usize;
        let mut any_success = false;
        let mut last_error: Option<String> = None;

        for (index, stop) in direction.stops.iter().enumerate() {
            calls_used += 1;
            stops_queried += 1;

            match fetch_with_retry(self.provider.as_ref(), &stop.id, self.fetch.retry_limit).await
            {
                Ok(entries) => {
                    any_success = true;
                    let before = candidates.len();
                    for raw in &entries {
                        if let Some(departure) = normalize(raw, stop, direction, now) {
                            if !candidates.push(departure) {
                                tracing::warn!(
                                    stop = %stop.name,
                                    ceiling = self.fetch.max_candidates,
                                    "Candidate ceiling reached, dropping remainder"
                                );
                                break;
                            }
                        }
                    }
                    tracing::debug!(
                        stop = %stop.name,
                        raw = entries.len(),
                        kept = candidates.len() - before,
                        "Collected stop"
                    );
                }
                Err(e) => {
                    tracing::warn!(stop = %stop.name, error = %e, "Stop fetch failed, continuing");
                    last_error = Some(e.to_string());
                }
            }

            if !force_fetch_all && index + 1 < total_stops {
                let usable = distinct_catchable(candidates.as_slice());
                if usable >= self.fetch.early_stop_threshold {
                    tracing::info!(
                        usable,
                        stops_queried,
                        total_stops,
                        "Early stop: enough data, saving remaining calls"
                    );
                    break;
                }
            }
        }

        let fetched_all_stops = stops_queried == total_stops;
        let mut all = candidates.into_vec();
        let had_candidates = !all.is_empty();

        // Most urgent first; stable sort preserves fetch order on ties.
        all.sort_by_key(Departure::leave_in);
        let deduped = dedup(all);
        let catchable: Vec<Departure> = deduped
            .into_iter()
            .filter(Departure::is_catchable)
            .collect();

        let failure = if !catchable.is_empty() {
            None
        } else if !any_success {
            Some(EmptyReason::Provider(
                last_error.unwrap_or_else(|| "all stops failed".to_string()),
            ))
        } else if had_candidates {
            Some(EmptyReason::AllUncatchable)
        } else {
            Some(EmptyReason::NoData)
        };

        tracing::info!(
            direction = %direction.label,
            calls_used,
            fetched_all_stops,
            catchable = catchable.len(),
            failure = ?failure,
            "Acquisition complete"
        );

        AcquisitionResult {
            departures: catchable,
            calls_used,
            fetched_all_stops,
            failure,
        }
    }
}

fn is_same_departure(a: &Departure, b: &Departure) -> bool {
    a.route == b.route
        && a.stop_id == b.stop_id
        && (a.minutes_until_departure - b.minutes_until_departure).abs() <= DEDUP_TOLERANCE_MINUTES
}

/// Keep the first occurrence of each logical departure; input must already be
/// sorted so "first" means most urgent.
fn dedup(sorted: Vec<Departure>) -> Vec<Departure> {
    let mut kept: Vec<Departure> = Vec::with_capacity(sorted.len());
    for candidate in sorted {
        if !kept.iter().any(|k| is_same_departure(k, &candidate)) {
            kept.push(candidate);
        }
    }
    kept
}

/// How many catchable, pairwise-distinct candidates are in hand; the
/// early-stop policy compares this against its confidence threshold.
fn distinct_catchable(candidates: &[Departure]) -> usize {
    let mut representatives: Vec<&Departure> = Vec::new();
    for candidate in candidates.iter().filter(|c| c.is_catchable()) {
        if !representatives.iter().any(|r| is_same_departure(r, candidate)) {
            representatives.push(candidate);
        }
    }
    representatives.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::local;
    use crate::config::StopEntry;
    use crate::providers::testing::ScriptedProvider;
    use crate::providers::{ProviderError, RawDeparture};

    fn direction(stops: Vec<StopEntry>) -> DirectionConfig {
        DirectionConfig {
            label: "Cheltenham Spa".into(),
            stops,
            routes: vec!["94".into(), "95".into(), "97".into(), "98".into()],
            destinations: vec!["cheltenham".into()],
            avg_calls_per_poll: 1.5,
        }
    }

    fn stop(id: &str, name: &str, walk: i64) -> StopEntry {
        StopEntry {
            id: id.into(),
            name: name.into(),
            walk_minutes: walk,
            skip_routes: Vec::new(),
        }
    }

    fn three_stop_direction() -> DirectionConfig {
        direction(vec![
            stop("s1", "Churchdown Library", 4),
            stop("s2", "Hare & Hounds", 12),
            stop("s3", "St John's Church", 5),
        ])
    }

    fn raw(route: &str, aimed: &str) -> RawDeparture {
        RawDeparture {
            route: route.into(),
            destination: "Cheltenham Spa".into(),
            aimed_time: Some(aimed.into()),
            expected_time: None,
            estimate_minutes: None,
        }
    }

    fn make_aggregator(provider: ScriptedProvider) -> (Aggregator, Arc<ScriptedProvider>) {
        let provider = Arc::new(provider);
        (
            Aggregator::new(provider.clone(), FetchConfig::default()),
            provider,
        )
    }

    #[tokio::test]
    async fn early_stop_skips_remaining_stops_once_threshold_met() {
        // First stop alone yields six distinct catchable candidates; with the
        // default threshold of five, stops two and three must not be queried.
        let entries: Vec<RawDeparture> = (0..6).map(|i| raw("94", &format!("10:{}", 20 + i * 5))).collect();
        let provider = ScriptedProvider::new().respond("s1", Ok(entries));
        let (aggregator, provider) = make_aggregator(provider);

        let result = aggregator
            .acquire(&three_stop_direction(), Some(local("2026-08-05", "10:00")), false)
            .await;

        assert_eq!(result.calls_used, 1);
        assert_eq!(provider.call_count(), 1);
        assert!(!result.fetched_all_stops);
        assert!(result.failure.is_none());
    }

    #[tokio::test]
    async fn force_fetch_all_queries_every_stop() {
        let entries: Vec<RawDeparture> = (0..6).map(|i| raw("94", &format!("10:{}", 20 + i * 5))).collect();
        let provider = ScriptedProvider::new().respond("s1", Ok(entries));
        let (aggregator, provider) = make_aggregator(provider);

        let result = aggregator
            .acquire(&three_stop_direction(), Some(local("2026-08-05", "10:00")), true)
            .await;

        assert_eq!(result.calls_used, 3);
        assert_eq!(provider.call_count(), 3);
        assert!(result.fetched_all_stops);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_stop_is_counted_and_does_not_abort_the_run() {
        let provider = ScriptedProvider::new()
            .respond("s1", Err(ProviderError::Transport("timeout".into())))
            .respond("s1", Err(ProviderError::Transport("timeout".into())))
            .respond("s1", Err(ProviderError::Transport("timeout".into())))
            .respond("s2", Ok(vec![raw("94", "10:40")]));
        let (aggregator, _) = make_aggregator(provider);

        let result = aggregator
            .acquire(&three_stop_direction(), Some(local("2026-08-05", "10:00")), true)
            .await;

        assert_eq!(result.calls_used, 3);
        assert_eq!(result.departures.len(), 1);
        assert!(result.failure.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn total_failure_yields_typed_provider_reason() {
        let provider = ScriptedProvider::new()
            .respond("s1", Err(ProviderError::Auth("bad key".into())))
            .respond("s2", Err(ProviderError::Auth("bad key".into())))
            .respond("s3", Err(ProviderError::Auth("bad key".into())));
        let (aggregator, _) = make_aggregator(provider);

        let result = aggregator
            .acquire(&three_stop_direction(), Some(local("2026-08-05", "10:00")), true)
            .await;

        assert!(result.is_empty());
        assert_eq!(result.calls_used, 3);
        assert!(matches!(result.failure, Some(EmptyReason::Provider(_))));
    }

    #[tokio::test]
    async fn near_simultaneous_duplicates_collapse_but_distinct_times_survive() {
        // Route 94 reported at 14 and 15 minutes out from the same stop is one
        // bus; the 40-minute one is a different bus.
        let provider = ScriptedProvider::new().respond(
            "s1",
            Ok(vec![raw("94", "10:14"), raw("94", "10:15"), raw("94", "10:40")]),
        );
        let (aggregator, _) = make_aggregator(provider);
        let one_stop = direction(vec![stop("s1", "Churchdown Library", 4)]);

        let result = aggregator
            .acquire(&one_stop, Some(local("2026-08-05", "10:00")), false)
            .await;

        assert_eq!(result.departures.len(), 2);
        assert_eq!(result.departures[0].minutes_until_departure, 14);
        assert_eq!(result.departures[1].minutes_until_departure, 40);
        for (i, a) in result.departures.iter().enumerate() {
            for b in &result.departures[i + 1..] {
                assert!(!is_same_departure(a, b));
            }
        }
    }

    #[tokio::test]
    async fn result_holds_only_catchable_departures_most_urgent_first() {
        // Walk time 12: the 10:05 bus is already uncatchable.
        let provider = ScriptedProvider::new().respond(
            "s1",
            Ok(vec![raw("94", "10:30"), raw("97", "10:05"), raw("95", "10:20")]),
        );
        let (aggregator, _) = make_aggregator(provider);
        let one_stop = direction(vec![stop("s1", "Hare & Hounds", 12)]);

        let result = aggregator
            .acquire(&one_stop, Some(local("2026-08-05", "10:00")), false)
            .await;

        assert!(result.departures.iter().all(|d| d.leave_in() >= 0));
        let leave_ins: Vec<i64> = result.departures.iter().map(Departure::leave_in).collect();
        let mut sorted = leave_ins.clone();
        sorted.sort();
        assert_eq!(leave_ins, sorted);
        assert_eq!(result.departures.len(), 2);
    }

    #[tokio::test]
    async fn all_uncatchable_is_distinguished_from_no_data() {
        let provider = ScriptedProvider::new().respond("s1", Ok(vec![raw("94", "10:03")]));
        let (aggregator, _) = make_aggregator(provider);
        let one_stop = direction(vec![stop("s1", "Hare & Hounds", 12)]);

        let result = aggregator
            .acquire(&one_stop, Some(local("2026-08-05", "10:00")), false)
            .await;
        assert_eq!(result.failure, Some(EmptyReason::AllUncatchable));

        let provider = ScriptedProvider::new().respond("s1", Ok(Vec::new()));
        let (aggregator, _) = make_aggregator(provider);
        let result = aggregator
            .acquire(&one_stop, Some(local("2026-08-05", "10:00")), false)
            .await;
        assert_eq!(result.failure, Some(EmptyReason::NoData));
    }

    #[tokio::test]
    async fn duplicate_heavy_first_stop_does_not_trigger_early_stop() {
        // Six copies of the same departure are one distinct candidate, so the
        // run must continue to later stops.
        let entries: Vec<RawDeparture> = (0..6).map(|_| raw("94", "10:20")).collect();
        let provider = ScriptedProvider::new()
            .respond("s1", Ok(entries))
            .respond("s2", Ok(vec![raw("97", "10:30")]));
        let (aggregator, provider) = make_aggregator(provider);

        let result = aggregator
            .acquire(&three_stop_direction(), Some(local("2026-08-05", "10:00")), false)
            .await;

        assert_eq!(provider.call_count(), 3);
        assert!(result.fetched_all_stops);
        assert_eq!(result.departures.len(), 2);
    }

    #[test]
    fn bounded_vec_enforces_capacity_on_push() {
        let mut v = BoundedVec::new(2);
        assert!(v.push(1));
        assert!(v.push(2));
        assert!(!v.push(3));
        assert_eq!(v.len(), 2);
        assert_eq!(v.into_vec(), vec![1, 2]);
    }
}
