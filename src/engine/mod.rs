pub mod aggregator;
pub mod decay;
pub mod normalize;
pub mod poller;
pub mod quota;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::clock::Clock;
use crate::config::Config;
use crate::models::{BoardState, Departure, Direction, EmptyReason, PollPlan};
use crate::providers::Provider;

use aggregator::Aggregator;
use decay::DecayAction;
use quota::{QuotaLedger, QuotaStore};

/// External control input, delivered from whatever bus the host wires up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Refresh,
    ToggleDirection,
}

/// All mutable scheduling state, owned exclusively by the control loop and
/// threaded through each decision explicitly.
struct SchedulerState {
    direction: Direction,
    ledger: QuotaLedger,
    live: Vec<Departure>,
    last_failure: Option<EmptyReason>,
    plan: PollPlan,
    /// Last aggregation run of any kind; basis of the refetch cooldown.
    last_run: Instant,
    last_decay_tick: Instant,
    sleeping: bool,
}

/// Single-task engine: decides when to poll, drives acquisition, decays the
/// cached view between polls and publishes every change to the board channel.
pub struct Engine {
    aggregator: Aggregator,
    clock: Arc<dyn Clock>,
    config: Config,
    store: QuotaStore,
    board_tx: watch::Sender<BoardState>,
}

impl Engine {
    pub fn new(
        config: Config,
        provider: Arc<dyn Provider>,
        clock: Arc<dyn Clock>,
        store: QuotaStore,
    ) -> (Self, watch::Receiver<BoardState>) {
        let label = config.directions.outbound.label.clone();
        let (board_tx, board_rx) = watch::channel(BoardState::empty(label));
        let engine = Self {
            aggregator: Aggregator::new(provider, config.fetch.clone()),
            clock,
            config,
            store,
            board_tx,
        };
        (engine, board_rx)
    }

    /// Run forever. One iteration per second evaluates, in order: active
    /// window transitions, day-rollover quota reset, minute-boundary decay,
    /// poll due, pending commands.
    pub async fn run(self, mut commands: mpsc::Receiver<Command>) {
        let mut state = self.startup().await;

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.on_tick(&mut state).await,
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command, &mut state).await,
                    None => {
                        tracing::info!("Command channel closed, stopping engine");
                        break;
                    }
                },
            }
        }
    }

    async fn startup(&self) -> SchedulerState {
        let now_local = self.clock.now();
        let mut ledger = self.store.load(self.config.quota.daily_limit).await;
        if ledger.reset_if_new_local_day(now_local) {
            self.persist_ledger(&ledger).await;
        }
        tracing::info!(
            calls_today = ledger.calls_today,
            daily_limit = ledger.daily_limit,
            "Engine starting"
        );

        let now = Instant::now();
        let mut state = SchedulerState {
            direction: Direction::Outbound,
            ledger,
            live: Vec::new(),
            last_failure: None,
            plan: PollPlan::new(Duration::from_secs(self.config.poll.base_interval_secs)),
            last_run: now,
            last_decay_tick: now,
            sleeping: false,
        };

        let hour = now_local.map(|n| chrono::Timelike::hour(&n));
        if self.config.active_window.contains(hour) {
            self.acquire_and_replan(&mut state, false).await;
        } else {
            state.sleeping = true;
            self.publish(&state);
            tracing::info!("Starting outside the active window, going to sleep");
        }
        state
    }

    async fn on_tick(&self, state: &mut SchedulerState) {
        let now_local = self.clock.now();
        let hour = now_local.map(|n| chrono::Timelike::hour(&n));
        let active = self.config.active_window.contains(hour);

        if !active && !state.sleeping {
            tracing::info!("Active window closed, clearing board until morning");
            state.sleeping = true;
            state.live.clear();
            state.last_failure = None;
            self.publish(state);
        } else if active && state.sleeping {
            tracing::info!("Active window opened, resuming polling");
            state.sleeping = false;
            self.acquire_and_replan(state, false).await;
        }

        if state.ledger.reset_if_new_local_day(now_local) {
            self.persist_ledger(&state.ledger).await;
        }

        if state.sleeping {
            return;
        }

        let now = Instant::now();
        let elapsed_minutes = now.duration_since(state.last_decay_tick).as_secs() / 60;
        if elapsed_minutes >= 1 {
            state.last_decay_tick += Duration::from_secs(elapsed_minutes * 60);
            let action = decay::tick(
                &mut state.live,
                elapsed_minutes,
                self.config.fetch.display_capacity,
            );
            let cooldown = Duration::from_secs(self.config.poll.refetch_cooldown_secs);
            if refetch_allowed(action, now.duration_since(state.last_run), cooldown) {
                tracing::info!(?action, "Decay shrank the catchable set, refetching");
                self.acquire_and_replan(state, true).await;
                return;
            }
            if action == DecayAction::LowWatermark {
                tracing::debug!("Below display capacity but within refetch cooldown, waiting");
            }
            self.publish(state);
        }

        if state.plan.is_due(Instant::now()) {
            self.acquire_and_replan(state, false).await;
        }
    }

    async fn on_command(&self, command: Command, state: &mut SchedulerState) {
        tracing::info!(?command, "Handling command");
        match command {
            Command::Refresh => {
                if !state.sleeping {
                    self.acquire_and_replan(state, false).await;
                }
            }
            Command::ToggleDirection => {
                state.direction = state.direction.toggled();
                state.live.clear();
                state.last_failure = None;
                if state.sleeping {
                    self.publish(state);
                } else {
                    self.acquire_and_replan(state, false).await;
                }
            }
        }
    }

    /// One full acquisition cycle: run the aggregator, top up from the
    /// remaining stops when a quota-optimized run came back short, account
    /// the calls, replace the live set and derive the next poll interval.
    async fn acquire_and_replan(&self, state: &mut SchedulerState, force_fetch_all: bool) {
        let now_local = self.clock.now();
        let direction = self.config.directions.get(state.direction);

        let capacity = self.config.fetch.display_capacity;
        let mut result = self
            .aggregator
            .acquire(direction, now_local, force_fetch_all)
            .await;
        let mut calls = result.calls_used;

        if !force_fetch_all
            && !result.fetched_all_stops
            && result.display(capacity).len() < capacity
        {
            tracing::info!(
                found = result.departures.len(),
                "Early-stopped run came back short, refetching all stops"
            );
            result = self.aggregator.acquire(direction, now_local, true).await;
            calls += result.calls_used;
        }

        if result.is_empty() {
            tracing::warn!(reason = ?result.failure, "Run produced no catchable departures");
        }

        state.ledger.record_calls(calls);
        self.persist_ledger(&state.ledger).await;

        state.live = result.departures;
        state.last_failure = result.failure;
        let now = Instant::now();
        state.last_run = now;
        state.last_decay_tick = now;
        state.plan = poller::next_interval(
            &state.ledger,
            direction,
            now_local,
            &self.config.active_window,
            &self.config.poll,
        );
        tracing::info!(
            direction = state.direction.as_str(),
            calls,
            calls_today = state.ledger.calls_today,
            next_poll_secs = state.plan.interval.as_secs(),
            "Cycle complete"
        );
        self.publish(state);
    }

    async fn persist_ledger(&self, ledger: &QuotaLedger) {
        if let Err(e) = self.store.save(ledger).await {
            tracing::warn!(error = %e, "Failed to persist quota ledger");
        }
    }

    fn publish(&self, state: &SchedulerState) {
        let direction = self.config.directions.get(state.direction);
        let board = BoardState {
            direction_label: direction.label.clone(),
            departures: state
                .live
                .iter()
                .take(self.config.fetch.display_capacity)
                .cloned()
                .collect(),
            placeholder: state.live.is_empty(),
            failure: state.last_failure.as_ref().map(EmptyReason::describe),
        };
        // Send failure only means no subscriber is listening.
        let _ = self.board_tx.send(board);
    }
}

/// Whether a decay outcome justifies spending quota right now. An empty
/// board is the worst user-facing outcome, so depletion overrides the
/// cooldown; a mere shortfall waits it out.
fn refetch_allowed(action: DecayAction, since_last_run: Duration, cooldown: Duration) -> bool {
    match action {
        DecayAction::Depleted => true,
        DecayAction::LowWatermark => since_last_run >= cooldown,
        DecayAction::Stable => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::{local, FixedClock};
    use crate::config::{
        ActiveWindowConfig, DirectionConfig, DirectionsConfig, FetchConfig, PollConfig,
        ProviderConfig, ProviderKind, QuotaConfig, StopEntry,
    };
    use crate::providers::testing::ScriptedProvider;
    use crate::providers::RawDeparture;

    fn stop(id: &str, name: &str, walk: i64) -> StopEntry {
        StopEntry {
            id: id.into(),
            name: name.into(),
            walk_minutes: walk,
            skip_routes: Vec::new(),
        }
    }

    fn test_config(early_stop_threshold: usize) -> Config {
        Config {
            provider: ProviderConfig {
                kind: ProviderKind::StopMonitoring,
                base_url: "http://localhost:9090".into(),
                app_id: String::new(),
                app_key: String::new(),
            },
            directions: DirectionsConfig {
                outbound: DirectionConfig {
                    label: "Cheltenham Spa".into(),
                    stops: vec![
                        stop("s1", "Churchdown Library", 4),
                        stop("s2", "Hare & Hounds", 12),
                    ],
                    routes: vec!["94".into(), "97".into()],
                    destinations: vec!["cheltenham".into()],
                    avg_calls_per_poll: 1.5,
                },
                inbound: DirectionConfig {
                    label: "Churchdown".into(),
                    stops: vec![stop("s9", "Promenade (Stop 3)", 2)],
                    routes: vec!["94".into()],
                    destinations: vec!["gloucester".into()],
                    avg_calls_per_poll: 1.0,
                },
            },
            quota: QuotaConfig::default(),
            fetch: FetchConfig {
                early_stop_threshold,
                ..FetchConfig::default()
            },
            poll: PollConfig::default(),
            active_window: ActiveWindowConfig::default(),
        }
    }

    async fn engine_with(
        provider: ScriptedProvider,
        config: Config,
        time: &str,
    ) -> (Engine, Arc<ScriptedProvider>, watch::Receiver<BoardState>) {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let provider = Arc::new(provider);
        let clock = Arc::new(FixedClock(Some(local("2026-08-05", time))));
        let (engine, board_rx) =
            Engine::new(config, provider.clone(), clock, QuotaStore::new(pool));
        (engine, provider, board_rx)
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

    #[tokio::test]
    async fn short_early_stopped_run_is_topped_up_from_all_stops() {
        // Threshold 2 sits below the display capacity of 3: the first stop
        // satisfies early-stop with two candidates and the shortfall forces a
        // second, full pass whose calls are all accounted.
        let provider = ScriptedProvider::new()
            .respond("s1", Ok(vec![raw("94", "10:20"), raw("94", "10:40")]))
            .respond("s1", Ok(vec![raw("94", "10:20"), raw("94", "10:40")]))
            .respond("s2", Ok(vec![raw("97", "10:50")]));
        let (engine, provider, board) = engine_with(provider, test_config(2), "10:00").await;

        let state = engine.startup().await;

        assert_eq!(provider.call_count(), 3);
        assert_eq!(state.ledger.calls_today, 3);
        assert_eq!(state.live.len(), 3);
        assert_eq!(board.borrow().departures.len(), 3);
        assert!(!board.borrow().placeholder);
    }

    #[tokio::test]
    async fn toggle_direction_reacquires_for_the_other_side() {
        let provider = ScriptedProvider::new();
        let (engine, provider, board) = engine_with(provider, test_config(5), "10:00").await;
        let mut state = engine.startup().await;
        assert_eq!(provider.call_count(), 2);

        engine.on_command(Command::ToggleDirection, &mut state).await;

        assert_eq!(state.direction, Direction::Inbound);
        assert_eq!(provider.call_count(), 3);
        let snapshot = board.borrow().clone();
        assert_eq!(snapshot.direction_label, "Churchdown");
        assert!(snapshot.placeholder);
        assert_eq!(snapshot.failure.as_deref(), Some("no departures found"));
    }

    #[tokio::test]
    async fn starting_outside_window_sleeps_without_spending_calls() {
        let provider = ScriptedProvider::new();
        let (engine, provider, board) = engine_with(provider, test_config(5), "23:30").await;

        let state = engine.startup().await;

        assert!(state.sleeping);
        assert_eq!(provider.call_count(), 0);
        assert!(board.borrow().placeholder);
    }

    #[test]
    fn depleted_refetch_bypasses_cooldown() {
        let cooldown = Duration::from_secs(300);
        assert!(refetch_allowed(
            DecayAction::Depleted,
            Duration::from_secs(0),
            cooldown
        ));
    }

    #[test]
    fn low_watermark_refetch_waits_out_cooldown() {
        let cooldown = Duration::from_secs(300);
        assert!(!refetch_allowed(
            DecayAction::LowWatermark,
            Duration::from_secs(120),
            cooldown
        ));
        assert!(refetch_allowed(
            DecayAction::LowWatermark,
            Duration::from_secs(300),
            cooldown
        ));
    }

    #[test]
    fn stable_never_refetches() {
        assert!(!refetch_allowed(
            DecayAction::Stable,
            Duration::from_secs(3600),
            Duration::from_secs(300)
        ));
    }
}
