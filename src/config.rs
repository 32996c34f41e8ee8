use serde::Deserialize;
use std::path::Path;

use crate::models::Direction;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub provider: ProviderConfig,
    pub directions: DirectionsConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub active_window: ActiveWindowConfig,
}

/// Which upstream client to construct and how to reach it.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub base_url: String,
    /// Credentials for providers that require them; unused otherwise.
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    TransportApi,
    StopMonitoring,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectionsConfig {
    pub outbound: DirectionConfig,
    pub inbound: DirectionConfig,
}

impl DirectionsConfig {
    pub fn get(&self, direction: Direction) -> &DirectionConfig {
        match direction {
            Direction::Outbound => &self.outbound,
            Direction::Inbound => &self.inbound,
        }
    }
}

/// One travel direction: its stops (closest first), route allow-list and
/// accepted destination substrings.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectionConfig {
    pub label: String,
    pub stops: Vec<StopEntry>,
    pub routes: Vec<String>,
    pub destinations: Vec<String>,
    /// Typical provider calls one poll consumes for this direction, given
    /// early-stop behavior. Tuned empirically; feeds the interval scheduler.
    #[serde(default = "DirectionConfig::default_avg_calls_per_poll")]
    pub avg_calls_per_poll: f64,
}

impl DirectionConfig {
    fn default_avg_calls_per_poll() -> f64 {
        1.0
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopEntry {
    pub id: String,
    pub name: String,
    pub walk_minutes: i64,
    /// Allow-listed routes that nevertheless never call at this stop.
    #[serde(default)]
    pub skip_routes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Maximum provider calls permitted per local calendar day.
    #[serde(default = "QuotaConfig::default_daily_limit")]
    pub daily_limit: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: Self::default_daily_limit(),
        }
    }
}

impl QuotaConfig {
    fn default_daily_limit() -> u32 {
        300
    }
}

/// Tuning for one aggregation run.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Stop querying further stops once this many catchable, distinct
    /// candidates have been collected (unless a fetch-all was forced).
    #[serde(default = "FetchConfig::default_early_stop_threshold")]
    pub early_stop_threshold: usize,
    /// Departures shown to the render sink.
    #[serde(default = "FetchConfig::default_display_capacity")]
    pub display_capacity: usize,
    /// Safety ceiling on raw candidates collected per run.
    #[serde(default = "FetchConfig::default_max_candidates")]
    pub max_candidates: usize,
    /// Extra attempts per stop on transient failure.
    #[serde(default = "FetchConfig::default_retry_limit")]
    pub retry_limit: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            early_stop_threshold: Self::default_early_stop_threshold(),
            display_capacity: Self::default_display_capacity(),
            max_candidates: Self::default_max_candidates(),
            retry_limit: Self::default_retry_limit(),
        }
    }
}

impl FetchConfig {
    fn default_early_stop_threshold() -> usize {
        5
    }
    fn default_display_capacity() -> usize {
        3
    }
    fn default_max_candidates() -> usize {
        64
    }
    fn default_retry_limit() -> u32 {
        2
    }
}

/// Interval scheduler tuning. All intervals in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    /// Used outside the active window and when the clock is unsynchronized.
    #[serde(default = "PollConfig::default_base_interval_secs")]
    pub base_interval_secs: u64,
    #[serde(default = "PollConfig::default_min_interval_secs")]
    pub min_interval_secs: u64,
    #[serde(default = "PollConfig::default_max_interval_secs")]
    pub max_interval_secs: u64,
    /// Staleness cap applied while quota is still abundant.
    #[serde(default = "PollConfig::default_comfort_interval_secs")]
    pub comfort_interval_secs: u64,
    /// Remaining-call count above which the comfort cap applies.
    #[serde(default = "PollConfig::default_comfort_quota_threshold")]
    pub comfort_quota_threshold: i64,
    /// Minimum spacing between decay-triggered refetches.
    #[serde(default = "PollConfig::default_refetch_cooldown_secs")]
    pub refetch_cooldown_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: Self::default_base_interval_secs(),
            min_interval_secs: Self::default_min_interval_secs(),
            max_interval_secs: Self::default_max_interval_secs(),
            comfort_interval_secs: Self::default_comfort_interval_secs(),
            comfort_quota_threshold: Self::default_comfort_quota_threshold(),
            refetch_cooldown_secs: Self::default_refetch_cooldown_secs(),
        }
    }
}

impl PollConfig {
    fn default_base_interval_secs() -> u64 {
        600
    }
    fn default_min_interval_secs() -> u64 {
        300
    }
    fn default_max_interval_secs() -> u64 {
        3600
    }
    fn default_comfort_interval_secs() -> u64 {
        1800
    }
    fn default_comfort_quota_threshold() -> i64 {
        50
    }
    fn default_refetch_cooldown_secs() -> u64 {
        300
    }
}

/// Local-time hours during which polling runs at normal cadence.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ActiveWindowConfig {
    #[serde(default = "ActiveWindowConfig::default_start_hour")]
    pub start_hour: u32,
    #[serde(default = "ActiveWindowConfig::default_end_hour")]
    pub end_hour: u32,
}

impl Default for ActiveWindowConfig {
    fn default() -> Self {
        Self {
            start_hour: Self::default_start_hour(),
            end_hour: Self::default_end_hour(),
        }
    }
}

impl ActiveWindowConfig {
    fn default_start_hour() -> u32 {
        6
    }
    fn default_end_hour() -> u32 {
        22
    }

    /// An unknown hour counts as active so an unsynchronized clock never
    /// silences the board.
    pub fn contains(&self, hour: Option<u32>) -> bool {
        match hour {
            Some(h) => h >= self.start_hour && h < self.end_hour,
            None => true,
        }
    }

    pub fn remaining_hours(&self, hour: u32) -> u32 {
        if hour < self.start_hour {
            self.end_hour - self.start_hour
        } else {
            self.end_hour.saturating_sub(hour)
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        let config: Config =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for dir in [&self.directions.outbound, &self.directions.inbound] {
            if dir.stops.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "direction '{}' has no stops",
                    dir.label
                )));
            }
            if dir.avg_calls_per_poll <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "direction '{}': avg_calls_per_poll must be positive",
                    dir.label
                )));
            }
        }
        if self.poll.min_interval_secs > self.poll.max_interval_secs {
            return Err(ConfigError::Invalid(
                "poll.min_interval_secs exceeds poll.max_interval_secs".to_string(),
            ));
        }
        if self.active_window.start_hour >= self.active_window.end_hour {
            return Err(ConfigError::Invalid(
                "active_window.start_hour must be before end_hour".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
