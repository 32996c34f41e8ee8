pub mod stop_monitoring;
pub mod transport_api;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// One departure entry as an upstream reports it, before filtering and
/// countdown math. Field availability varies by provider; the normalizer
/// copes with whatever subset is present.
#[derive(Debug, Clone, Default)]
pub struct RawDeparture {
    pub route: String,
    pub destination: String,
    /// Scheduled time, ISO-8601 or bare HH:MM local.
    pub aimed_time: Option<String>,
    /// Real-time estimate in the same formats, when the vehicle is tracked.
    pub expected_time: Option<String>,
    /// Relative "minutes away" estimate some providers supply directly.
    pub estimate_minutes: Option<i64>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Transport(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Parse error: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Transport failures are worth retrying; auth and parse failures are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transport(_))
    }
}

/// Capability boundary to one upstream departure source.
///
/// Implementations own their HTTP specifics; the engine only sees raw
/// entries and the error taxonomy above. One `fetch` equals one call against
/// the daily quota, retries included.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn fetch(&self, stop_id: &str) -> Result<Vec<RawDeparture>, ProviderError>;

    fn name(&self) -> &'static str;
}

/// Fetch with bounded retries on transient failure, backing off a little
/// longer each attempt.
pub async fn fetch_with_retry(
    provider: &dyn Provider,
    stop_id: &str,
    retry_limit: u32,
) -> Result<Vec<RawDeparture>, ProviderError> {
    let mut attempt = 0;
    loop {
        match provider.fetch(stop_id).await {
            Ok(entries) => return Ok(entries),
            Err(e) if e.is_transient() && attempt < retry_limit => {
                attempt += 1;
                tracing::warn!(
                    provider = provider.name(),
                    stop = stop_id,
                    attempt,
                    error = %e,
                    "Transient provider failure, retrying"
                );
                tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

pub(crate) fn status_error(status: reqwest::StatusCode) -> ProviderError {
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        ProviderError::Auth(format!("HTTP {status}"))
    } else {
        ProviderError::Transport(format!("HTTP {status}"))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Provider that replays canned per-stop results and records call order.
    pub struct ScriptedProvider {
        responses: Mutex<HashMap<String, Vec<Result<Vec<RawDeparture>, ProviderError>>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        pub fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn respond(
            mut self,
            stop: &str,
            result: Result<Vec<RawDeparture>, ProviderError>,
        ) -> Self {
            self.responses
                .get_mut()
                .unwrap()
                .entry(stop.to_string())
                .or_default()
                .push(result);
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn fetch(&self, stop_id: &str) -> Result<Vec<RawDeparture>, ProviderError> {
            self.calls.lock().unwrap().push(stop_id.to_string());
            let mut responses = self.responses.lock().unwrap();
            match responses.get_mut(stop_id) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => Ok(Vec::new()),
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }
}
