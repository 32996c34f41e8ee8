use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{status_error, Provider, ProviderError, RawDeparture};

/// How many stop events to request per call. One fetch covers a whole stop,
/// so this only bounds payload size.
const EVENT_LIMIT: u32 = 20;

/// Client for a stop-monitoring API that returns upcoming stop events with
/// planned and estimated ISO-8601 times under a transportation descriptor.
pub struct StopMonitoringClient {
    client: Client,
    base_url: String,
}

impl StopMonitoringClient {
    pub fn new(base_url: &str) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Transport(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn parse_body(body: &str) -> Result<Vec<RawDeparture>, ProviderError> {
        let response: StopEventResponse = serde_json::from_str(body).map_err(|e| {
            tracing::warn!(
                error = %e,
                body = &body[..body.len().min(500)],
                "Failed to parse stop monitoring response"
            );
            ProviderError::Parse(e.to_string())
        })?;

        Ok(response
            .stop_events
            .iter()
            .filter_map(StopEvent::to_raw)
            .collect())
    }
}

#[async_trait]
impl Provider for StopMonitoringClient {
    async fn fetch(&self, stop_id: &str) -> Result<Vec<RawDeparture>, ProviderError> {
        let limit = EVENT_LIMIT.to_string();
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("mode", "direct"),
                ("name_dm", stop_id),
                ("type_dm", "stop"),
                ("depType", "stopEvents"),
                ("outputFormat", "rapidJSON"),
                ("useRealtime", "1"),
                ("limit", limit.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Self::parse_body(&body)
    }

    fn name(&self) -> &'static str {
        "stop_monitoring"
    }
}

// Response structures; optional throughout because upstream omits fields
// freely. Events missing a route or any usable time are skipped here, the
// rest of the payload still parses.

#[derive(Debug, Deserialize)]
struct StopEventResponse {
    #[serde(default, rename = "stopEvents")]
    stop_events: Vec<StopEvent>,
}

#[derive(Debug, Deserialize)]
struct StopEvent {
    #[serde(rename = "departureTimePlanned")]
    departure_time_planned: Option<String>,
    #[serde(rename = "departureTimeEstimated")]
    departure_time_estimated: Option<String>,
    transportation: Option<Transportation>,
}

#[derive(Debug, Deserialize)]
struct Transportation {
    number: Option<String>,
    destination: Option<Destination>,
}

#[derive(Debug, Deserialize)]
struct Destination {
    name: Option<String>,
}

impl StopEvent {
    fn to_raw(&self) -> Option<RawDeparture> {
        let transportation = self.transportation.as_ref()?;
        let route = transportation.number.clone()?;
        if self.departure_time_planned.is_none() && self.departure_time_estimated.is_none() {
            return None;
        }
        Some(RawDeparture {
            route,
            destination: transportation
                .destination
                .as_ref()
                .and_then(|d| d.name.clone())
                .unwrap_or_default(),
            aimed_time: self.departure_time_planned.clone(),
            expected_time: self.departure_time_estimated.clone(),
            estimate_minutes: None,
        })
    }
}
