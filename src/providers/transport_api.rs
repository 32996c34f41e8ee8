use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{status_error, Provider, ProviderError, RawDeparture};

/// Client for a live-departure-board REST API that groups upcoming buses by
/// route under a single stop resource.
pub struct TransportApiClient {
    client: Client,
    base_url: String,
    app_id: String,
    app_key: String,
}

impl TransportApiClient {
    pub fn new(base_url: &str, app_id: &str, app_key: &str) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Transport(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            app_id: app_id.to_string(),
            app_key: app_key.to_string(),
        })
    }

    fn parse_body(body: &str) -> Result<Vec<RawDeparture>, ProviderError> {
        let response: LiveBoardResponse = serde_json::from_str(body).map_err(|e| {
            tracing::warn!(
                error = %e,
                body = &body[..body.len().min(500)],
                "Failed to parse live board response"
            );
            ProviderError::Parse(e.to_string())
        })?;

        let mut raw = Vec::new();
        for (route, entries) in response.departures {
            for entry in entries {
                raw.push(RawDeparture {
                    route: entry.line.unwrap_or_else(|| route.clone()),
                    destination: entry.direction.unwrap_or_default(),
                    aimed_time: entry.aimed_departure_time,
                    expected_time: entry.expected_departure_time,
                    // The board reports its best guess as whole minutes away.
                    estimate_minutes: entry
                        .best_departure_estimate
                        .and_then(|s| s.trim().parse().ok()),
                });
            }
        }
        Ok(raw)
    }
}

#[async_trait]
impl Provider for TransportApiClient {
    async fn fetch(&self, stop_id: &str) -> Result<Vec<RawDeparture>, ProviderError> {
        let url = format!(
            "{}/v3/uk/bus/stop/{}/live.json",
            self.base_url,
            urlencoding::encode(stop_id)
        );

        let response = self
            .client
            .get(&url)
            .query(&[
                ("app_id", self.app_id.as_str()),
                ("app_key", self.app_key.as_str()),
                ("group", "route"),
                ("nextbuses", "yes"),
                ("limit", "8"),
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
        "transport_api"
    }
}

#[derive(Debug, Deserialize)]
struct LiveBoardResponse {
    #[serde(default)]
    departures: HashMap<String, Vec<LiveBoardEntry>>,
}

#[derive(Debug, Deserialize)]
struct LiveBoardEntry {
    line: Option<String>,
    direction: Option<String>,
    aimed_departure_time: Option<String>,
    expected_departure_time: Option<String>,
    best_departure_estimate: Option<String>,
}
