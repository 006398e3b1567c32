pub mod event;
pub mod ingest;
pub mod retry;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::FeedConfig;
use crate::error::FeedError;
use event::RawEvent;

/// Upstream source of contract events.
#[async_trait]
pub trait EventFeed: Send + Sync {
    /// Cheap reachability check used when (re)connecting.
    async fn probe(&self) -> Result<(), FeedError>;

    /// Events with a block timestamp strictly greater than `since_ms`, oldest first.
    async fn poll_events(&self, since_ms: i64, limit: usize) -> Result<FeedPage, FeedError>;
}

/// One page of decoded events plus the count of entries that failed to decode.
#[derive(Debug, Default)]
pub struct FeedPage {
    pub events: Vec<RawEvent>,
    pub undecodable: usize,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    error: Option<String>,
}

fn default_success() -> bool {
    true
}

/// Contract-events REST client.
pub struct HttpEventFeed {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    contract: String,
    event_name: String,
    only_confirmed: bool,
}

impl HttpEventFeed {
    pub fn new(config: &FeedConfig) -> Result<Self, FeedError> {
        let client = Client::builder()
            .timeout(config.request_timeout() + Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: Some(config.api_key.clone()).filter(|k| !k.is_empty()),
            contract: config.token_contract.clone(),
            event_name: config.event_name.clone(),
            only_confirmed: config.only_confirmed,
        })
    }

    fn events_url(&self) -> String {
        format!("{}/v1/contracts/{}/events", self.base_url, self.contract)
    }

    async fn fetch(&self, query: &[(&str, String)]) -> Result<Envelope, FeedError> {
        let mut req = self.client.get(self.events_url()).query(query);
        if let Some(key) = &self.api_key {
            req = req.header("TRON-PRO-API-KEY", key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FeedError::Status(status));
        }
        let body = resp.text().await?;
        let envelope: Envelope = serde_json::from_str(&body)?;
        if !envelope.success {
            return Err(FeedError::Upstream(
                envelope.error.unwrap_or_else(|| "success=false".into()),
            ));
        }
        Ok(envelope)
    }
}

#[async_trait]
impl EventFeed for HttpEventFeed {
    async fn probe(&self) -> Result<(), FeedError> {
        self.fetch(&[("limit", "1".to_string())]).await.map(|_| ())
    }

    async fn poll_events(&self, since_ms: i64, limit: usize) -> Result<FeedPage, FeedError> {
        let mut query = vec![
            ("event_name", self.event_name.clone()),
            ("order_by", "block_timestamp,asc".to_string()),
            ("limit", limit.to_string()),
            ("only_confirmed", self.only_confirmed.to_string()),
        ];
        if since_ms > 0 {
            query.push(("min_block_timestamp", (since_ms + 1).to_string()));
        }
        let envelope = self.fetch(&query).await?;
        Ok(decode_page(envelope.data))
    }
}

/// Decode entries one at a time so a single bad entry does not sink the page.
fn decode_page(data: Vec<Value>) -> FeedPage {
    let mut page = FeedPage::default();
    for entry in data {
        match serde_json::from_value::<RawEvent>(entry) {
            Ok(event) => page.events.push(event),
            Err(e) => {
                warn!("Skipping undecodable feed entry: {e}");
                page.undecodable += 1;
            }
        }
    }
    debug!(events = page.events.len(), undecodable = page.undecodable, "Decoded feed page");
    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_defaults() {
        let env: Envelope = serde_json::from_str(r#"{"data": []}"#).unwrap();
        assert!(env.success);
        let env: Envelope =
            serde_json::from_str(r#"{"success": false, "error": "rate limited"}"#).unwrap();
        assert!(!env.success);
        assert_eq!(env.error.as_deref(), Some("rate limited"));
    }

    #[test]
    fn bad_entries_are_counted_not_fatal() {
        let page = decode_page(vec![
            event::tests::transfer_json("tx1", 10, json!("1")),
            json!({ "event_name": "Transfer", "result": { "from": 42 } }),
            json!("not an object"),
        ]);
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.undecodable, 2);
    }

    #[test]
    fn url_and_key_from_config() {
        let config = FeedConfig {
            api_url: "https://feed.example/".into(),
            token_contract: "TContract".into(),
            ..FeedConfig::default()
        };
        let feed = HttpEventFeed::new(&config).unwrap();
        assert_eq!(feed.events_url(), "https://feed.example/v1/contracts/TContract/events");
        assert!(feed.api_key.is_none());
    }
}
