use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use super::{NodeActivity, TransactionStore};
use crate::core::Transaction;
use crate::error::StoreError;

/// Client for the temporal graph service.
pub struct GraphStoreClient {
    client: Client,
    base_url: String,
    contract: String,
}

#[derive(Debug, Serialize)]
struct TransactionPayload<'a> {
    tx_hash: &'a str,
    from: &'a str,
    to: &'a str,
    amount: String,
    /// Unix seconds.
    timestamp: i64,
    block_number: u64,
    contract: &'a str,
}

#[derive(Debug, Deserialize)]
struct WindowEntry {
    tx_hash: String,
    from: String,
    to: String,
    amount: String,
    block_number: u64,
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    address: String,
    first_seen: Option<i64>,
    last_seen: Option<i64>,
    #[serde(default)]
    previous_seen: Option<i64>,
    #[serde(default)]
    transaction_count: u64,
    #[serde(default)]
    sent_count: u64,
    #[serde(default)]
    received_count: u64,
}

fn from_secs(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

impl WindowEntry {
    fn into_transaction(self, contract: &str) -> Result<Transaction, StoreError> {
        let amount = Decimal::from_str(&self.amount).map_err(|e| {
            StoreError::InvalidRow(format!("{}: amount {:?}: {e}", self.tx_hash, self.amount))
        })?;
        let timestamp = self
            .timestamp
            .and_then(from_secs)
            .ok_or_else(|| StoreError::InvalidRow(format!("{}: missing timestamp", self.tx_hash)))?;
        Ok(Transaction {
            hash: self.tx_hash,
            block_number: self.block_number,
            timestamp,
            from: self.from,
            to: self.to,
            amount,
            contract: contract.to_string(),
            confirmed: true,
        })
    }
}

/// Convert a window response, skipping rows that cannot become a transaction.
fn decode_window(entries: Vec<WindowEntry>, contract: &str) -> Vec<Transaction> {
    let total = entries.len();
    let mut out: Vec<Transaction> = entries
        .into_iter()
        .filter_map(|entry| match entry.into_transaction(contract) {
            Ok(tx) => Some(tx),
            Err(e) => {
                warn!("Skipping window entry: {e}");
                None
            }
        })
        .collect();
    let skipped = total - out.len();
    if skipped > 0 {
        warn!(skipped, total, "Window response had unusable entries");
    }
    out.sort_by(|a, b| (a.timestamp, &a.hash).cmp(&(b.timestamp, &b.hash)));
    out
}

impl From<NodeInfo> for NodeActivity {
    fn from(info: NodeInfo) -> Self {
        Self {
            address: info.address,
            first_seen: info.first_seen.and_then(from_secs),
            last_seen: info.last_seen.and_then(from_secs),
            previous_seen: info.previous_seen.and_then(from_secs),
            transaction_count: info.transaction_count,
            sent_count: info.sent_count,
            received_count: info.received_count,
        }
    }
}

impl GraphStoreClient {
    pub fn new(base_url: &str, contract: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            contract: contract.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn check(status: StatusCode) -> Result<(), StoreError> {
        if status.is_success() {
            Ok(())
        } else {
            Err(StoreError::Status(status))
        }
    }
}

#[async_trait]
impl TransactionStore for GraphStoreClient {
    async fn write_transaction(&self, tx: &Transaction) -> Result<(), StoreError> {
        let payload = TransactionPayload {
            tx_hash: &tx.hash,
            from: &tx.from,
            to: &tx.to,
            amount: tx.amount.to_string(),
            timestamp: tx.timestamp.timestamp(),
            block_number: tx.block_number,
            contract: &tx.contract,
        };
        let resp = self
            .client
            .post(self.url("/graph/transaction"))
            .json(&payload)
            .send()
            .await?;
        Self::check(resp.status())
    }

    async fn query_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, StoreError> {
        let resp = self
            .client
            .get(self.url("/graph/window"))
            .query(&[
                ("start", start.timestamp()),
                ("end", end.timestamp()),
                ("limit", limit as i64),
            ])
            .send()
            .await?;
        Self::check(resp.status())?;
        let entries: Vec<WindowEntry> = resp.json().await?;
        Ok(decode_window(entries, &self.contract))
    }

    async fn query_node_activity(&self, address: &str) -> Result<Option<NodeActivity>, StoreError> {
        let resp = self
            .client
            .get(self.url(&format!("/graph/node/{address}")))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check(resp.status())?;
        let info: NodeInfo = resp.json().await?;
        Ok(Some(info.into()))
    }

    async fn health(&self) -> Result<(), StoreError> {
        let resp = self.client.get(self.url("/health")).send().await?;
        Self::check(resp.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::make_test_tx;
    use rust_decimal_macros::dec;

    #[test]
    fn payload_shape() {
        let tx = make_test_tx("h1", dec!(1.5));
        let payload = TransactionPayload {
            tx_hash: &tx.hash,
            from: &tx.from,
            to: &tx.to,
            amount: tx.amount.to_string(),
            timestamp: 1_700_000_000,
            block_number: tx.block_number,
            contract: &tx.contract,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["tx_hash"], "h1");
        assert_eq!(json["amount"], "1.5");
        assert_eq!(json["timestamp"], 1_700_000_000);
    }

    #[test]
    fn window_entry_gets_contract() {
        let entry: WindowEntry = serde_json::from_str(
            r#"{"tx_hash":"h","from":"A","to":"B","amount":"2.25","block_number":7,"timestamp":1700000000}"#,
        )
        .unwrap();
        let tx = entry.into_transaction("TContract").unwrap();
        assert_eq!(tx.contract, "TContract");
        assert_eq!(tx.amount, dec!(2.25));
        assert_eq!(tx.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn window_entry_without_timestamp_is_invalid() {
        let entry: WindowEntry = serde_json::from_str(
            r#"{"tx_hash":"h","from":"A","to":"B","amount":"1","block_number":7}"#,
        )
        .unwrap();
        assert!(matches!(
            entry.into_transaction("T"),
            Err(StoreError::InvalidRow(_))
        ));
    }

    #[test]
    fn window_skips_entries_without_timestamp() {
        let entries: Vec<WindowEntry> = serde_json::from_str(
            r#"[
                {"tx_hash":"late","from":"A","to":"B","amount":"1","block_number":9,"timestamp":1700000060},
                {"tx_hash":"gap","from":"A","to":"B","amount":"1","block_number":8,"timestamp":null},
                {"tx_hash":"early","from":"A","to":"B","amount":"1","block_number":7,"timestamp":1700000000}
            ]"#,
        )
        .unwrap();
        let txs = decode_window(entries, "T");
        let hashes: Vec<&str> = txs.iter().map(|t| t.hash.as_str()).collect();
        assert_eq!(hashes, ["early", "late"]);
    }

    #[test]
    fn node_info_conversion() {
        let info: NodeInfo = serde_json::from_str(
            r#"{"address":"A","first_seen":100,"last_seen":200,"transaction_count":3,"total_sent":1.0}"#,
        )
        .unwrap();
        let activity = NodeActivity::from(info);
        assert_eq!(activity.transaction_count, 3);
        assert_eq!(activity.last_seen.unwrap().timestamp(), 200);
        assert!(activity.previous_seen.is_none());
    }
}
