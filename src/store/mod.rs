pub mod graph;
pub mod schema;
pub mod sqlite;

#[cfg(test)]
pub(crate) mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::core::Transaction;
use crate::error::StoreError;

/// Activity summary for one address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeActivity {
    pub address: String,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    /// Most recent activity strictly before `last_seen`, when the backend can tell.
    pub previous_seen: Option<DateTime<Utc>>,
    pub transaction_count: u64,
    pub sent_count: u64,
    pub received_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegreeDirection {
    /// Distinct recipients per sender.
    Out,
    /// Distinct senders per recipient.
    In,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegreeCount {
    pub address: String,
    pub degree: usize,
    pub transactions: usize,
}

/// A closed chain of transfers returning to its origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Cycle {
    pub addresses: Vec<String>,
    pub transaction_hashes: Vec<String>,
    pub total_amount: Decimal,
}

/// Historical transaction store consulted by detection.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn write_transaction(&self, tx: &Transaction) -> Result<(), StoreError>;

    /// Transactions with `start <= timestamp <= end`, oldest first.
    async fn query_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, StoreError>;

    async fn query_node_activity(&self, address: &str) -> Result<Option<NodeActivity>, StoreError>;

    async fn health(&self) -> Result<(), StoreError>;

    /// Addresses whose distinct counterparty count within the window exceeds `min_degree`.
    async fn query_degrees(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _direction: DegreeDirection,
        _min_degree: usize,
    ) -> Result<Vec<DegreeCount>, StoreError> {
        Ok(Vec::new())
    }

    /// Transfer cycles of at most `max_hops` edges within the window.
    async fn query_cycles(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _max_hops: usize,
    ) -> Result<Vec<Cycle>, StoreError> {
        Ok(Vec::new())
    }
}

/// Bound a store call by `limit`.
pub async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(StoreError::Timeout(limit)))
}
