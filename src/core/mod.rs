pub mod pipeline;
pub mod shutdown;
pub mod tx;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// A confirmed token transfer, the unit every downstream stage works on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    pub from: String,
    pub to: String,
    /// Human-scale amount (base units / 10^6).
    pub amount: Decimal,
    pub contract: String,
    pub confirmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    /// Whether `next` is a legal successor. Disconnected is always reachable (close).
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connected, Reconnecting)
                | (Reconnecting, Connecting)
                | (Reconnecting, Error)
                | (Error, Connecting)
                | (Error, Reconnecting)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Outlier severity. Variant order is the total order used by deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Tiers shared by the ratio-based pattern checks (velocity, fan-out, fan-in).
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= 10.0 {
            Severity::Critical
        } else if ratio >= 5.0 {
            Severity::High
        } else if ratio >= 2.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Detection method that produced an outlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutlierKind {
    #[serde(rename = "zscore")]
    ZScore,
    #[serde(rename = "iqr")]
    Iqr,
    #[serde(rename = "pattern_circulation")]
    Circulation,
    #[serde(rename = "pattern_fanout")]
    FanOut,
    #[serde(rename = "pattern_fanin")]
    FanIn,
    #[serde(rename = "pattern_dormant")]
    Dormant,
    #[serde(rename = "pattern_velocity")]
    Velocity,
}

impl OutlierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutlierKind::ZScore => "zscore",
            OutlierKind::Iqr => "iqr",
            OutlierKind::Circulation => "pattern_circulation",
            OutlierKind::FanOut => "pattern_fanout",
            OutlierKind::FanIn => "pattern_fanin",
            OutlierKind::Dormant => "pattern_dormant",
            OutlierKind::Velocity => "pattern_velocity",
        }
    }
}

impl fmt::Display for OutlierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected anomaly. Never mutated after a detector returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outlier {
    pub id: Uuid,
    pub detected_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: OutlierKind,
    pub severity: Severity,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_score: Option<f64>,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default)]
    pub acknowledged: bool,
}

impl Outlier {
    pub fn new(kind: OutlierKind, severity: Severity, address: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            detected_at: Utc::now(),
            kind,
            severity,
            address: address.into(),
            transaction_hash: None,
            amount: None,
            z_score: None,
            details: Map::new(),
            acknowledged: false,
        }
    }

    /// Builder used by detectors for an outlier tied to one transaction.
    pub fn for_transaction(kind: OutlierKind, severity: Severity, tx: &Transaction) -> Self {
        let mut outlier = Self::new(kind, severity, tx.from.clone());
        outlier.transaction_hash = Some(tx.hash.clone());
        outlier.amount = Some(tx.amount);
        outlier
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Key used to group colliding outliers: transaction hash, falling back to address.
    pub fn dedup_key(&self) -> &str {
        match &self.transaction_hash {
            Some(hash) if !hash.is_empty() => hash,
            _ => &self.address,
        }
    }
}

#[cfg(test)]
pub(crate) fn make_test_tx(hash: &str, amount: Decimal) -> Transaction {
    Transaction {
        hash: hash.to_string(),
        block_number: 60_000_000,
        timestamp: Utc::now(),
        from: "TFromAddress".into(),
        to: "TToAddress".into(),
        amount,
        contract: "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".into(),
        confirmed: true,
    }
}
