use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{DegreeCount, DegreeDirection, NodeActivity, TransactionStore};
use crate::core::Transaction;
use crate::error::StoreError;

/// In-process store for tests.
#[derive(Default)]
pub struct MemoryStore {
    txs: Mutex<Vec<Transaction>>,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
    /// Answer activity queries the way the graph service does, without `previous_seen`.
    pub omit_previous_seen: AtomicBool,
}

impl MemoryStore {
    pub fn with(txs: Vec<Transaction>) -> Self {
        Self {
            txs: Mutex::new(txs),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            omit_previous_seen: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.txs.lock().unwrap().len()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Worker("store unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn write_transaction(&self, tx: &Transaction) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Worker("store rejected write".into()));
        }
        let mut txs = self.txs.lock().unwrap();
        if !txs.iter().any(|t| t.hash == tx.hash) {
            txs.push(tx.clone());
        }
        Ok(())
    }

    async fn query_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, StoreError> {
        self.check()?;
        let mut out: Vec<Transaction> = self
            .txs
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.timestamp >= start && t.timestamp <= end)
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.timestamp, &a.hash).cmp(&(b.timestamp, &b.hash)));
        let skip = out.len().saturating_sub(limit);
        out.drain(..skip);
        Ok(out)
    }

    async fn query_node_activity(&self, address: &str) -> Result<Option<NodeActivity>, StoreError> {
        self.check()?;
        let txs = self.txs.lock().unwrap();
        let mut times: Vec<DateTime<Utc>> = Vec::new();
        let (mut sent, mut received) = (0, 0);
        for tx in txs.iter() {
            if tx.from == address {
                sent += 1;
            }
            if tx.to == address {
                received += 1;
            }
            if tx.from == address || tx.to == address {
                times.push(tx.timestamp);
            }
        }
        if times.is_empty() {
            return Ok(None);
        }
        times.sort();
        let last = times.last().copied();
        let previous = times.iter().rev().find(|t| Some(**t) < last).copied();
        Ok(Some(NodeActivity {
            address: address.to_string(),
            first_seen: times.first().copied(),
            last_seen: last,
            previous_seen: previous.filter(|_| !self.omit_previous_seen.load(Ordering::SeqCst)),
            transaction_count: times.len() as u64,
            sent_count: sent,
            received_count: received,
        }))
    }

    async fn health(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn query_degrees(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        direction: DegreeDirection,
        min_degree: usize,
    ) -> Result<Vec<DegreeCount>, StoreError> {
        self.check()?;
        let txs = self.txs.lock().unwrap();
        let mut edges: HashMap<&str, (HashSet<&str>, usize)> = HashMap::new();
        for tx in txs.iter().filter(|t| t.timestamp >= start && t.timestamp <= end) {
            let (node, other) = match direction {
                DegreeDirection::Out => (tx.from.as_str(), tx.to.as_str()),
                DegreeDirection::In => (tx.to.as_str(), tx.from.as_str()),
            };
            let entry = edges.entry(node).or_default();
            entry.0.insert(other);
            entry.1 += 1;
        }
        let mut out: Vec<DegreeCount> = edges
            .into_iter()
            .filter(|(_, (peers, _))| peers.len() > min_degree)
            .map(|(address, (peers, count))| DegreeCount {
                address: address.to_string(),
                degree: peers.len(),
                transactions: count,
            })
            .collect();
        out.sort_by(|a, b| b.degree.cmp(&a.degree).then_with(|| a.address.cmp(&b.address)));
        Ok(out)
    }
}
