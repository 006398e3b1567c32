use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::Detector;
use crate::config::PatternConfig;
use crate::core::{Outlier, OutlierKind, Severity, Transaction};
use crate::error::{DetectError, StoreError};
use crate::store::{
    Cycle, DegreeCount, DegreeDirection, NodeActivity, TransactionStore, with_timeout,
};

/// Cycles longer than this are not requested from the store.
const MAX_CYCLE_HOPS: usize = 6;

#[derive(Debug, Clone)]
pub struct PatternSettings {
    pub velocity_window: Duration,
    pub velocity_threshold: usize,
    pub dormancy: Duration,
    pub fan_out_threshold: usize,
    pub fan_in_threshold: usize,
    pub max_activity_lookups: usize,
    /// Cap on transactions fetched for the velocity window.
    pub window_limit: usize,
    /// How recent an address's latest transfer must be to count as awakening.
    pub recent_activity: Duration,
}

impl From<&PatternConfig> for PatternSettings {
    fn from(config: &PatternConfig) -> Self {
        Self {
            velocity_window: Duration::from_secs(config.velocity_window_secs),
            velocity_threshold: config.velocity_threshold,
            dormancy: Duration::from_secs(config.dormancy_days * 24 * 3600),
            fan_out_threshold: config.fan_out_threshold,
            fan_in_threshold: config.fan_in_threshold,
            max_activity_lookups: config.max_activity_lookups,
            window_limit: 10_000,
            recent_activity: Duration::from_secs(3600),
        }
    }
}

/// Structural checks backed by store queries rather than the shared snapshot.
pub struct PatternDetector {
    store: Arc<dyn TransactionStore>,
    settings: PatternSettings,
    call_timeout: Duration,
    dormancy_unresolved: AtomicBool,
}

/// Last activity before an address's recent burst.
#[derive(Debug, Clone, Copy, PartialEq)]
enum PreviousActivity {
    At(DateTime<Utc>),
    /// Quiet since at least this instant; the exact time is unknown.
    Before(DateTime<Utc>),
}

fn chrono_span(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::days(365 * 100))
}

pub fn dormancy_severity(days: i64) -> Severity {
    if days >= 365 {
        Severity::Critical
    } else if days >= 180 {
        Severity::High
    } else if days >= 90 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

impl PatternDetector {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        settings: PatternSettings,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            settings,
            call_timeout,
            dormancy_unresolved: AtomicBool::new(false),
        }
    }

    /// Addresses touched (either side) by more than the threshold within `recent`.
    pub fn velocity(&self, recent: &[Transaction]) -> Vec<Outlier> {
        let threshold = self.settings.velocity_threshold.max(1);
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for tx in recent {
            *counts.entry(tx.from.as_str()).or_default() += 1;
            if tx.to != tx.from {
                *counts.entry(tx.to.as_str()).or_default() += 1;
            }
        }

        let mut hot: Vec<(&str, usize)> = counts
            .into_iter()
            .filter(|(_, count)| *count > threshold)
            .collect();
        hot.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        hot.into_iter()
            .map(|(address, count)| {
                let ratio = count as f64 / threshold as f64;
                Outlier::new(OutlierKind::Velocity, Severity::from_ratio(ratio), address)
                    .with_detail("transaction_count", count)
                    .with_detail("threshold", threshold)
                    .with_detail("ratio", ratio)
                    .with_detail("window_secs", self.settings.velocity_window.as_secs())
            })
            .collect()
    }

    /// Addresses that just transacted after a gap longer than the dormancy period.
    pub async fn dormant(
        &self,
        recent: &[Transaction],
        now: DateTime<Utc>,
    ) -> Result<Vec<Outlier>, StoreError> {
        let recent_cutoff = now - chrono_span(self.settings.recent_activity);
        let dormancy = chrono_span(self.settings.dormancy);

        let mut seen = HashSet::new();
        let candidates: Vec<&str> = recent
            .iter()
            .filter(|tx| tx.timestamp >= recent_cutoff)
            .flat_map(|tx| [tx.from.as_str(), tx.to.as_str()])
            .filter(|addr| seen.insert(*addr))
            .take(self.settings.max_activity_lookups)
            .collect();

        let mut out = Vec::new();
        for address in candidates {
            let activity = with_timeout(
                self.call_timeout,
                self.store.query_node_activity(address),
            )
            .await?;
            let Some(activity) = activity else { continue };
            let Some(last) = activity.last_seen else { continue };
            if last < recent_cutoff {
                continue;
            }
            let previous = self
                .previous_activity(address, &activity, last, recent)
                .await?;
            let Some(previous) = previous else { continue };

            let outlier = match previous {
                PreviousActivity::At(previous) => {
                    let gap = last - previous;
                    if gap <= dormancy {
                        continue;
                    }
                    let days = gap.num_days();
                    Outlier::new(OutlierKind::Dormant, dormancy_severity(days), address)
                        .with_detail("dormant_days", days)
                        .with_detail("previous_seen", previous.to_rfc3339())
                }
                PreviousActivity::Before(bound) => {
                    let days = (last - bound).num_days();
                    Outlier::new(OutlierKind::Dormant, dormancy_severity(days), address)
                        .with_detail("dormant_days_at_least", days)
                        .with_detail("previous_seen_before", bound.to_rfc3339())
                }
            };
            out.push(
                outlier
                    .with_detail("last_seen", last.to_rfc3339())
                    .with_detail("dormancy_threshold_days", dormancy.num_days())
                    .with_detail("transaction_count", activity.transaction_count),
            );
        }
        Ok(out)
    }

    /// When the address was active before its current burst. Backends without
    /// `previous_seen` are answered from `first_seen` and the window query.
    async fn previous_activity(
        &self,
        address: &str,
        activity: &NodeActivity,
        last: DateTime<Utc>,
        recent: &[Transaction],
    ) -> Result<Option<PreviousActivity>, StoreError> {
        if let Some(previous) = activity.previous_seen {
            return Ok(Some(PreviousActivity::At(previous)));
        }

        let mut burst = recent
            .iter()
            .filter(|tx| tx.from == address || tx.to == address);
        let Some(first_recent) = burst.next() else {
            return Ok(None);
        };
        let burst_len = 1 + burst.count() as u64;
        let burst_start = first_recent.timestamp;
        let Some(first_seen) = activity.first_seen.filter(|first| *first < burst_start) else {
            return Ok(None);
        };

        // A single transfer before the burst is the first one ever seen.
        if activity.transaction_count <= burst_len + 1 {
            return Ok(Some(PreviousActivity::At(first_seen)));
        }

        // Otherwise look for the address in the dormancy span preceding the burst.
        let span_start = last - chrono_span(self.settings.dormancy);
        if first_seen >= span_start {
            return Ok(None);
        }
        let span_end = burst_start - ChronoDuration::milliseconds(1);
        let limit = self.settings.window_limit;
        let before = with_timeout(
            self.call_timeout,
            self.store.query_window(span_start, span_end, limit),
        )
        .await?;
        if let Some(tx) = before
            .iter()
            .rev()
            .find(|tx| tx.from == address || tx.to == address)
        {
            return Ok(Some(PreviousActivity::At(tx.timestamp)));
        }
        if before.len() < limit {
            return Ok(Some(PreviousActivity::Before(span_start)));
        }

        if !self.dormancy_unresolved.swap(true, Ordering::Relaxed) {
            warn!(
                address,
                "Store reports no previous_seen and the preceding window exceeds the limit; \
                 dormancy cannot be evaluated for such addresses"
            );
        }
        Ok(None)
    }

    async fn fan(
        &self,
        direction: DegreeDirection,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Outlier>, StoreError> {
        let (kind, threshold) = match direction {
            DegreeDirection::Out => (OutlierKind::FanOut, self.settings.fan_out_threshold),
            DegreeDirection::In => (OutlierKind::FanIn, self.settings.fan_in_threshold),
        };
        if threshold == 0 {
            return Ok(Vec::new());
        }
        let degrees = with_timeout(
            self.call_timeout,
            self.store.query_degrees(start, end, direction, threshold),
        )
        .await?;
        Ok(degrees
            .into_iter()
            .filter(|d| d.degree > threshold)
            .map(|d| fan_outlier(kind, threshold, d))
            .collect())
    }

    async fn circulation(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Outlier>, StoreError> {
        let cycles = with_timeout(
            self.call_timeout,
            self.store.query_cycles(start, end, MAX_CYCLE_HOPS),
        )
        .await?;
        Ok(cycles.into_iter().filter_map(cycle_outlier).collect())
    }
}

fn fan_outlier(kind: OutlierKind, threshold: usize, degree: DegreeCount) -> Outlier {
    let ratio = degree.degree as f64 / threshold as f64;
    Outlier::new(kind, Severity::from_ratio(ratio), degree.address)
        .with_detail("distinct_counterparties", degree.degree)
        .with_detail("transaction_count", degree.transactions)
        .with_detail("threshold", threshold)
}

fn cycle_outlier(cycle: Cycle) -> Option<Outlier> {
    let origin = cycle.addresses.first()?.clone();
    let hops = cycle.transaction_hashes.len();
    let severity = if hops >= 5 {
        Severity::Critical
    } else {
        Severity::High
    };
    let mut outlier = Outlier::new(OutlierKind::Circulation, severity, origin)
        .with_detail("path", cycle.addresses)
        .with_detail("hops", hops)
        .with_detail("transaction_hashes", cycle.transaction_hashes)
        .with_detail("total_amount", cycle.total_amount.to_string());
    outlier.amount = Some(cycle.total_amount);
    Some(outlier)
}

#[async_trait]
impl Detector for PatternDetector {
    fn name(&self) -> &'static str {
        "pattern"
    }

    async fn detect(&self, _snapshot: &[Transaction]) -> Result<Vec<Outlier>, DetectError> {
        let now = Utc::now();
        let start = now - chrono_span(self.settings.velocity_window);
        let recent = with_timeout(
            self.call_timeout,
            self.store.query_window(start, now, self.settings.window_limit),
        )
        .await?;

        let mut found = self.velocity(&recent);
        found.extend(self.dormant(&recent, now).await?);
        found.extend(self.fan(DegreeDirection::Out, start, now).await?);
        found.extend(self.fan(DegreeDirection::In, start, now).await?);
        found.extend(self.circulation(start, now).await?);

        debug!(recent = recent.len(), found = found.len(), "Pattern checks complete");
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::make_test_tx;
    use crate::store::memory::MemoryStore;
    use rust_decimal_macros::dec;

    fn settings() -> PatternSettings {
        PatternSettings {
            velocity_window: Duration::from_secs(3600),
            velocity_threshold: 5,
            dormancy: Duration::from_secs(30 * 24 * 3600),
            fan_out_threshold: 3,
            fan_in_threshold: 3,
            max_activity_lookups: 100,
            window_limit: 1000,
            recent_activity: Duration::from_secs(3600),
        }
    }

    fn transfer(hash: &str, from: &str, to: &str, at: DateTime<Utc>) -> Transaction {
        let mut tx = make_test_tx(hash, dec!(100));
        tx.from = from.into();
        tx.to = to.into();
        tx.timestamp = at;
        tx
    }

    fn detector(store: Arc<MemoryStore>) -> PatternDetector {
        PatternDetector::new(store, settings(), Duration::from_secs(5))
    }

    #[test]
    fn velocity_counts_both_sides() {
        let now = Utc::now();
        let mut recent: Vec<Transaction> = (0..8)
            .map(|i| transfer(&format!("out{i}"), "busy", &format!("r{i}"), now))
            .collect();
        recent.extend((0..4).map(|i| transfer(&format!("in{i}"), &format!("s{i}"), "busy", now)));

        let outliers = detector(Arc::new(MemoryStore::default())).velocity(&recent);
        assert_eq!(outliers.len(), 1);
        assert_eq!(outliers[0].address, "busy");
        assert_eq!(outliers[0].kind, OutlierKind::Velocity);
        // 12 / 5 = 2.4
        assert_eq!(outliers[0].severity, Severity::Medium);
        assert_eq!(outliers[0].details["transaction_count"], 12);
    }

    #[test]
    fn velocity_at_threshold_is_quiet() {
        let now = Utc::now();
        let recent: Vec<Transaction> = (0..5)
            .map(|i| transfer(&format!("t{i}"), "steady", &format!("r{i}"), now))
            .collect();
        assert!(detector(Arc::new(MemoryStore::default())).velocity(&recent).is_empty());
    }

    #[tokio::test]
    async fn dormant_awakening() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::with(vec![
            transfer("old", "sleeper", "x", now - ChronoDuration::days(400)),
            transfer("new", "sleeper", "y", now - ChronoDuration::minutes(10)),
            transfer("a", "regular", "z", now - ChronoDuration::days(2)),
            transfer("b", "regular", "z", now - ChronoDuration::minutes(5)),
        ]));
        let recent = store
            .query_window(now - ChronoDuration::hours(1), now, 1000)
            .await
            .unwrap();

        let outliers = detector(store).dormant(&recent, now).await.unwrap();
        assert_eq!(outliers.len(), 1);
        assert_eq!(outliers[0].address, "sleeper");
        assert_eq!(outliers[0].severity, Severity::Critical);
        assert_eq!(outliers[0].details["dormant_days"], 399);
    }

    #[tokio::test]
    async fn dormant_awakening_without_previous_seen() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::with(vec![
            transfer("old", "sleeper", "x", now - ChronoDuration::days(400)),
            transfer("new", "sleeper", "y", now - ChronoDuration::minutes(5)),
            transfer("a", "regular", "z", now - ChronoDuration::days(2)),
            transfer("b", "regular", "z", now - ChronoDuration::minutes(4)),
        ]));
        store.omit_previous_seen.store(true, Ordering::SeqCst);
        let recent = store
            .query_window(now - ChronoDuration::hours(1), now, 1000)
            .await
            .unwrap();

        let outliers = detector(store).dormant(&recent, now).await.unwrap();
        assert_eq!(outliers.len(), 1);
        assert_eq!(outliers[0].address, "sleeper");
        assert_eq!(outliers[0].severity, Severity::Critical);
        assert_eq!(outliers[0].details["dormant_days"], 399);
    }

    #[tokio::test]
    async fn quiet_span_bounds_dormancy_without_previous_seen() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::with(vec![
            transfer("first", "sleeper", "x", now - ChronoDuration::days(500)),
            transfer("second", "sleeper", "x", now - ChronoDuration::days(400)),
            transfer("new", "sleeper", "y", now - ChronoDuration::minutes(5)),
            transfer("c1", "busy", "z", now - ChronoDuration::days(90)),
            transfer("c2", "busy", "z", now - ChronoDuration::days(10)),
            transfer("c3", "busy", "z", now - ChronoDuration::minutes(3)),
        ]));
        store.omit_previous_seen.store(true, Ordering::SeqCst);
        let recent = store
            .query_window(now - ChronoDuration::hours(1), now, 1000)
            .await
            .unwrap();

        let outliers = detector(store).dormant(&recent, now).await.unwrap();
        assert_eq!(outliers.len(), 1);
        assert_eq!(outliers[0].address, "sleeper");
        assert_eq!(outliers[0].details["dormant_days_at_least"], 30);
        assert!(outliers[0].details.get("dormant_days").is_none());
    }

    #[test]
    fn dormancy_tiers() {
        assert_eq!(dormancy_severity(45), Severity::Low);
        assert_eq!(dormancy_severity(90), Severity::Medium);
        assert_eq!(dormancy_severity(200), Severity::High);
        assert_eq!(dormancy_severity(365), Severity::Critical);
    }

    #[tokio::test]
    async fn fan_out_from_degree_query() {
        let now = Utc::now();
        let txs: Vec<Transaction> = (0..7)
            .map(|i| transfer(&format!("f{i}"), "spray", &format!("r{i}"), now - ChronoDuration::minutes(1)))
            .collect();
        let store = Arc::new(MemoryStore::with(txs));

        let outliers = detector(store).detect(&[]).await.unwrap();
        let fan_out: Vec<&Outlier> = outliers
            .iter()
            .filter(|o| o.kind == OutlierKind::FanOut)
            .collect();
        assert_eq!(fan_out.len(), 1);
        assert_eq!(fan_out[0].address, "spray");
        assert_eq!(fan_out[0].details["distinct_counterparties"], 7);
        // 7 / 3 ≈ 2.3
        assert_eq!(fan_out[0].severity, Severity::Medium);
        assert!(outliers.iter().all(|o| o.kind != OutlierKind::FanIn));
    }

    #[test]
    fn cycle_becomes_circulation_outlier() {
        let cycle = Cycle {
            addresses: vec!["A".into(), "B".into(), "C".into()],
            transaction_hashes: vec!["h1".into(), "h2".into(), "h3".into()],
            total_amount: dec!(300),
        };
        let outlier = cycle_outlier(cycle).unwrap();
        assert_eq!(outlier.kind, OutlierKind::Circulation);
        assert_eq!(outlier.address, "A");
        assert_eq!(outlier.severity, Severity::High);
        assert_eq!(outlier.amount, Some(dec!(300)));
    }

    #[tokio::test]
    async fn store_failure_fails_detector() {
        let store = Arc::new(MemoryStore::default());
        store.fail_reads.store(true, Ordering::SeqCst);
        let result = detector(store).detect(&[]).await;
        assert!(matches!(result, Err(DetectError::Store(_))));
    }
}
