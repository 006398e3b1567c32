use async_trait::async_trait;

use super::Detector;
use super::stats::{amounts, quantile};
use crate::core::{Outlier, OutlierKind, Severity, Transaction};
use crate::error::DetectError;

/// Tukey's fences over the batch amounts.
#[derive(Debug, Clone)]
pub struct IqrDetector {
    multiplier: f64,
    min_data_points: usize,
}

impl IqrDetector {
    pub fn new(multiplier: f64, min_data_points: usize) -> Self {
        Self {
            multiplier,
            min_data_points,
        }
    }

    /// `deviation` is the distance past the nearest fence, in IQR units.
    pub fn severity(deviation: f64) -> Severity {
        if deviation >= 10.0 {
            Severity::Critical
        } else if deviation >= 5.0 {
            Severity::High
        } else if deviation >= 3.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn scan(&self, txs: &[Transaction]) -> Vec<Outlier> {
        if txs.is_empty() || txs.len() < self.min_data_points {
            return Vec::new();
        }
        let values = amounts(txs);
        let mut sorted = values.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let q1 = quantile(&sorted, 0.25);
        let q3 = quantile(&sorted, 0.75);
        let iqr = q3 - q1;
        let lower = q1 - self.multiplier * iqr;
        let upper = q3 + self.multiplier * iqr;

        txs.iter()
            .zip(&values)
            .filter_map(|(tx, &value)| {
                let (direction, distance) = if value < lower {
                    ("below", lower - value)
                } else if value > upper {
                    ("above", value - upper)
                } else {
                    return None;
                };
                let deviation = if iqr > 0.0 { distance / iqr } else { 0.0 };
                Some(
                    Outlier::for_transaction(OutlierKind::Iqr, Self::severity(deviation), tx)
                        .with_detail("q1", q1)
                        .with_detail("q3", q3)
                        .with_detail("iqr", iqr)
                        .with_detail("lower_bound", lower)
                        .with_detail("upper_bound", upper)
                        .with_detail("multiplier", self.multiplier)
                        .with_detail("deviation", deviation)
                        .with_detail("direction", direction)
                        .with_detail("sample_size", txs.len()),
                )
            })
            .collect()
    }
}

#[async_trait]
impl Detector for IqrDetector {
    fn name(&self) -> &'static str {
        "iqr"
    }

    async fn detect(&self, snapshot: &[Transaction]) -> Result<Vec<Outlier>, DetectError> {
        Ok(self.scan(snapshot))
    }
}
