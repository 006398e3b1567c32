use async_trait::async_trait;

use super::Detector;
use super::stats::{amounts, mean, population_std_dev};
use crate::core::{Outlier, OutlierKind, Severity, Transaction};
use crate::error::DetectError;

/// Flags amounts more than `threshold` standard deviations from the batch mean.
#[derive(Debug, Clone)]
pub struct ZScoreDetector {
    threshold: f64,
    min_data_points: usize,
}

impl ZScoreDetector {
    pub fn new(threshold: f64, min_data_points: usize) -> Self {
        Self {
            threshold,
            min_data_points,
        }
    }

    pub fn severity(z: f64) -> Severity {
        let z = z.abs();
        if z >= 6.0 {
            Severity::Critical
        } else if z >= 5.0 {
            Severity::High
        } else if z >= 4.0 {
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
        let mean = mean(&values);
        let std_dev = population_std_dev(&values, mean);
        if std_dev == 0.0 {
            return Vec::new();
        }

        txs.iter()
            .zip(&values)
            .filter_map(|(tx, value)| {
                let z = (value - mean) / std_dev;
                if z.abs() <= self.threshold {
                    return None;
                }
                let mut outlier =
                    Outlier::for_transaction(OutlierKind::ZScore, Self::severity(z), tx)
                        .with_detail("mean", mean)
                        .with_detail("std_dev", std_dev)
                        .with_detail("z_score", z)
                        .with_detail("threshold", self.threshold)
                        .with_detail("sample_size", txs.len());
                outlier.z_score = Some(z);
                Some(outlier)
            })
            .collect()
    }
}

#[async_trait]
impl Detector for ZScoreDetector {
    fn name(&self) -> &'static str {
        "zscore"
    }

    async fn detect(&self, snapshot: &[Transaction]) -> Result<Vec<Outlier>, DetectError> {
        Ok(self.scan(snapshot))
    }
}
