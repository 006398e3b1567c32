use std::collections::HashMap;

use crate::core::Outlier;

/// Collapse outliers sharing a key (transaction hash, else address) to the most
/// severe one. Ties keep the first seen; output follows first-seen key order.
pub fn deduplicate(candidates: Vec<Outlier>) -> Vec<Outlier> {
    let mut slots: HashMap<String, usize> = HashMap::with_capacity(candidates.len());
    let mut kept: Vec<Outlier> = Vec::with_capacity(candidates.len());

    for outlier in candidates {
        match slots.get(outlier.dedup_key()) {
            Some(&slot) => {
                if outlier.severity > kept[slot].severity {
                    kept[slot] = outlier;
                }
            }
            None => {
                slots.insert(outlier.dedup_key().to_string(), kept.len());
                kept.push(outlier);
            }
        }
    }
    kept
}
