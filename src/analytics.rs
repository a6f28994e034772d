//! Per-patient quiz analytics

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::quiz::MasteryRecord;

/// Accuracy per item type and review timestamps per item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSummary {
    /// Fraction of correct answers keyed by item type
    pub accuracy_by_category: BTreeMap<String, f64>,

    /// Last review keyed `"{item_type}:{item_id}"`
    pub last_seen: BTreeMap<String, Option<String>>,

    /// Next scheduled review keyed `"{item_type}:{item_id}"`
    pub next_due: BTreeMap<String, Option<String>>,
}

/// Build a summary from answer outcomes and mastery rows
pub fn summarize(outcomes: &[(String, bool)], mastery: &[MasteryRecord]) -> AnalyticsSummary {
    let mut tallies: BTreeMap<&str, (u32, u32)> = BTreeMap::new();
    for (category, correct) in outcomes {
        let (right, total) = tallies.entry(category.as_str()).or_default();
        *total += 1;
        if *correct {
            *right += 1;
        }
    }

    let mut summary = AnalyticsSummary::default();
    for (category, (right, total)) in tallies {
        summary
            .accuracy_by_category
            .insert(category.to_string(), right as f64 / total.max(1) as f64);
    }

    for record in mastery {
        let key = format!("{}:{}", record.item_type, record.item_id);
        summary
            .last_seen
            .insert(key.clone(), record.last_seen_at.map(|dt| dt.to_rfc3339()));
        summary
            .next_due
            .insert(key, record.next_due_at.map(|dt| dt.to_rfc3339()));
    }

    summary
}
