//! Mastery scoring and review scheduling

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::MasteryRecord;
use crate::records::ItemType;

/// Score gained by a correct answer
const CORRECT_GAIN: f64 = 0.1;

/// Extra gain for a correct answer faster than [`FAST_RESPONSE_MS`]
const FAST_BONUS: f64 = 0.05;

/// Score lost by an incorrect answer
const INCORRECT_LOSS: f64 = 0.05;

pub const FAST_RESPONSE_MS: u64 = 3000;

/// Days until the next review for a mastery score
pub fn interval_days(score: f64) -> i64 {
    if score >= 0.8 {
        14
    } else if score >= 0.6 {
        7
    } else if score >= 0.4 {
        4
    } else if score >= 0.2 {
        2
    } else {
        1
    }
}

/// Apply one graded answer to an item's mastery
pub fn next_mastery(
    existing: Option<&MasteryRecord>,
    patient_id: Uuid,
    item_type: ItemType,
    item_id: Uuid,
    correct: bool,
    response_time_ms: u64,
    now: DateTime<Utc>,
) -> MasteryRecord {
    let mut score = existing.map(|m| m.mastery_score).unwrap_or(0.0);
    let mut consecutive_correct = existing.map(|m| m.consecutive_correct).unwrap_or(0);
    let mut consecutive_incorrect = existing.map(|m| m.consecutive_incorrect).unwrap_or(0);

    if correct {
        consecutive_correct += 1;
        consecutive_incorrect = 0;
        score = (score + CORRECT_GAIN).min(1.0);
        if response_time_ms < FAST_RESPONSE_MS {
            score = (score + FAST_BONUS).min(1.0);
        }
    } else {
        consecutive_incorrect += 1;
        consecutive_correct = 0;
        score = (score - INCORRECT_LOSS).max(0.0);
    }

    MasteryRecord {
        patient_id,
        item_type,
        item_id,
        mastery_score: score,
        consecutive_correct,
        consecutive_incorrect,
        last_seen_at: Some(now),
        next_due_at: Some(now + Duration::days(interval_days(score))),
    }
}
