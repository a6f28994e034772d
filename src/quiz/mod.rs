//! Adaptive quiz: question types, sessions, grading and mastery tracking

pub mod engine;
pub mod grading;
pub mod mastery;
pub mod selection;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::records::ItemType;

pub use engine::{GenerateOptions, GeneratedQuiz, QuizEngine, SubmissionItem, SubmissionResult};

/// Shape of a quiz question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    /// Multiple choice
    Mcq,

    /// Free recall, graded against acceptable answers too
    Recall,

    /// Identify a person from their photo
    PhotoIdentity,

    TrueFalse,
}

impl std::fmt::Display for QuestionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuestionType::Mcq => write!(f, "mcq"),
            QuestionType::Recall => write!(f, "recall"),
            QuestionType::PhotoIdentity => write!(f, "photo_identity"),
            QuestionType::TrueFalse => write!(f, "true_false"),
        }
    }
}

fn default_difficulty() -> u8 {
    1
}

/// A generated question before it is stored; this is also the persisted payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionDraft {
    pub question_type: QuestionType,
    pub prompt: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,

    /// Expected answer; any JSON scalar
    #[serde(default)]
    pub correct_answer: serde_json::Value,

    pub item_type: ItemType,
    pub item_id: Uuid,

    #[serde(default = "default_difficulty")]
    pub difficulty: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptable_answers: Option<Vec<String>>,
}

/// Lifecycle of a quiz session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            _ => Err(Error::storage(format!("Unknown session status: {}", s))),
        }
    }
}

/// A quiz session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizSession {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub total_questions: u32,

    /// Fraction of correct answers, set on completion
    pub score: Option<f64>,

    pub avg_response_time_ms: Option<f64>,
}

/// A question stored within a session
#[derive(Debug, Clone, PartialEq)]
pub struct StoredQuestion {
    pub id: Uuid,
    pub session_id: Uuid,
    pub payload: QuestionDraft,
    pub created_at: DateTime<Utc>,
}

/// One graded answer, ready to persist
#[derive(Debug, Clone, PartialEq)]
pub struct GradedResponse {
    pub question_id: Uuid,

    /// Item the question was about
    pub item_type: ItemType,
    pub item_id: Uuid,

    pub user_answer: serde_json::Value,
    pub correct: bool,
    pub response_time_ms: u64,
}

/// Per-item recall strength and review schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasteryRecord {
    pub patient_id: Uuid,
    pub item_type: ItemType,
    pub item_id: Uuid,

    /// 0.0 (unknown) to 1.0 (mastered)
    pub mastery_score: f64,

    pub consecutive_correct: u32,
    pub consecutive_incorrect: u32,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub next_due_at: Option<DateTime<Utc>>,
}

/// An item due for review, with or without mastery history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DueItem {
    pub item_type: ItemType,
    pub item_id: Uuid,
    pub next_due_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
}
