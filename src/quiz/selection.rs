//! Choosing what to ask about, and fallback questions when no model is available

use std::collections::HashSet;

use serde_json::Value;
use uuid::Uuid;

use super::{DueItem, QuestionDraft, QuestionType};
use crate::records::{FamilyMember, ItemType, KnowledgeItem};

/// Knowledge items at or above this level are only quizzed on request
pub const SENSITIVE_LEVEL: u8 = 2;

/// Something a question can be about
#[derive(Debug, Clone, PartialEq)]
pub enum QuizItem {
    Knowledge(KnowledgeItem),
    Family(FamilyMember),
}

impl QuizItem {
    pub fn id(&self) -> Uuid {
        match self {
            QuizItem::Knowledge(k) => k.id,
            QuizItem::Family(f) => f.id,
        }
    }

    pub fn item_type(&self) -> ItemType {
        match self {
            QuizItem::Knowledge(_) => ItemType::Knowledge,
            QuizItem::Family(_) => ItemType::Family,
        }
    }

    /// What the question asks about
    pub fn subject(&self) -> &str {
        match self {
            QuizItem::Knowledge(k) => &k.label,
            QuizItem::Family(f) => &f.full_name,
        }
    }

    /// The expected answer
    pub fn answer(&self) -> &str {
        match self {
            QuizItem::Knowledge(k) => &k.value,
            QuizItem::Family(f) => &f.full_name,
        }
    }
}

/// Knowledge items eligible for a quiz
pub fn eligible_knowledge(items: &[KnowledgeItem], include_sensitive: bool) -> Vec<KnowledgeItem> {
    items
        .iter()
        .filter(|k| k.is_active && (include_sensitive || k.sensitivity_level < SENSITIVE_LEVEL))
        .cloned()
        .collect()
}

/// Pick up to `n` items: due items first, then the remaining knowledge items,
/// then the remaining family members. Due entries that don't resolve to an
/// eligible item are skipped.
pub fn select_items(
    knowledge: &[KnowledgeItem],
    family: &[FamilyMember],
    due: &[DueItem],
    n: usize,
) -> Vec<QuizItem> {
    let mut selected = Vec::new();
    let mut seen = HashSet::new();

    for d in due {
        let item = match d.item_type {
            ItemType::Knowledge => knowledge
                .iter()
                .find(|k| k.id == d.item_id)
                .cloned()
                .map(QuizItem::Knowledge),
            ItemType::Family => family
                .iter()
                .find(|f| f.id == d.item_id)
                .cloned()
                .map(QuizItem::Family),
        };
        if let Some(item) = item {
            if seen.insert(item.id()) {
                selected.push(item);
            }
        }
    }

    let rest = knowledge
        .iter()
        .cloned()
        .map(QuizItem::Knowledge)
        .chain(family.iter().cloned().map(QuizItem::Family));
    for item in rest {
        if selected.len() >= n {
            break;
        }
        if seen.insert(item.id()) {
            selected.push(item);
        }
    }

    selected.truncate(n);
    selected
}

/// One simple multiple-choice question per item
pub fn fallback_questions(items: &[QuizItem]) -> Vec<QuestionDraft> {
    items
        .iter()
        .map(|item| QuestionDraft {
            question_type: QuestionType::Mcq,
            prompt: format!("Who/What is {}?", item.subject()),
            options: Some(vec![item.answer().to_string(), "Not sure".to_string()]),
            correct_answer: Value::String(item.answer().to_string()),
            item_type: item.item_type(),
            item_id: item.id(),
            difficulty: 1,
            acceptable_answers: Some(Vec::new()),
        })
        .collect()
}
