//! Answer grading

use serde_json::Value;

use super::QuestionType;

/// Normalised text form of an answer: trimmed and lowercased.
///
/// Strings compare as themselves, booleans as `true`/`false`, numbers in
/// their JSON form and null as `none`. Anything else compares as compact JSON.
pub fn answer_text(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Null => "none".to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    };
    text.trim().to_lowercase()
}

/// Grade a user's answer.
///
/// Recall questions also accept any of `acceptable`.
pub fn evaluate_answer(
    question_type: QuestionType,
    correct: &Value,
    user: &Value,
    acceptable: &[String],
) -> bool {
    let given = answer_text(user);
    if given == answer_text(correct) {
        return true;
    }

    question_type == QuestionType::Recall
        && acceptable
            .iter()
            .any(|a| a.trim().to_lowercase() == given)
}
