//! Quiz generation and submission

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::grading::evaluate_answer;
use super::mastery::next_mastery;
use super::selection::{eligible_knowledge, fallback_questions, select_items, QuizItem};
use super::{GradedResponse, QuestionDraft, QuestionType, QuizSession, SessionStatus};
use crate::error::{Error, Result};
use crate::llm::{GenerationRequest, QuestionGenerator};
use crate::records::{ItemType, Patient};
use crate::store::CareStore;

/// Most questions a single session may hold
pub const MAX_QUESTIONS: usize = 50;

/// Options for generating a quiz
#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    /// Number of questions wanted
    pub n: usize,

    /// Allow knowledge items at or above the sensitive level
    pub include_sensitive: bool,

    /// Return acceptable answers alongside the questions
    pub reveal_answers: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            n: 7,
            include_sensitive: false,
            reveal_answers: false,
        }
    }
}

/// A question as handed to the client; never carries the correct answer
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedQuestion {
    pub question_id: Uuid,
    pub question_type: QuestionType,
    pub prompt: String,
    pub options: Option<Vec<String>>,
    pub item_type: ItemType,
    pub item_id: Uuid,
    pub difficulty: u8,
    pub acceptable_answers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedQuiz {
    pub session_id: Uuid,
    pub questions: Vec<GeneratedQuestion>,
}

/// One answered question
#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionItem {
    pub question_id: Uuid,
    pub user_answer: Value,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionResult {
    pub session_id: Uuid,
    pub score: f64,
    pub total_questions: usize,
    pub correct: usize,
    pub avg_response_time_ms: Option<f64>,

    /// Question ids answered incorrectly
    pub weak_items: Vec<Uuid>,
}

/// Runs quizzes on top of a [`CareStore`]
pub struct QuizEngine {
    generator: Option<Arc<dyn QuestionGenerator>>,
}

impl QuizEngine {
    /// Create an engine; without a generator every quiz uses fallback questions
    pub fn new(generator: Option<Arc<dyn QuestionGenerator>>) -> Self {
        Self { generator }
    }

    /// Generate a quiz session for a patient
    pub async fn generate(
        &self,
        store: &CareStore,
        patient_id: Uuid,
        options: GenerateOptions,
    ) -> Result<GeneratedQuiz> {
        if options.n == 0 || options.n > MAX_QUESTIONS {
            return Err(Error::invalid_input(format!(
                "n must be between 1 and {}",
                MAX_QUESTIONS
            )));
        }

        let patient = store.require_patient(patient_id)?;
        let family = store.list_family_members(patient_id)?;
        let knowledge = store.list_knowledge_items(patient_id, None)?;
        let due = store.sqlite().due_items(patient_id, Utc::now())?;

        let eligible = eligible_knowledge(&knowledge, options.include_sensitive);
        let pool = select_items(&eligible, &family, &due, options.n);
        if pool.is_empty() {
            return Err(Error::invalid_input(
                "Patient has no knowledge items or family members to quiz on",
            ));
        }

        let request = GenerationRequest {
            patient_name: patient.full_name.clone(),
            family_members: family,
            knowledge_items: eligible,
            due_items: due,
            n: options.n,
        };
        let questions = self.draft_questions(&patient, &request, &pool).await;

        let session = QuizSession {
            id: Uuid::new_v4(),
            patient_id,
            created_at: Utc::now(),
            status: SessionStatus::Active,
            total_questions: questions.len() as u32,
            score: None,
            avg_response_time_ms: None,
        };
        let ids = store
            .sqlite()
            .create_session_with_questions(&session, &questions)?;

        tracing::info!(
            "Created quiz session {} for patient {} with {} questions",
            session.id,
            patient_id,
            questions.len()
        );

        let questions = ids
            .into_iter()
            .zip(questions)
            .map(|(question_id, q)| GeneratedQuestion {
                question_id,
                question_type: q.question_type,
                prompt: q.prompt,
                options: q.options,
                item_type: q.item_type,
                item_id: q.item_id,
                difficulty: q.difficulty,
                acceptable_answers: if options.reveal_answers {
                    q.acceptable_answers
                } else {
                    None
                },
            })
            .collect();

        Ok(GeneratedQuiz {
            session_id: session.id,
            questions,
        })
    }

    /// Ask the generator for questions, falling back to simple ones for the pool
    async fn draft_questions(
        &self,
        patient: &Patient,
        request: &GenerationRequest,
        pool: &[QuizItem],
    ) -> Vec<QuestionDraft> {
        let Some(generator) = &self.generator else {
            return fallback_questions(pool);
        };

        let known: HashSet<(ItemType, Uuid)> =
            pool.iter().map(|item| (item.item_type(), item.id())).collect();

        match generator.generate(request).await {
            Ok(drafts) => {
                let generated = drafts.len();
                let mut questions: Vec<QuestionDraft> = drafts
                    .into_iter()
                    .filter(|q| known.contains(&(q.item_type, q.item_id)))
                    .collect();
                if questions.len() < generated {
                    tracing::warn!(
                        "Dropped {} generated questions outside the selected items",
                        generated - questions.len()
                    );
                }
                questions.truncate(request.n);

                if questions.is_empty() {
                    tracing::warn!(
                        "Generator returned no usable questions for patient {}, using fallback",
                        patient.id
                    );
                    fallback_questions(pool)
                } else {
                    questions
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Question generation failed for patient {}: {}, using fallback",
                    patient.id,
                    e
                );
                fallback_questions(pool)
            }
        }
    }

    /// Grade a session's answers, update mastery and complete the session
    pub fn submit(
        &self,
        store: &CareStore,
        session_id: Uuid,
        submissions: &[SubmissionItem],
    ) -> Result<SubmissionResult> {
        let session = store
            .sqlite()
            .get_session(session_id)?
            .ok_or_else(|| Error::not_found("Session not found"))?;
        if session.status == SessionStatus::Completed {
            return Err(Error::conflict("Session already completed"));
        }

        let questions: HashMap<Uuid, QuestionDraft> = store
            .sqlite()
            .list_questions(session_id)?
            .into_iter()
            .map(|q| (q.id, q.payload))
            .collect();

        if submissions
            .iter()
            .any(|s| !questions.contains_key(&s.question_id))
        {
            return Err(Error::bad_request("Invalid question id"));
        }

        let graded: Vec<GradedResponse> = submissions
            .iter()
            .map(|item| {
                let question = &questions[&item.question_id];
                GradedResponse {
                    question_id: item.question_id,
                    item_type: question.item_type,
                    item_id: question.item_id,
                    user_answer: item.user_answer.clone(),
                    correct: evaluate_answer(
                        question.question_type,
                        &question.correct_answer,
                        &item.user_answer,
                        question.acceptable_answers.as_deref().unwrap_or_default(),
                    ),
                    response_time_ms: item.response_time_ms,
                }
            })
            .collect();

        let correct = graded.iter().filter(|g| g.correct).count();
        let total = submissions.len();
        let score = correct as f64 / total.max(1) as f64;
        let avg_response_time_ms = if total == 0 {
            None
        } else {
            let sum: f64 = submissions.iter().map(|s| s.response_time_ms as f64).sum();
            Some(sum / total as f64)
        };

        // Mastery is read and written under one transaction; later answers
        // to the same item build on earlier ones
        let now = Utc::now();
        store.sqlite().record_submission(
            session_id,
            session.patient_id,
            &graded,
            score,
            avg_response_time_ms,
            |current, response| {
                next_mastery(
                    current,
                    session.patient_id,
                    response.item_type,
                    response.item_id,
                    response.correct,
                    response.response_time_ms,
                    now,
                )
            },
        )?;

        tracing::info!(
            "Completed quiz session {}: {}/{} correct",
            session_id,
            correct,
            total
        );

        Ok(SubmissionResult {
            session_id,
            score,
            total_questions: total,
            correct,
            avg_response_time_ms,
            weak_items: graded
                .iter()
                .filter(|g| !g.correct)
                .map(|g| g.question_id)
                .collect(),
        })
    }

    /// Fetch a session
    pub fn session(&self, store: &CareStore, session_id: Uuid) -> Result<QuizSession> {
        store
            .sqlite()
            .get_session(session_id)?
            .ok_or_else(|| Error::not_found("Session not found"))
    }

    /// A patient's sessions, newest first
    pub fn sessions(&self, store: &CareStore, patient_id: Uuid) -> Result<Vec<QuizSession>> {
        store.require_patient(patient_id)?;
        store.sqlite().list_sessions(patient_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::records::{FamilyMember, KnowledgeItem};
    use crate::storage::{JsonlIngestionLog, LocalBlobStore, SqliteStorage};
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> CareStore {
        let config = Config::with_data_dir(dir.path());
        let blobs = Arc::new(LocalBlobStore::new(config.blob_dir()));
        let log = Arc::new(JsonlIngestionLog::new(&config).unwrap());
        CareStore::with_backends(config, SqliteStorage::open_in_memory().unwrap(), blobs, log)
    }

    /// Returns canned drafts
    struct CannedGenerator(Vec<QuestionDraft>);

    #[async_trait]
    impl QuestionGenerator for CannedGenerator {
        async fn generate(&self, _request: &GenerationRequest) -> Result<Vec<QuestionDraft>> {
            Ok(self.0.clone())
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl QuestionGenerator for FailingGenerator {
        async fn generate(&self, _request: &GenerationRequest) -> Result<Vec<QuestionDraft>> {
            Err(Error::llm("service unavailable"))
        }
    }

    fn recall(item_id: Uuid, answer: &str) -> QuestionDraft {
        QuestionDraft {
            question_type: QuestionType::Recall,
            prompt: "What is your favorite color?".to_string(),
            options: None,
            correct_answer: json!(answer),
            item_type: ItemType::Knowledge,
            item_id,
            difficulty: 1,
            acceptable_answers: Some(vec!["navy".to_string()]),
        }
    }

    fn seed(store: &CareStore) -> (Patient, KnowledgeItem, FamilyMember) {
        let patient = store
            .create_patient(Patient::new("Ada Lovelace", "1815-12-10"))
            .unwrap();
        let color = store
            .add_knowledge_item(KnowledgeItem::new(
                patient.id,
                "personal",
                "favorite color",
                "blue",
            ))
            .unwrap();
        let daughter = store
            .add_family_member(FamilyMember::new(patient.id, "Annabella", "daughter"))
            .unwrap();
        (patient, color, daughter)
    }

    #[tokio::test]
    async fn fallback_quiz_without_generator() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let (patient, color, daughter) = seed(&store);

        let engine = QuizEngine::new(None);
        let quiz = engine
            .generate(&store, patient.id, GenerateOptions::default())
            .await
            .unwrap();

        assert_eq!(quiz.questions.len(), 2);
        let items: Vec<Uuid> = quiz.questions.iter().map(|q| q.item_id).collect();
        assert!(items.contains(&color.id));
        assert!(items.contains(&daughter.id));
        assert!(quiz.questions.iter().all(|q| q.question_type == QuestionType::Mcq));
        assert!(quiz.questions.iter().all(|q| q.acceptable_answers.is_none()));

        let session = engine.session(&store, quiz.session_id).unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.total_questions, 2);
    }

    #[tokio::test]
    async fn question_count_is_bounded() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let (patient, _, _) = seed(&store);
        let engine = QuizEngine::new(None);

        for n in [0, MAX_QUESTIONS + 1] {
            let options = GenerateOptions {
                n,
                ..Default::default()
            };
            let err = engine.generate(&store, patient.id, options).await.unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)));
        }
    }

    #[tokio::test]
    async fn unknown_patient_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let err = QuizEngine::new(None)
            .generate(&store, Uuid::new_v4(), GenerateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn generated_questions_outside_the_pool_are_dropped() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let (patient, color, _) = seed(&store);

        let generator =
            CannedGenerator(vec![recall(Uuid::new_v4(), "red"), recall(color.id, "blue")]);
        let engine = QuizEngine::new(Some(Arc::new(generator)));
        let quiz = engine
            .generate(
                &store,
                patient.id,
                GenerateOptions {
                    reveal_answers: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(quiz.questions.len(), 1);
        assert_eq!(quiz.questions[0].item_id, color.id);
        assert_eq!(quiz.questions[0].acceptable_answers, Some(vec!["navy".to_string()]));
    }

    #[tokio::test]
    async fn generator_failure_falls_back() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let (patient, _, _) = seed(&store);

        let engine = QuizEngine::new(Some(Arc::new(FailingGenerator)));
        let quiz = engine
            .generate(&store, patient.id, GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(quiz.questions.len(), 2);
        assert!(quiz.questions.iter().all(|q| q.question_type == QuestionType::Mcq));
    }

    #[tokio::test]
    async fn submit_grades_and_updates_mastery() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let (patient, color, _) = seed(&store);

        let generator = CannedGenerator(vec![recall(color.id, "blue")]);
        let engine = QuizEngine::new(Some(Arc::new(generator)));
        let quiz = engine
            .generate(&store, patient.id, GenerateOptions::default())
            .await
            .unwrap();
        let question_id = quiz.questions[0].question_id;

        let result = engine
            .submit(
                &store,
                quiz.session_id,
                &[SubmissionItem {
                    question_id,
                    user_answer: json!("Blue"),
                    response_time_ms: 1200,
                }],
            )
            .unwrap();

        assert_eq!(result.score, 1.0);
        assert_eq!(result.correct, 1);
        assert_eq!(result.avg_response_time_ms, Some(1200.0));
        assert!(result.weak_items.is_empty());

        let mastery = store
            .sqlite()
            .get_mastery(patient.id, ItemType::Knowledge, color.id)
            .unwrap()
            .unwrap();
        assert_eq!(mastery.consecutive_correct, 1);
        assert!(mastery.mastery_score > 0.0);

        let session = engine.session(&store, quiz.session_id).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.score, Some(1.0));
    }

    #[tokio::test]
    async fn repeated_answers_chain_mastery() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let (patient, color, _) = seed(&store);

        let drafts = vec![recall(color.id, "blue"), recall(color.id, "blue")];
        let engine = QuizEngine::new(Some(Arc::new(CannedGenerator(drafts))));
        let quiz = engine
            .generate(&store, patient.id, GenerateOptions::default())
            .await
            .unwrap();

        let answers: Vec<SubmissionItem> = quiz
            .questions
            .iter()
            .map(|q| SubmissionItem {
                question_id: q.question_id,
                user_answer: json!("blue"),
                response_time_ms: 5000,
            })
            .collect();
        engine.submit(&store, quiz.session_id, &answers).unwrap();

        let mastery = store
            .sqlite()
            .get_mastery(patient.id, ItemType::Knowledge, color.id)
            .unwrap()
            .unwrap();
        assert_eq!(mastery.consecutive_correct, 2);
    }

    #[tokio::test]
    async fn submit_rejects_foreign_question_and_second_submission() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let (patient, _, _) = seed(&store);
        let engine = QuizEngine::new(None);
        let quiz = engine
            .generate(&store, patient.id, GenerateOptions::default())
            .await
            .unwrap();

        let bogus = [SubmissionItem {
            question_id: Uuid::new_v4(),
            user_answer: json!("x"),
            response_time_ms: 10,
        }];
        let err = engine.submit(&store, quiz.session_id, &bogus).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        assert_eq!(
            engine.session(&store, quiz.session_id).unwrap().status,
            SessionStatus::Active
        );

        let empty = engine.submit(&store, quiz.session_id, &[]).unwrap();
        assert_eq!(empty.score, 0.0);
        assert_eq!(empty.avg_response_time_ms, None);

        let err = engine.submit(&store, quiz.session_id, &[]).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let err = engine.submit(&store, Uuid::new_v4(), &[]).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
