//! # Reinforce
//!
//! Backend for cognitive reinforcement of people living with dementia.
//!
//! ## Architecture
//!
//! - **Records** - patients, their family members and knowledge items in SQLite
//! - **Uploads** - documents and photos in blob storage, with an ingestion log
//! - **Quizzes** - questions generated from the records, graded on submission
//! - **Mastery** - per-item recall strength that schedules the next review
//!
//! ## Usage
//!
//! ```rust,ignore
//! use reinforce::{CareStore, Config, GenerateOptions, Patient, QuizEngine};
//!
//! let store = CareStore::new(Config::from_env()?)?;
//! let engine = QuizEngine::new(None);
//!
//! let patient = store.create_patient(Patient::new("Ada Lovelace", "1815-12-10"))?;
//! let quiz = engine.generate(&store, patient.id, GenerateOptions::default()).await?;
//! ```

pub mod analytics;
pub mod api;
pub mod config;
pub mod error;
pub mod llm;
pub mod quiz;
pub mod records;
pub mod storage;
pub mod store;

#[cfg(test)]
mod test_server;

pub use config::Config;
pub use error::{Error, Result};
pub use llm::{AzureOpenAiGenerator, QuestionGenerator};
pub use quiz::{GenerateOptions, QuizEngine};
pub use records::{FamilyMember, ItemType, KnowledgeItem, Patient};
pub use store::CareStore;
