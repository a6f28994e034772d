//! Storage backends for reinforce

pub mod blob;
mod cosmos;
pub mod ingestion;
mod jsonl;
mod signing;
mod sqlite;

pub use blob::{AzureBlobStore, BlobStore, LocalBlobStore};
pub use cosmos::CosmosIngestionLog;
pub use ingestion::{IngestionEntry, IngestionLog};
pub use jsonl::JsonlIngestionLog;
pub use sqlite::SqliteStorage;
