//! Ingestion log: one document per uploaded patient file

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// A record of one uploaded document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionEntry {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub blob_path: String,

    /// Sanitised original filename
    pub filename: String,

    pub uploaded_at: DateTime<Utc>,
}

impl IngestionEntry {
    pub fn new(
        patient_id: Uuid,
        blob_path: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            patient_id,
            blob_path: blob_path.into(),
            filename: filename.into(),
            uploaded_at: Utc::now(),
        }
    }
}

/// Append-only store of ingestion entries
#[async_trait]
pub trait IngestionLog: Send + Sync {
    async fn record(&self, entry: &IngestionEntry) -> Result<()>;
}
