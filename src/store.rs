//! The care store coordinates the relational store, blob storage and the ingestion log

use std::sync::Arc;

use bytes::Bytes;
use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::analytics::{self, AnalyticsSummary};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::records::{FamilyMember, KnowledgeItem, Patient};
use crate::storage::blob::safe_filename;
use crate::storage::{
    AzureBlobStore, BlobStore, CosmosIngestionLog, IngestionEntry, IngestionLog,
    JsonlIngestionLog, LocalBlobStore, SqliteStorage,
};

/// Container for patient documents
pub const DOCS_CONTAINER: &str = "patient-docs";

/// Container for family member photos
pub const PHOTOS_CONTAINER: &str = "patient-photos";

/// Longest analytics window
pub const MAX_ANALYTICS_DAYS: u32 = 36_500;

/// The main store that coordinates all storage backends
pub struct CareStore {
    config: Config,
    sqlite: SqliteStorage,
    blobs: Arc<dyn BlobStore>,
    ingestion: Arc<dyn IngestionLog>,
}

impl CareStore {
    /// Create a store with backends chosen by the config
    pub fn new(config: Config) -> Result<Self> {
        config.ensure_dirs()?;

        let sqlite = SqliteStorage::new(&config)?;

        let blobs: Arc<dyn BlobStore> = match &config.blob_connection_string {
            Some(conn) => {
                let store = AzureBlobStore::from_connection_string(conn)?;
                tracing::info!("Blob storage: Azure ({})", store.endpoint());
                Arc::new(store)
            }
            None => {
                tracing::info!("Blob storage: local ({:?})", config.blob_dir());
                Arc::new(LocalBlobStore::new(config.blob_dir()))
            }
        };

        let ingestion: Arc<dyn IngestionLog> = match &config.cosmos {
            Some(cosmos) => {
                tracing::info!("Ingestion log: Cosmos DB ({})", cosmos.endpoint);
                Arc::new(CosmosIngestionLog::new(cosmos)?)
            }
            None => Arc::new(JsonlIngestionLog::new(&config)?),
        };

        Ok(Self::with_backends(config, sqlite, blobs, ingestion))
    }

    /// Create a store from explicit backends
    pub fn with_backends(
        config: Config,
        sqlite: SqliteStorage,
        blobs: Arc<dyn BlobStore>,
        ingestion: Arc<dyn IngestionLog>,
    ) -> Self {
        Self {
            config,
            sqlite,
            blobs,
            ingestion,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the SQLite storage
    pub fn sqlite(&self) -> &SqliteStorage {
        &self.sqlite
    }

    // --- Patients ---

    pub fn create_patient(&self, patient: Patient) -> Result<Patient> {
        patient.validate()?;
        self.sqlite.insert_patient(&patient)?;
        tracing::info!("Created patient {}", patient.id);
        Ok(patient)
    }

    pub fn get_patient(&self, id: Uuid) -> Result<Option<Patient>> {
        self.sqlite.get_patient(id)
    }

    /// Get a patient or fail with `NotFound`
    pub fn require_patient(&self, id: Uuid) -> Result<Patient> {
        self.sqlite
            .get_patient(id)?
            .ok_or_else(|| Error::not_found("Patient not found"))
    }

    pub fn list_patients(&self) -> Result<Vec<Patient>> {
        self.sqlite.list_patients()
    }

    // --- Family members ---

    pub fn add_family_member(&self, member: FamilyMember) -> Result<FamilyMember> {
        member.validate()?;
        self.require_patient(member.patient_id)?;
        self.sqlite.insert_family_member(&member)?;
        Ok(member)
    }

    pub fn list_family_members(&self, patient_id: Uuid) -> Result<Vec<FamilyMember>> {
        self.sqlite.list_family_members(patient_id)
    }

    // --- Knowledge items ---

    pub fn add_knowledge_item(&self, item: KnowledgeItem) -> Result<KnowledgeItem> {
        item.validate()?;
        self.require_patient(item.patient_id)?;
        self.sqlite.insert_knowledge_item(&item)?;
        Ok(item)
    }

    pub fn list_knowledge_items(
        &self,
        patient_id: Uuid,
        category: Option<&str>,
    ) -> Result<Vec<KnowledgeItem>> {
        self.sqlite.list_knowledge_items(patient_id, category)
    }

    // --- Uploads ---

    /// Store a patient document and log its ingestion. Returns the blob path.
    pub async fn upload_patient_document(
        &self,
        patient_id: Uuid,
        filename: Option<&str>,
        content_type: Option<&str>,
        data: Bytes,
    ) -> Result<String> {
        self.require_patient(patient_id)?;

        let filename = safe_filename(filename.unwrap_or_default());
        let blob_path = format!(
            "{}/{}/{}_{}",
            DOCS_CONTAINER,
            patient_id,
            Uuid::new_v4(),
            filename
        );

        self.blobs
            .put(
                DOCS_CONTAINER,
                &blob_path,
                data,
                content_type.unwrap_or("application/octet-stream"),
            )
            .await?;

        let entry = IngestionEntry::new(patient_id, blob_path.clone(), filename);
        if let Err(e) = self.ingestion.record(&entry).await {
            tracing::warn!("Failed to log ingestion of {}: {}", blob_path, e);
        }

        Ok(blob_path)
    }

    /// Store a family member's photo and attach it. Returns the blob path.
    pub async fn upload_family_photo(
        &self,
        patient_id: Uuid,
        family_id: Uuid,
        data: Bytes,
    ) -> Result<String> {
        let member = self
            .sqlite
            .get_family_member(family_id)?
            .filter(|m| m.patient_id == patient_id)
            .ok_or_else(|| Error::not_found("Family member not found"))?;

        let blob_path = format!(
            "{}/{}/{}/{}.jpg",
            PHOTOS_CONTAINER,
            patient_id,
            member.id,
            Uuid::new_v4()
        );

        self.blobs
            .put(PHOTOS_CONTAINER, &blob_path, data, "image/jpeg")
            .await?;
        self.sqlite.update_family_photo(member.id, &blob_path)?;

        Ok(blob_path)
    }

    // --- Analytics ---

    /// Accuracy over the last `days` days plus review timestamps
    pub fn analytics_summary(&self, patient_id: Uuid, days: u32) -> Result<AnalyticsSummary> {
        if days > MAX_ANALYTICS_DAYS {
            return Err(Error::invalid_input(format!(
                "days must be at most {}",
                MAX_ANALYTICS_DAYS
            )));
        }
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let outcomes = self.sqlite.response_outcomes_since(patient_id, cutoff)?;
        let mastery = self.sqlite.list_mastery(patient_id)?;
        Ok(analytics::summarize(&outcomes, &mastery))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Ingestion log whose writes always fail
    #[derive(Default)]
    struct FailingLog {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl IngestionLog for FailingLog {
        async fn record(&self, _entry: &IngestionEntry) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::storage("ingestion log unavailable"))
        }
    }

    #[tokio::test]
    async fn upload_survives_ingestion_log_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_data_dir(dir.path());
        let blobs = Arc::new(LocalBlobStore::new(config.blob_dir()));
        let log = Arc::new(FailingLog::default());
        let store = CareStore::with_backends(
            config,
            SqliteStorage::open_in_memory().unwrap(),
            blobs.clone(),
            log.clone(),
        );

        let patient = store
            .create_patient(Patient::new("Ada Lovelace", "1815-12-10"))
            .unwrap();
        let blob_path = store
            .upload_patient_document(
                patient.id,
                Some("notes.txt"),
                Some("text/plain"),
                Bytes::from_static(b"hello"),
            )
            .await
            .unwrap();

        assert!(blob_path.starts_with(&format!("{}/{}/", DOCS_CONTAINER, patient.id)));
        assert!(blob_path.ends_with("_notes.txt"));
        assert_eq!(log.attempts.load(Ordering::SeqCst), 1);

        let written = std::fs::read(blobs.blob_path(DOCS_CONTAINER, &blob_path).unwrap()).unwrap();
        assert_eq!(written, b"hello");
    }

    #[tokio::test]
    async fn upload_for_unknown_patient_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_data_dir(dir.path());
        let log = Arc::new(FailingLog::default());
        let store = CareStore::with_backends(
            config.clone(),
            SqliteStorage::open_in_memory().unwrap(),
            Arc::new(LocalBlobStore::new(config.blob_dir())),
            log.clone(),
        );

        let err = store
            .upload_patient_document(Uuid::new_v4(), None, None, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(log.attempts.load(Ordering::SeqCst), 0);
    }
}
