//! JSONL storage for the ingestion log

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use std::sync::Mutex;
use uuid::Uuid;

use super::ingestion::{IngestionEntry, IngestionLog};
use crate::config::Config;
use crate::error::{Error, Result};

/// JSONL ingestion log, one file per patient
pub struct JsonlIngestionLog {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlIngestionLog {
    /// Create a new JSONL log under the config's ingestion directory
    pub fn new(config: &Config) -> Result<Self> {
        Self::at(config.ingestion_log_dir())
    }

    /// Create a new JSONL log in `base_path`
    pub fn at(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;

        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    fn log_path(&self, patient_id: Uuid) -> PathBuf {
        self.base_path.join(format!("{}.jsonl", patient_id))
    }

    /// Append an entry to the patient's log
    pub fn append(&self, entry: &IngestionEntry) -> Result<()> {
        let json = serde_json::to_string(entry)?;

        let _guard = self.write_lock.lock().map_err(|e| Error::storage(e.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(entry.patient_id))?;
        writeln!(file, "{}", json)?;

        Ok(())
    }

    /// Read all entries for a patient
    pub fn read_all(&self, patient_id: Uuid) -> Result<Vec<IngestionEntry>> {
        let path = self.log_path(patient_id);

        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&path)?);

        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }

        Ok(entries)
    }
}

#[async_trait]
impl IngestionLog for JsonlIngestionLog {
    async fn record(&self, entry: &IngestionEntry) -> Result<()> {
        self.append(entry)
    }
}
