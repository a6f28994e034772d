//! Patient, family member and knowledge item records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Highest accepted knowledge sensitivity level
pub const MAX_SENSITIVITY_LEVEL: u8 = 5;

/// Kind of item a quiz question is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    /// A knowledge item (fact about the patient's life)
    Knowledge,

    /// A family member
    Family,
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemType::Knowledge => write!(f, "knowledge"),
            ItemType::Family => write!(f, "family"),
        }
    }
}

impl std::str::FromStr for ItemType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "knowledge" => Ok(ItemType::Knowledge),
            "family" => Ok(ItemType::Family),
            _ => Err(Error::storage(format!("Unknown item type: {}", s))),
        }
    }
}

/// A patient enrolled in reinforcement sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: Uuid,
    pub full_name: String,

    /// Date of birth as entered by the caregiver
    pub dob: String,

    pub phone: Option<String>,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Patient {
    /// Create a new patient
    pub fn new(full_name: impl Into<String>, dob: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            full_name: full_name.into(),
            dob: dob.into(),
            phone: None,
            address: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Check required fields
    pub fn validate(&self) -> Result<()> {
        require("full_name", &self.full_name)?;
        require("dob", &self.dob)
    }
}

/// A family member the patient should recognise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyMember {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub full_name: String,

    /// Relationship to the patient ("daughter", "brother", ...)
    pub relationship: String,

    /// Blob path of the uploaded photo, if any
    pub photo_blob_path: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl FamilyMember {
    /// Create a new family member for a patient
    pub fn new(
        patient_id: Uuid,
        full_name: impl Into<String>,
        relationship: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            patient_id,
            full_name: full_name.into(),
            relationship: relationship.into(),
            photo_blob_path: None,
            created_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        require("full_name", &self.full_name)?;
        require("relationship", &self.relationship)
    }
}

/// A fact about the patient's life used to build questions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub id: Uuid,
    pub patient_id: Uuid,

    /// Free-form grouping ("personal", "places", ...)
    pub category: String,

    pub label: String,
    pub value: String,

    /// 0 (harmless) to 5 (distressing); items at 2 or above are skipped
    /// by quizzes unless sensitive content is requested
    pub sensitivity_level: u8,

    /// Inactive items are kept but never quizzed
    pub is_active: bool,

    pub created_at: DateTime<Utc>,
}

impl KnowledgeItem {
    /// Create a new active, non-sensitive knowledge item
    pub fn new(
        patient_id: Uuid,
        category: impl Into<String>,
        label: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            patient_id,
            category: category.into(),
            label: label.into(),
            value: value.into(),
            sensitivity_level: 0,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_sensitivity(mut self, level: u8) -> Self {
        self.sensitivity_level = level;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.is_active = active;
        self
    }

    pub fn validate(&self) -> Result<()> {
        require("category", &self.category)?;
        require("label", &self.label)?;
        require("value", &self.value)?;
        if self.sensitivity_level > MAX_SENSITIVITY_LEVEL {
            return Err(Error::invalid_input(format!(
                "sensitivity_level must be between 0 and {}",
                MAX_SENSITIVITY_LEVEL
            )));
        }
        Ok(())
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::invalid_input(format!("{} must not be empty", field)));
    }
    Ok(())
}
