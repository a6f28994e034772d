//! SQLite storage for patients, quiz sessions and mastery

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::config::{Config, DatabaseLocation};
use crate::error::{Error, Result};
use crate::quiz::{
    DueItem, GradedResponse, MasteryRecord, QuestionDraft, QuizSession, SessionStatus,
    StoredQuestion,
};
use crate::records::{FamilyMember, ItemType, KnowledgeItem, Patient};

/// SQLite storage backend
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open the database named by the config and initialise the schema
    pub fn new(config: &Config) -> Result<Self> {
        let conn = match config.database_location()? {
            DatabaseLocation::InMemory => Connection::open_in_memory()?,
            DatabaseLocation::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
        };
        Self::from_connection(conn)
    }

    /// Fresh in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| Error::storage(e.to_string()))
    }

    // --- Patients ---

    pub fn insert_patient(&self, patient: &Patient) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO patients (id, full_name, dob, phone, address, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                patient.id.to_string(),
                patient.full_name,
                patient.dob,
                patient.phone,
                patient.address,
                ts(&patient.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_patient(&self, id: Uuid) -> Result<Option<Patient>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, full_name, dob, phone, address, created_at FROM patients WHERE id = ?1",
                params![id.to_string()],
                PatientRow::read,
            )
            .optional()?;
        row.map(PatientRow::into_patient).transpose()
    }

    pub fn list_patients(&self) -> Result<Vec<Patient>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, full_name, dob, phone, address, created_at \
             FROM patients ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], PatientRow::read)?;

        let mut patients = Vec::new();
        for row in rows {
            patients.push(row?.into_patient()?);
        }
        Ok(patients)
    }

    // --- Family members ---

    pub fn insert_family_member(&self, member: &FamilyMember) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO family_members
                (id, patient_id, full_name, relationship, photo_blob_path, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                member.id.to_string(),
                member.patient_id.to_string(),
                member.full_name,
                member.relationship,
                member.photo_blob_path,
                ts(&member.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_family_member(&self, id: Uuid) -> Result<Option<FamilyMember>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                r#"
                SELECT id, patient_id, full_name, relationship, photo_blob_path, created_at
                FROM family_members WHERE id = ?1
                "#,
                params![id.to_string()],
                FamilyRow::read,
            )
            .optional()?;
        row.map(FamilyRow::into_member).transpose()
    }

    pub fn list_family_members(&self, patient_id: Uuid) -> Result<Vec<FamilyMember>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, patient_id, full_name, relationship, photo_blob_path, created_at
            FROM family_members WHERE patient_id = ?1 ORDER BY created_at
            "#,
        )?;
        let rows = stmt.query_map(params![patient_id.to_string()], FamilyRow::read)?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?.into_member()?);
        }
        Ok(members)
    }

    /// Point a family member at a newly uploaded photo
    pub fn update_family_photo(&self, id: Uuid, blob_path: &str) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE family_members SET photo_blob_path = ?1 WHERE id = ?2",
            params![blob_path, id.to_string()],
        )?;
        if updated == 0 {
            return Err(Error::not_found("Family member not found"));
        }
        Ok(())
    }

    // --- Knowledge items ---

    pub fn insert_knowledge_item(&self, item: &KnowledgeItem) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO knowledge_items (
                id, patient_id, category, label, value, sensitivity_level, is_active, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                item.id.to_string(),
                item.patient_id.to_string(),
                item.category,
                item.label,
                item.value,
                item.sensitivity_level,
                item.is_active,
                ts(&item.created_at),
            ],
        )?;
        Ok(())
    }

    /// List a patient's knowledge items, optionally restricted to one category
    pub fn list_knowledge_items(
        &self,
        patient_id: Uuid,
        category: Option<&str>,
    ) -> Result<Vec<KnowledgeItem>> {
        let conn = self.lock()?;

        let mut sql = String::from(
            r#"
            SELECT id, patient_id, category, label, value, sensitivity_level, is_active, created_at
            FROM knowledge_items WHERE patient_id = ?
            "#,
        );
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(patient_id.to_string())];

        if let Some(c) = category {
            sql.push_str(" AND category = ?");
            params_vec.push(Box::new(c.to_string()));
        }

        sql.push_str(" ORDER BY created_at");

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), KnowledgeRow::read)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?.into_item()?);
        }
        Ok(items)
    }

    // --- Quiz sessions and questions ---

    /// Store a session together with its questions. Returns the question ids in order.
    pub fn create_session_with_questions(
        &self,
        session: &QuizSession,
        questions: &[QuestionDraft],
    ) -> Result<Vec<Uuid>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO quiz_sessions (
                id, patient_id, created_at, status, total_questions, score, avg_response_time_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL)
            "#,
            params![
                session.id.to_string(),
                session.patient_id.to_string(),
                ts(&session.created_at),
                session.status.to_string(),
                session.total_questions,
            ],
        )?;

        let created_at = ts(&Utc::now());
        let mut ids = Vec::with_capacity(questions.len());
        for question in questions {
            let id = Uuid::new_v4();
            tx.execute(
                r#"
                INSERT INTO quiz_questions (
                    id, session_id, question_type, payload_json, correct_answer_json, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    id.to_string(),
                    session.id.to_string(),
                    question.question_type.to_string(),
                    serde_json::to_string(question)?,
                    serde_json::to_string(&question.correct_answer)?,
                    created_at,
                ],
            )?;
            ids.push(id);
        }

        tx.commit()?;
        Ok(ids)
    }

    pub fn get_session(&self, id: Uuid) -> Result<Option<QuizSession>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                r#"
                SELECT id, patient_id, created_at, status, total_questions, score,
                       avg_response_time_ms
                FROM quiz_sessions WHERE id = ?1
                "#,
                params![id.to_string()],
                SessionRow::read,
            )
            .optional()?;
        row.map(SessionRow::into_session).transpose()
    }

    /// Sessions for a patient, newest first
    pub fn list_sessions(&self, patient_id: Uuid) -> Result<Vec<QuizSession>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, patient_id, created_at, status, total_questions, score, avg_response_time_ms
            FROM quiz_sessions WHERE patient_id = ?1 ORDER BY created_at DESC
            "#,
        )?;
        let rows = stmt.query_map(params![patient_id.to_string()], SessionRow::read)?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?.into_session()?);
        }
        Ok(sessions)
    }

    pub fn list_questions(&self, session_id: Uuid) -> Result<Vec<StoredQuestion>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, session_id, payload_json, created_at
            FROM quiz_questions WHERE session_id = ?1 ORDER BY created_at, rowid
            "#,
        )?;
        let rows = stmt.query_map(params![session_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut questions = Vec::new();
        for row in rows {
            let (id, session_id, payload, created_at) = row?;
            questions.push(StoredQuestion {
                id: parse_uuid(&id)?,
                session_id: parse_uuid(&session_id)?,
                payload: serde_json::from_str(&payload)?,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(questions)
    }

    /// Persist graded answers, mastery updates and session completion atomically.
    ///
    /// `review` computes each response's new mastery from the item's current
    /// record, which is read inside the transaction (or taken from an earlier
    /// response in the same submission). Fails with `Conflict` if the session
    /// is no longer active.
    pub fn record_submission<F>(
        &self,
        session_id: Uuid,
        patient_id: Uuid,
        responses: &[GradedResponse],
        score: f64,
        avg_response_time_ms: Option<f64>,
        mut review: F,
    ) -> Result<()>
    where
        F: FnMut(Option<&MasteryRecord>, &GradedResponse) -> MasteryRecord,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let completed = tx.execute(
            r#"
            UPDATE quiz_sessions
            SET status = ?1, score = ?2, avg_response_time_ms = ?3
            WHERE id = ?4 AND status = ?5
            "#,
            params![
                SessionStatus::Completed.to_string(),
                score,
                avg_response_time_ms,
                session_id.to_string(),
                SessionStatus::Active.to_string(),
            ],
        )?;
        if completed == 0 {
            return Err(Error::conflict("Session already completed"));
        }

        let created_at = ts(&Utc::now());
        let mut updated: Vec<MasteryRecord> = Vec::new();
        for response in responses {
            tx.execute(
                r#"
                INSERT INTO quiz_responses (
                    id, session_id, question_id, user_answer_json, correct,
                    response_time_ms, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    Uuid::new_v4().to_string(),
                    session_id.to_string(),
                    response.question_id.to_string(),
                    serde_json::to_string(&response.user_answer)?,
                    response.correct,
                    i64::try_from(response.response_time_ms).unwrap_or(i64::MAX),
                    created_at,
                ],
            )?;

            let earlier = updated
                .iter()
                .position(|m| m.item_type == response.item_type && m.item_id == response.item_id);
            match earlier {
                Some(i) => {
                    let next = review(Some(&updated[i]), response);
                    updated[i] = next;
                }
                None => {
                    let current =
                        read_mastery(&tx, patient_id, response.item_type, response.item_id)?;
                    updated.push(review(current.as_ref(), response));
                }
            }
        }

        for record in &updated {
            upsert_mastery(&tx, record)?;
        }

        tx.commit()?;
        Ok(())
    }

    // --- Mastery ---

    pub fn get_mastery(
        &self,
        patient_id: Uuid,
        item_type: ItemType,
        item_id: Uuid,
    ) -> Result<Option<MasteryRecord>> {
        let conn = self.lock()?;
        read_mastery(&conn, patient_id, item_type, item_id)
    }

    pub fn save_mastery(&self, record: &MasteryRecord) -> Result<()> {
        let conn = self.lock()?;
        upsert_mastery(&conn, record)
    }

    pub fn list_mastery(&self, patient_id: Uuid) -> Result<Vec<MasteryRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT patient_id, item_type, item_id, mastery_score, consecutive_correct,
                   consecutive_incorrect, last_seen_at, next_due_at
            FROM mastery WHERE patient_id = ?1 ORDER BY item_type, item_id
            "#,
        )?;
        let rows = stmt.query_map(params![patient_id.to_string()], MasteryRow::read)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    /// Items due for review at `now`.
    ///
    /// Mastery rows that are due come first, most overdue first (never scheduled
    /// before dated). Family members and then knowledge items that have no
    /// mastery row at all follow in creation order.
    pub fn due_items(&self, patient_id: Uuid, now: DateTime<Utc>) -> Result<Vec<DueItem>> {
        let conn = self.lock()?;
        let pid = patient_id.to_string();
        let mut due = Vec::new();

        let mut stmt = conn.prepare(
            r#"
            SELECT item_type, item_id, next_due_at, last_seen_at
            FROM mastery
            WHERE patient_id = ?1 AND (next_due_at IS NULL OR next_due_at <= ?2)
            ORDER BY next_due_at IS NOT NULL, next_due_at
            "#,
        )?;
        let rows = stmt.query_map(params![pid, ts(&now)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;
        for row in rows {
            let (item_type, item_id, next_due_at, last_seen_at) = row?;
            due.push(DueItem {
                item_type: item_type.parse()?,
                item_id: parse_uuid(&item_id)?,
                next_due_at: next_due_at.as_deref().map(parse_ts).transpose()?,
                last_seen_at: last_seen_at.as_deref().map(parse_ts).transpose()?,
            });
        }

        for (item_type, table) in [
            (ItemType::Family, "family_members"),
            (ItemType::Knowledge, "knowledge_items"),
        ] {
            let sql = format!(
                r#"
                SELECT t.id FROM {table} t
                WHERE t.patient_id = ?1 AND NOT EXISTS (
                    SELECT 1 FROM mastery m
                    WHERE m.patient_id = t.patient_id AND m.item_type = ?2 AND m.item_id = t.id
                )
                ORDER BY t.created_at
                "#
            );
            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt.query_map(params![pid, item_type.to_string()], |row| {
                row.get::<_, String>(0)
            })?;
            for id in ids {
                due.push(DueItem {
                    item_type,
                    item_id: parse_uuid(&id?)?,
                    next_due_at: None,
                    last_seen_at: None,
                });
            }
        }

        Ok(due)
    }

    // --- Analytics ---

    /// Item type and correctness of every answer the patient gave since `cutoff`
    pub fn response_outcomes_since(
        &self,
        patient_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(String, bool)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT q.payload_json, r.correct
            FROM quiz_responses r
            JOIN quiz_questions q ON q.id = r.question_id
            JOIN quiz_sessions s ON s.id = r.session_id
            WHERE s.patient_id = ?1 AND r.created_at >= ?2
            "#,
        )?;
        let rows = stmt.query_map(params![patient_id.to_string(), ts(&cutoff)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?))
        })?;

        let mut outcomes = Vec::new();
        for row in rows {
            let (payload, correct) = row?;
            let payload: serde_json::Value = serde_json::from_str(&payload)?;
            let category = payload
                .get("item_type")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            outcomes.push((category, correct));
        }
        Ok(outcomes)
    }
}

fn read_mastery(
    conn: &Connection,
    patient_id: Uuid,
    item_type: ItemType,
    item_id: Uuid,
) -> Result<Option<MasteryRecord>> {
    let row = conn
        .query_row(
            r#"
            SELECT patient_id, item_type, item_id, mastery_score, consecutive_correct,
                   consecutive_incorrect, last_seen_at, next_due_at
            FROM mastery WHERE patient_id = ?1 AND item_type = ?2 AND item_id = ?3
            "#,
            params![patient_id.to_string(), item_type.to_string(), item_id.to_string()],
            MasteryRow::read,
        )
        .optional()?;
    row.map(MasteryRow::into_record).transpose()
}

fn upsert_mastery(conn: &Connection, record: &MasteryRecord) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO mastery (
            id, patient_id, item_type, item_id, mastery_score, consecutive_correct,
            consecutive_incorrect, last_seen_at, next_due_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(patient_id, item_type, item_id) DO UPDATE SET
            mastery_score = excluded.mastery_score,
            consecutive_correct = excluded.consecutive_correct,
            consecutive_incorrect = excluded.consecutive_incorrect,
            last_seen_at = excluded.last_seen_at,
            next_due_at = excluded.next_due_at
        "#,
        params![
            Uuid::new_v4().to_string(),
            record.patient_id.to_string(),
            record.item_type.to_string(),
            record.item_id.to_string(),
            record.mastery_score,
            record.consecutive_correct,
            record.consecutive_incorrect,
            record.last_seen_at.as_ref().map(ts),
            record.next_due_at.as_ref().map(ts),
        ],
    )?;
    Ok(())
}

/// Fixed-width UTC timestamp so that text order equals time order
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::storage(format!("Bad timestamp {:?}: {}", s, e)))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::storage(e.to_string()))
}

/// Intermediate structs for reading from SQLite
struct PatientRow {
    id: String,
    full_name: String,
    dob: String,
    phone: Option<String>,
    address: Option<String>,
    created_at: String,
}

impl PatientRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            full_name: row.get(1)?,
            dob: row.get(2)?,
            phone: row.get(3)?,
            address: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_patient(self) -> Result<Patient> {
        Ok(Patient {
            id: parse_uuid(&self.id)?,
            full_name: self.full_name,
            dob: self.dob,
            phone: self.phone,
            address: self.address,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct FamilyRow {
    id: String,
    patient_id: String,
    full_name: String,
    relationship: String,
    photo_blob_path: Option<String>,
    created_at: String,
}

impl FamilyRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            patient_id: row.get(1)?,
            full_name: row.get(2)?,
            relationship: row.get(3)?,
            photo_blob_path: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_member(self) -> Result<FamilyMember> {
        Ok(FamilyMember {
            id: parse_uuid(&self.id)?,
            patient_id: parse_uuid(&self.patient_id)?,
            full_name: self.full_name,
            relationship: self.relationship,
            photo_blob_path: self.photo_blob_path,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct KnowledgeRow {
    id: String,
    patient_id: String,
    category: String,
    label: String,
    value: String,
    sensitivity_level: u8,
    is_active: bool,
    created_at: String,
}

impl KnowledgeRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            patient_id: row.get(1)?,
            category: row.get(2)?,
            label: row.get(3)?,
            value: row.get(4)?,
            sensitivity_level: row.get(5)?,
            is_active: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_item(self) -> Result<KnowledgeItem> {
        Ok(KnowledgeItem {
            id: parse_uuid(&self.id)?,
            patient_id: parse_uuid(&self.patient_id)?,
            category: self.category,
            label: self.label,
            value: self.value,
            sensitivity_level: self.sensitivity_level,
            is_active: self.is_active,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct SessionRow {
    id: String,
    patient_id: String,
    created_at: String,
    status: String,
    total_questions: u32,
    score: Option<f64>,
    avg_response_time_ms: Option<f64>,
}

impl SessionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            patient_id: row.get(1)?,
            created_at: row.get(2)?,
            status: row.get(3)?,
            total_questions: row.get(4)?,
            score: row.get(5)?,
            avg_response_time_ms: row.get(6)?,
        })
    }

    fn into_session(self) -> Result<QuizSession> {
        Ok(QuizSession {
            id: parse_uuid(&self.id)?,
            patient_id: parse_uuid(&self.patient_id)?,
            created_at: parse_ts(&self.created_at)?,
            status: self.status.parse()?,
            total_questions: self.total_questions,
            score: self.score,
            avg_response_time_ms: self.avg_response_time_ms,
        })
    }
}

struct MasteryRow {
    patient_id: String,
    item_type: String,
    item_id: String,
    mastery_score: f64,
    consecutive_correct: u32,
    consecutive_incorrect: u32,
    last_seen_at: Option<String>,
    next_due_at: Option<String>,
}

impl MasteryRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            patient_id: row.get(0)?,
            item_type: row.get(1)?,
            item_id: row.get(2)?,
            mastery_score: row.get(3)?,
            consecutive_correct: row.get(4)?,
            consecutive_incorrect: row.get(5)?,
            last_seen_at: row.get(6)?,
            next_due_at: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<MasteryRecord> {
        Ok(MasteryRecord {
            patient_id: parse_uuid(&self.patient_id)?,
            item_type: self.item_type.parse()?,
            item_id: parse_uuid(&self.item_id)?,
            mastery_score: self.mastery_score,
            consecutive_correct: self.consecutive_correct,
            consecutive_incorrect: self.consecutive_incorrect,
            last_seen_at: self.last_seen_at.as_deref().map(parse_ts).transpose()?,
            next_due_at: self.next_due_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}
