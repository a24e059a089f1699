//! Eligibility source tables.
//!
//! Rows are converted into [`CallSubject`] values here and nowhere else.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::debug;

use super::{decode_enum, decode_optional_enum, DatabaseManager};
use crate::error::Result;
use crate::routing::types::{CallOutcome, CallSubject, Claim, ClaimStatus, Requirement, RequirementStatus};
use crate::routing::{EligibilitySource, SubjectLoad, SubjectLoadError};

const ELIGIBLE: &str = "active = 1 AND enabled = 1 AND contactable = 1";

struct SubjectRow {
    subject_id: String,
    phone_number: Option<String>,
    active: bool,
    enabled: bool,
    contactable: bool,
    signed: bool,
    last_outcome: Option<CallOutcome>,
    last_contact_at: Option<DateTime<Utc>>,
    total_attempts: i64,
    preferred_contact_hour: Option<i64>,
    utc_offset_minutes: i64,
}

impl SubjectRow {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            subject_id: row.try_get("subject_id")?,
            phone_number: row.try_get("phone_number")?,
            active: row.try_get("active")?,
            enabled: row.try_get("enabled")?,
            contactable: row.try_get("contactable")?,
            signed: row.try_get("signed")?,
            last_outcome: decode_optional_enum(row, "last_outcome")?,
            last_contact_at: row.try_get("last_contact_at")?,
            total_attempts: row.try_get("total_attempts")?,
            preferred_contact_hour: row.try_get("preferred_contact_hour")?,
            utc_offset_minutes: row.try_get("utc_offset_minutes")?,
        })
    }

    fn into_subject(self, claims: Vec<Claim>) -> CallSubject {
        CallSubject {
            subject_id: self.subject_id,
            phone_number: self.phone_number,
            active: self.active,
            enabled: self.enabled,
            contactable: self.contactable,
            signed: self.signed,
            claims,
            last_outcome: self.last_outcome,
            last_contact_at: self.last_contact_at,
            total_attempts: self.total_attempts.max(0) as u32,
            preferred_contact_hour: self
                .preferred_contact_hour
                .filter(|h| (0..24).contains(h))
                .map(|h| h as u8),
            utc_offset_minutes: self.utc_offset_minutes as i32,
        }
    }
}

const SUBJECT_COLUMNS: &str = "subject_id, phone_number, active, enabled, contactable, signed, last_outcome, \
     last_contact_at, total_attempts, preferred_contact_hour, utc_offset_minutes";

impl DatabaseManager {
    /// Insert or replace a subject together with its claims and requirements
    pub async fn upsert_subject(&self, subject: &CallSubject) -> Result<()> {
        let mut tx = self.begin_write().await?;

        sqlx::query(
            "INSERT INTO subjects (subject_id, phone_number, active, enabled, contactable, signed,
                                   last_outcome, last_contact_at, total_attempts,
                                   preferred_contact_hour, utc_offset_minutes)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(subject_id) DO UPDATE SET
                phone_number = excluded.phone_number,
                active = excluded.active,
                enabled = excluded.enabled,
                contactable = excluded.contactable,
                signed = excluded.signed,
                last_outcome = excluded.last_outcome,
                last_contact_at = excluded.last_contact_at,
                total_attempts = excluded.total_attempts,
                preferred_contact_hour = excluded.preferred_contact_hour,
                utc_offset_minutes = excluded.utc_offset_minutes",
        )
        .bind(&subject.subject_id)
        .bind(&subject.phone_number)
        .bind(subject.active)
        .bind(subject.enabled)
        .bind(subject.contactable)
        .bind(subject.signed)
        .bind(subject.last_outcome.map(|o| o.as_str()))
        .bind(subject.last_contact_at)
        .bind(subject.total_attempts as i64)
        .bind(subject.preferred_contact_hour.map(|h| h as i64))
        .bind(subject.utc_offset_minutes as i64)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM requirements WHERE claim_id IN (SELECT claim_id FROM claims WHERE subject_id = ?)",
        )
        .bind(&subject.subject_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM claims WHERE subject_id = ?")
            .bind(&subject.subject_id)
            .execute(&mut *tx)
            .await?;

        for claim in &subject.claims {
            sqlx::query("INSERT INTO claims (claim_id, subject_id, status, value_cents) VALUES (?, ?, ?, ?)")
                .bind(&claim.claim_id)
                .bind(&subject.subject_id)
                .bind(claim.status.as_str())
                .bind(claim.value_cents)
                .execute(&mut *tx)
                .await?;

            for (idx, requirement) in claim.requirements.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO requirements (requirement_id, claim_id, requirement_type, status)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(format!("{}:{}", claim.claim_id, idx))
                .bind(&claim.claim_id)
                .bind(&requirement.requirement_type)
                .bind(requirement.status.as_str())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        debug!("Upserted subject {} with {} claim(s)", subject.subject_id, subject.claims.len());
        Ok(())
    }

    /// Update the denormalized contact history after an outbound call
    pub async fn record_contact_attempt(
        &self,
        subject_id: &str,
        outcome: CallOutcome,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE subjects
             SET last_outcome = ?, last_contact_at = ?, total_attempts = total_attempts + 1
             WHERE subject_id = ?",
        )
        .bind(outcome.as_str())
        .bind(at)
        .bind(subject_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_eligible_subjects(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM subjects WHERE {}", ELIGIBLE))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// One page of eligible subjects ordered by subject id
    pub async fn fetch_eligible_subjects(&self, offset: u64, limit: u32) -> Result<Vec<SubjectLoad>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM subjects WHERE {} ORDER BY subject_id LIMIT ? OFFSET ?",
            SUBJECT_COLUMNS, ELIGIBLE
        ))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        self.assemble_subjects(rows).await
    }

    /// Load a single subject regardless of its flags
    pub async fn load_subject(&self, subject_id: &str) -> Result<Option<CallSubject>> {
        let rows = sqlx::query(&format!("SELECT {} FROM subjects WHERE subject_id = ?", SUBJECT_COLUMNS))
            .bind(subject_id)
            .fetch_all(&self.pool)
            .await?;

        match self.assemble_subjects(rows).await?.into_iter().next() {
            Some(Ok(subject)) => Ok(Some(subject)),
            Some(Err(e)) => Err(crate::error::CallCenterError::inconsistency(format!(
                "subject {}: {}",
                e.subject_id, e.message
            ))),
            None => Ok(None),
        }
    }

    pub async fn subject_id_for_phone(&self, phone_number: &str) -> Result<Option<String>> {
        let id = sqlx::query_scalar(
            "SELECT subject_id FROM subjects WHERE phone_number = ? ORDER BY active DESC, subject_id LIMIT 1",
        )
        .bind(phone_number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn assemble_subjects(&self, rows: Vec<SqliteRow>) -> Result<Vec<SubjectLoad>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = rows
            .iter()
            .map(|row| row.try_get::<String, _>("subject_id"))
            .collect::<std::result::Result<_, _>>()?;

        let mut claims_query = QueryBuilder::<Sqlite>::new(
            "SELECT claim_id, subject_id, status, value_cents FROM claims WHERE subject_id IN (",
        );
        let mut separated = claims_query.separated(", ");
        for id in &ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(") ORDER BY subject_id, claim_id");
        let claim_rows = claims_query.build().fetch_all(&self.pool).await?;

        let claim_ids: Vec<String> = claim_rows
            .iter()
            .map(|row| row.try_get::<String, _>("claim_id"))
            .collect::<std::result::Result<_, _>>()?;

        let mut requirements: HashMap<String, Vec<Result<Requirement>>> = HashMap::new();
        if !claim_ids.is_empty() {
            let mut req_query = QueryBuilder::<Sqlite>::new(
                "SELECT requirement_id, claim_id, requirement_type, status FROM requirements WHERE claim_id IN (",
            );
            let mut separated = req_query.separated(", ");
            for id in &claim_ids {
                separated.push_bind(id.clone());
            }
            separated.push_unseparated(") ORDER BY claim_id, requirement_id");

            for row in req_query.build().fetch_all(&self.pool).await? {
                let claim_id: String = row.try_get("claim_id")?;
                let requirement = (|| -> Result<Requirement> {
                    Ok(Requirement {
                        requirement_type: row.try_get("requirement_type")?,
                        status: decode_enum::<RequirementStatus>(&row, "status")?,
                    })
                })();
                requirements.entry(claim_id).or_default().push(requirement);
            }
        }

        let mut claims: HashMap<String, Vec<Result<Claim>>> = HashMap::new();
        for row in &claim_rows {
            let subject_id: String = row.try_get("subject_id")?;
            let claim_id: String = row.try_get("claim_id")?;
            let reqs = requirements.remove(&claim_id).unwrap_or_default();
            let claim = (|| -> Result<Claim> {
                Ok(Claim {
                    status: decode_enum::<ClaimStatus>(row, "status")?,
                    value_cents: row.try_get("value_cents")?,
                    requirements: reqs.into_iter().collect::<Result<Vec<_>>>()?,
                    claim_id: claim_id.clone(),
                })
            })();
            claims.entry(subject_id).or_default().push(claim);
        }

        let loads = rows
            .iter()
            .zip(ids)
            .map(|(row, subject_id)| {
                let subject_claims = claims.remove(&subject_id).unwrap_or_default();
                SubjectRow::from_row(row)
                    .and_then(|parsed| {
                        let typed = subject_claims.into_iter().collect::<Result<Vec<_>>>()?;
                        Ok(parsed.into_subject(typed))
                    })
                    .map_err(|e| SubjectLoadError { subject_id, message: e.to_string() })
            })
            .collect();

        Ok(loads)
    }
}

/// [`EligibilitySource`] backed by the engine's own database
#[derive(Clone)]
pub struct SqlEligibilitySource {
    db: DatabaseManager,
}

impl SqlEligibilitySource {
    pub fn new(db: DatabaseManager) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EligibilitySource for SqlEligibilitySource {
    async fn count_eligible(&self) -> Result<u64> {
        self.db.count_eligible_subjects().await
    }

    async fn fetch_subjects(&self, offset: u64, limit: u32) -> Result<Vec<SubjectLoad>> {
        self.db.fetch_eligible_subjects(offset, limit).await
    }

    async fn get_subject(&self, subject_id: &str) -> Result<Option<CallSubject>> {
        self.db.load_subject(subject_id).await
    }

    async fn subject_for_phone(&self, phone_number: &str) -> Result<Option<String>> {
        self.db.subject_id_for_phone(phone_number).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(id: &str, signed: bool) -> CallSubject {
        CallSubject {
            subject_id: id.to_string(),
            phone_number: Some(format!("+1555{}", id)),
            active: true,
            enabled: true,
            contactable: true,
            signed,
            claims: vec![Claim {
                claim_id: format!("{}-claim", id),
                status: ClaimStatus::Open,
                value_cents: 125_000,
                requirements: vec![Requirement {
                    requirement_type: "W2".into(),
                    status: RequirementStatus::Pending,
                }],
            }],
            last_outcome: None,
            last_contact_at: None,
            total_attempts: 0,
            preferred_contact_hour: Some(9),
            utc_offset_minutes: -300,
        }
    }

    #[tokio::test]
    async fn test_subject_round_trip_through_source() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        db.upsert_subject(&subject("0001", true)).await.unwrap();
        db.upsert_subject(&subject("0002", false)).await.unwrap();

        let mut hidden = subject("0003", true);
        hidden.enabled = false;
        db.upsert_subject(&hidden).await.unwrap();

        let source = SqlEligibilitySource::new(db.clone());
        assert_eq!(source.count_eligible().await.unwrap(), 2);

        let page = source.fetch_subjects(0, 10).await.unwrap();
        assert_eq!(page.len(), 2);
        let first = page[0].as_ref().unwrap();
        assert_eq!(first, &subject("0001", true));

        let second_page = source.fetch_subjects(1, 10).await.unwrap();
        assert_eq!(second_page.len(), 1);
        assert_eq!(second_page[0].as_ref().unwrap().subject_id, "0002");

        assert_eq!(source.subject_for_phone("+15550002").await.unwrap().as_deref(), Some("0002"));
        assert!(source.get_subject("0003").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_status_is_isolated_to_its_subject() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        db.upsert_subject(&subject("0001", true)).await.unwrap();
        db.upsert_subject(&subject("0002", true)).await.unwrap();

        sqlx::query("UPDATE claims SET status = 'MAYBE' WHERE subject_id = '0001'")
            .execute(db.pool())
            .await
            .unwrap();

        let page = db.fetch_eligible_subjects(0, 10).await.unwrap();
        assert_eq!(page.len(), 2);
        let err = page[0].as_ref().unwrap_err();
        assert_eq!(err.subject_id, "0001");
        assert!(page[1].is_ok());
    }

    #[tokio::test]
    async fn test_record_contact_attempt_updates_history() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        db.upsert_subject(&subject("0001", true)).await.unwrap();

        let at = Utc::now();
        assert!(db.record_contact_attempt("0001", CallOutcome::NoAnswer, at).await.unwrap());
        let loaded = db.load_subject("0001").await.unwrap().unwrap();
        assert_eq!(loaded.last_outcome, Some(CallOutcome::NoAnswer));
        assert_eq!(loaded.total_attempts, 1);
        assert!(!db.record_contact_attempt("missing", CallOutcome::Busy, at).await.unwrap());
    }
}
