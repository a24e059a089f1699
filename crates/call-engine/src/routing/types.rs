//! Typed call-subject records.
//!
//! The eligibility source stores subjects, claims and requirements as loose rows;
//! they are converted once into these immutable values so the classifier and
//! scorer never look at untyped data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

string_enum! {
    /// Outbound queue a subject belongs to.
    ///
    /// `Ineligible` is stored as `NONE`.
    pub enum QueueCategory {
        /// No signature on file
        Unsigned => "UNSIGNED",
        /// Signed, with at least one outstanding requirement
        Outstanding => "OUTSTANDING",
        Ineligible => "NONE",
    }
}

impl QueueCategory {
    /// Whether subjects in this category belong in the outbound queue
    pub fn is_queueable(&self) -> bool {
        !matches!(self, QueueCategory::Ineligible)
    }
}

string_enum! {
    pub enum ClaimStatus {
        Open => "OPEN",
        Cancelled => "CANCELLED",
        Closed => "CLOSED",
    }
}

string_enum! {
    pub enum RequirementStatus {
        Pending => "PENDING",
        Satisfied => "SATISFIED",
        Waived => "WAIVED",
    }
}

string_enum! {
    /// Result of a completed contact attempt
    pub enum CallOutcome {
        Connected => "CONNECTED",
        NoAnswer => "NO_ANSWER",
        Voicemail => "VOICEMAIL",
        Busy => "BUSY",
        NotInterested => "NOT_INTERESTED",
        WrongNumber => "WRONG_NUMBER",
        CallbackRequested => "CALLBACK_REQUESTED",
    }
}

/// Something the subject still owes on a claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub requirement_type: String,
    pub status: RequirementStatus,
}

impl Requirement {
    pub fn is_pending(&self) -> bool {
        self.status == RequirementStatus::Pending
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub claim_id: String,
    pub status: ClaimStatus,
    pub value_cents: i64,
    pub requirements: Vec<Requirement>,
}

impl Claim {
    pub fn is_cancelled(&self) -> bool {
        self.status == ClaimStatus::Cancelled
    }
}

/// A person eligible for contact, as read from the record system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSubject {
    pub subject_id: String,
    pub phone_number: Option<String>,
    pub active: bool,
    pub enabled: bool,
    pub contactable: bool,
    /// Signature on file
    pub signed: bool,
    pub claims: Vec<Claim>,
    pub last_outcome: Option<CallOutcome>,
    pub last_contact_at: Option<DateTime<Utc>>,
    pub total_attempts: u32,
    /// Preferred local hour of day (0-23) for contact
    pub preferred_contact_hour: Option<u8>,
    pub utc_offset_minutes: i32,
}

impl CallSubject {
    /// Active, enabled and contactable
    pub fn is_reachable(&self) -> bool {
        self.active && self.enabled && self.contactable
    }

    /// True only when the subject has claims and every one is cancelled.
    pub fn all_claims_cancelled(&self) -> bool {
        !self.claims.is_empty() && self.claims.iter().all(Claim::is_cancelled)
    }

    pub fn live_claims(&self) -> impl Iterator<Item = &Claim> {
        self.claims.iter().filter(|c| !c.is_cancelled())
    }

    pub fn total_claim_value_cents(&self) -> i64 {
        self.live_claims().map(|c| c.value_cents.max(0)).sum()
    }
}

/// Per-subject queue membership record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    pub subject_id: String,
    /// `None` when the row exists but was never categorized
    pub category: Option<QueueCategory>,
    pub priority_score: i32,
    pub active: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueState {
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map_or(false, |until| until > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_category_round_trips_stored_text() {
        assert_eq!(QueueCategory::Ineligible.as_str(), "NONE");
        assert_eq!(QueueCategory::from_str("OUTSTANDING").unwrap(), QueueCategory::Outstanding);
        assert!(QueueCategory::from_str("category_a").is_err());
    }

    #[test]
    fn test_outcome_serde_uses_stored_names() {
        let json = serde_json::to_string(&CallOutcome::NotInterested).unwrap();
        assert_eq!(json, "\"NOT_INTERESTED\"");
        let parsed: CallOutcome = serde_json::from_str("\"NO_ANSWER\"").unwrap();
        assert_eq!(parsed, CallOutcome::NoAnswer);
    }

    #[test]
    fn test_no_claims_is_not_all_cancelled() {
        let subject = CallSubject {
            subject_id: "s-1".into(),
            phone_number: None,
            active: true,
            enabled: true,
            contactable: true,
            signed: true,
            claims: vec![],
            last_outcome: None,
            last_contact_at: None,
            total_attempts: 0,
            preferred_contact_hour: None,
            utc_offset_minutes: 0,
        };
        assert!(!subject.all_claims_cancelled());
    }
}
