//! # Subject Routing Module
//!
//! Decides which outbound queue a call subject belongs in and how urgently it
//! should be worked. Both decisions are pure functions over a typed
//! [`CallSubject`]; nothing in this module touches the database.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │      EligibilitySource       │  subjects + claims + requirements
//! └──────────────┬───────────────┘
//!                │ CallSubject (typed, immutable)
//!        ┌───────┴────────┐
//!        ▼                ▼
//! ┌─────────────┐  ┌──────────────┐
//! │  classify() │  │ PriorityScorer│
//! │  → category │  │  → score      │
//! └──────┬──────┘  └──────┬───────┘
//!        └───────┬────────┘
//!                ▼
//!       Queue Membership Reconciler
//! ```
//!
//! ## Categories
//!
//! - **Unsigned**: no signature on file; always takes precedence
//! - **Outstanding**: signed, with a qualifying pending requirement
//! - **Ineligible** (`NONE`): unreachable, all claims cancelled, or nothing to do
//!
//! ## Scores
//!
//! Lower is more urgent. Scores are clamped to the configured range; callback
//! entries never go through the scorer and use fixed override priorities that sort
//! ahead of every computed score.

pub mod eligibility;
pub mod scoring;
pub mod types;

use async_trait::async_trait;

use crate::error::Result;

pub use eligibility::{classify, pending_requirement_count, EligibilityRules};
pub use scoring::{PriorityScorer, ScoreBreakdown};
pub use types::{
    CallOutcome, CallSubject, Claim, ClaimStatus, QueueCategory, QueueState, Requirement, RequirementStatus,
};

/// A subject that could not be converted into a typed record
#[derive(Debug, Clone)]
pub struct SubjectLoadError {
    pub subject_id: String,
    pub message: String,
}

/// Result of loading a single subject in a batch
pub type SubjectLoad = std::result::Result<CallSubject, SubjectLoadError>;

/// Batched read access to the external record system.
///
/// Pages are ordered by subject id so that an offset taken from one run can be
/// handed to the next.
#[async_trait]
pub trait EligibilitySource: Send + Sync {
    /// Subjects that are active, enabled and contactable
    async fn count_eligible(&self) -> Result<u64>;

    /// One page of eligible subjects. A subject whose rows are malformed comes back
    /// as an `Err` entry without failing the page.
    async fn fetch_subjects(&self, offset: u64, limit: u32) -> Result<Vec<SubjectLoad>>;

    async fn get_subject(&self, subject_id: &str) -> Result<Option<CallSubject>>;

    /// Resolve an inbound caller's number to a known subject
    async fn subject_for_phone(&self, phone_number: &str) -> Result<Option<String>>;
}
