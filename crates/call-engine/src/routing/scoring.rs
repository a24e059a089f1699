//! Outbound priority scoring. Lower scores are more urgent.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;

use crate::config::ScoringConfig;
use crate::routing::eligibility::{pending_requirement_count, EligibilityRules};
use crate::routing::types::{CallSubject, QueueCategory};

/// Signed contributions to a subject's score, before clamping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScoreBreakdown {
    pub base: i32,
    /// Negative: time since the last contact
    pub recency: i32,
    /// Negative: qualifying pending requirements
    pub requirements: i32,
    /// Negative: claim value band
    pub value: i32,
    /// Signed: last outcome
    pub outcome: i32,
    /// Negative: never contacted
    pub first_contact: i32,
    /// Positive: attempts above the threshold
    pub attempts: i32,
    /// Negative: contact hour matches preference
    pub time_of_day: i32,
    /// Negative: unsigned subjects
    pub category: i32,
}

impl ScoreBreakdown {
    pub fn raw(&self) -> i32 {
        self.base
            + self.recency
            + self.requirements
            + self.value
            + self.outcome
            + self.first_contact
            + self.attempts
            + self.time_of_day
            + self.category
    }
}

/// Computes subject priorities from contact history and claim data
#[derive(Debug, Clone)]
pub struct PriorityScorer {
    config: ScoringConfig,
    rules: EligibilityRules,
}

impl PriorityScorer {
    pub fn new(config: ScoringConfig, rules: EligibilityRules) -> Self {
        Self { config, rules }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Clamped priority for `subject` in `category` as of `now`
    pub fn score(&self, subject: &CallSubject, category: QueueCategory, now: DateTime<Utc>) -> i32 {
        self.clamp(self.breakdown(subject, category, now).raw())
    }

    pub fn clamp(&self, raw: i32) -> i32 {
        raw.clamp(self.config.min_score, self.config.max_score)
    }

    pub fn breakdown(&self, subject: &CallSubject, category: QueueCategory, now: DateTime<Utc>) -> ScoreBreakdown {
        let cfg = &self.config;
        let mut breakdown = ScoreBreakdown { base: cfg.base_score, ..Default::default() };

        match subject.last_contact_at {
            Some(last) => {
                let days = (now - last).num_days().clamp(0, cfg.max_days_since_contact);
                breakdown.recency = -(days as i32) * cfg.days_since_contact_weight;
            }
            None => {
                breakdown.recency = -(cfg.max_days_since_contact as i32) * cfg.days_since_contact_weight;
                breakdown.first_contact = -cfg.first_contact_bonus;
            }
        }

        let pending = pending_requirement_count(subject, &self.rules).min(cfg.max_pending_requirements as usize);
        breakdown.requirements = -(pending as i32) * cfg.pending_requirement_weight;

        let total_value = subject.total_claim_value_cents();
        breakdown.value = -cfg
            .value_bands
            .iter()
            .filter(|band| total_value >= band.min_value_cents)
            .map(|band| band.bonus)
            .max()
            .unwrap_or(0);

        if let Some(outcome) = subject.last_outcome {
            breakdown.outcome = cfg.outcomes.for_outcome(outcome).adjustment;
        }

        if subject.total_attempts > cfg.high_attempt_threshold {
            let excess = (subject.total_attempts - cfg.high_attempt_threshold) as i32;
            breakdown.attempts = excess.saturating_mul(cfg.attempt_penalty);
        }

        if let Some(preferred) = subject.preferred_contact_hour {
            let local = now + Duration::minutes(subject.utc_offset_minutes as i64);
            if hour_distance(local.hour(), preferred as u32) <= 1 {
                breakdown.time_of_day = -cfg.time_of_day_bonus;
            }
        }

        if category == QueueCategory::Unsigned {
            breakdown.category = -cfg.unsigned_bonus;
        }

        breakdown
    }
}

// Distance on a 24-hour clock
fn hour_distance(a: u32, b: u32) -> u32 {
    let d = a.abs_diff(b) % 24;
    d.min(24 - d)
}
