//! Queue membership reconciler
//!
//! Walks the eligible subjects in id order, classifies each one, and brings its
//! stored queue state (and live queue entry) in line. Runs are budgeted and
//! resumable: a run that stops early reports the offset to continue from.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ReconcilerConfig;
use crate::database::{ApplyOutcome, DatabaseManager, DbReconciliationRun, StateChange};
use crate::error::Result;
use crate::routing::{classify, EligibilityRules, EligibilitySource, PriorityScorer, QueueCategory, QueueState, SubjectLoad};

/// Failures listed individually in a report; the counter keeps going past this
const MAX_REPORTED_FAILURES: usize = 50;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileParams {
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub max_subjects: Option<u32>,
    #[serde(default)]
    pub dry_run: bool,
}

/// How a subject's stored state differed from its classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    MissingRecord,
    MissingCategory,
    WrongCategory,
    InactiveShouldBeActive,
    InCooldown,
    AlreadyCorrect,
}

/// Compare a fresh classification with the stored state
pub fn detect_drift(state: Option<&QueueState>, category: QueueCategory, now: DateTime<Utc>) -> DriftKind {
    match state {
        None => DriftKind::MissingRecord,
        Some(s) if s.category.is_none() => DriftKind::MissingCategory,
        Some(s) if s.category != Some(category) => DriftKind::WrongCategory,
        Some(s) if category.is_queueable() && !s.active => DriftKind::InactiveShouldBeActive,
        Some(s) if s.in_cooldown(now) => DriftKind::InCooldown,
        Some(_) => DriftKind::AlreadyCorrect,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriftCounts {
    pub missing_record: u64,
    pub missing_category: u64,
    pub wrong_category: u64,
    pub inactive_should_be_active: u64,
    pub in_cooldown: u64,
    pub already_correct: u64,
}

impl DriftCounts {
    fn record(&mut self, kind: DriftKind) {
        match kind {
            DriftKind::MissingRecord => self.missing_record += 1,
            DriftKind::MissingCategory => self.missing_category += 1,
            DriftKind::WrongCategory => self.wrong_category += 1,
            DriftKind::InactiveShouldBeActive => self.inactive_should_be_active += 1,
            DriftKind::InCooldown => self.in_cooldown += 1,
            DriftKind::AlreadyCorrect => self.already_correct += 1,
        }
    }

    /// Subjects whose stored state needed correcting
    pub fn drifted(&self) -> u64 {
        self.missing_record + self.missing_category + self.wrong_category + self.inactive_should_be_active
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeCounts {
    pub states_created: u64,
    pub entries_created: u64,
    pub entries_invalidated: u64,
    pub entries_reprioritized: u64,
    pub deferred_for_assigned: u64,
    pub orphaned_entries_invalidated: u64,
    pub states_deactivated: u64,
}

impl ChangeCounts {
    fn absorb(&mut self, outcome: &ApplyOutcome) {
        self.states_created += outcome.state_created as u64;
        self.entries_created += outcome.entry_created as u64;
        self.entries_invalidated += outcome.entries_invalidated as u64;
        self.entries_reprioritized += outcome.entry_reprioritized as u64;
        self.deferred_for_assigned += outcome.deferred_for_assigned as u64;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Reached the end of the subject set
    Completed,
    /// Stopped at `max_subjects` or the execution budget; resume at `next_offset`
    Partial,
    /// A batch-level failure; resume at `next_offset`
    Aborted,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "COMPLETED",
            RunOutcome::Partial => "PARTIAL",
            RunOutcome::Aborted => "ABORTED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubjectFailure {
    pub subject_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub start_offset: u64,
    /// Offset to pass to the next run; equals the number of subjects walked past
    pub next_offset: u64,
    pub total_eligible: u64,
    pub processed: u64,
    pub batches: u32,
    pub errors: u64,
    pub budget_exhausted: bool,
    pub outcome: RunOutcome,
    pub abort_reason: Option<String>,
    pub drift: DriftCounts,
    pub changes: ChangeCounts,
    pub failures: Vec<SubjectFailure>,
    pub recommendations: Vec<String>,
}

impl ReconciliationReport {
    fn new(params: &ReconcileParams, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            started_at,
            finished_at: started_at,
            dry_run: params.dry_run,
            start_offset: params.offset,
            next_offset: params.offset,
            total_eligible: 0,
            processed: 0,
            batches: 0,
            errors: 0,
            budget_exhausted: false,
            outcome: RunOutcome::Partial,
            abort_reason: None,
            drift: DriftCounts::default(),
            changes: ChangeCounts::default(),
            failures: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    pub fn has_more(&self) -> bool {
        self.outcome != RunOutcome::Completed
    }

    fn record_failure(&mut self, subject_id: &str, message: String) {
        self.errors += 1;
        if self.failures.len() < MAX_REPORTED_FAILURES {
            self.failures.push(SubjectFailure {
                subject_id: subject_id.to_string(),
                message,
            });
        }
    }

    fn compute_recommendations(&mut self) {
        let mut recs = Vec::new();
        match self.outcome {
            RunOutcome::Aborted => recs.push(format!(
                "Run aborted; resume with offset {} once the store is healthy",
                self.next_offset
            )),
            RunOutcome::Partial => recs.push(format!("Resume with offset {} to finish the pass", self.next_offset)),
            RunOutcome::Completed => {}
        }
        if self.budget_exhausted {
            recs.push("Execution budget was hit; consider a smaller batch size or more frequent runs".to_string());
        }
        if self.errors > 0 {
            recs.push(format!(
                "{} subject(s) failed; check their claim and requirement records",
                self.errors
            ));
        }
        if self.processed > 0 && self.drift.drifted() * 10 > self.processed {
            recs.push(format!(
                "{} of {} subjects had drifted; queue transitions may be missing upstream events",
                self.drift.drifted(),
                self.processed
            ));
        }
        if self.changes.deferred_for_assigned > 0 {
            recs.push(format!(
                "{} subject(s) are mid-call; their new queue entries appear after the call ends",
                self.changes.deferred_for_assigned
            ));
        }
        if self.dry_run && self.drift.drifted() > 0 {
            recs.push("Dry run only: rerun without dry_run to apply corrections".to_string());
        }
        self.recommendations = recs;
    }

    fn to_run_record(&self) -> Result<DbReconciliationRun> {
        Ok(DbReconciliationRun {
            run_id: self.run_id.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            start_offset: self.start_offset,
            next_offset: self.next_offset,
            dry_run: self.dry_run,
            outcome: self.outcome.as_str().to_string(),
            processed: self.processed,
            errors: self.errors,
            report: serde_json::to_value(self)?,
        })
    }
}

pub struct QueueReconciler {
    db: DatabaseManager,
    source: Arc<dyn EligibilitySource>,
    rules: EligibilityRules,
    scorer: PriorityScorer,
    config: ReconcilerConfig,
}

impl QueueReconciler {
    pub fn new(
        db: DatabaseManager,
        source: Arc<dyn EligibilitySource>,
        scorer: PriorityScorer,
        config: ReconcilerConfig,
    ) -> Self {
        let rules = EligibilityRules::from_config(&config);
        Self {
            db,
            source,
            rules,
            scorer,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one budgeted pass starting at `params.offset`. Always returns a
    /// report; batch-level failures show up as `RunOutcome::Aborted`.
    pub async fn run(&self, params: ReconcileParams) -> Result<ReconciliationReport> {
        let clock = Instant::now();
        let mut report = ReconciliationReport::new(&params, Utc::now());
        let batch_size = params.batch_size.unwrap_or(self.config.batch_size).max(1);
        let max_subjects = params.max_subjects.unwrap_or(self.config.max_subjects).max(1) as u64;
        let budget = self.config.execution_budget();

        info!(
            "🔄 Reconciliation {} starting at offset {} (batch {}, max {}, dry_run {})",
            report.run_id, params.offset, batch_size, max_subjects, params.dry_run
        );

        match self.walk(&mut report, batch_size, max_subjects, budget, clock).await {
            Ok(()) => {}
            Err(e) => {
                error!(
                    "❌ Reconciliation {} aborted at offset {}: {}",
                    report.run_id, report.next_offset, e
                );
                report.outcome = RunOutcome::Aborted;
                report.abort_reason = Some(e.to_string());
            }
        }

        if report.outcome == RunOutcome::Completed && !report.dry_run {
            self.cleanup_orphans(&mut report).await;
        }

        report.finished_at = Utc::now();
        report.compute_recommendations();

        if let Err(e) = self.db.insert_reconciliation_run(&report.to_run_record()?).await {
            warn!("⚠️ Could not persist reconciliation run {}: {}", report.run_id, e);
        }

        info!(
            "🏁 Reconciliation {} {:?}: processed {}, drifted {}, errors {}, next offset {}",
            report.run_id,
            report.outcome,
            report.processed,
            report.drift.drifted(),
            report.errors,
            report.next_offset
        );
        Ok(report)
    }

    async fn walk(
        &self,
        report: &mut ReconciliationReport,
        batch_size: u32,
        max_subjects: u64,
        budget: std::time::Duration,
        clock: Instant,
    ) -> Result<()> {
        report.total_eligible = self.source.count_eligible().await?;

        loop {
            if report.processed >= max_subjects {
                report.outcome = RunOutcome::Partial;
                return Ok(());
            }

            let limit = (batch_size as u64).min(max_subjects - report.processed) as u32;
            let page = self.source.fetch_subjects(report.next_offset, limit).await?;
            if page.is_empty() {
                report.outcome = RunOutcome::Completed;
                return Ok(());
            }

            let fetched = page.len() as u64;
            self.process_batch(report, page).await?;
            report.batches += 1;
            report.processed += fetched;
            report.next_offset += fetched;

            if fetched < limit as u64 {
                report.outcome = RunOutcome::Completed;
                return Ok(());
            }

            // Checked after each batch so that every run makes progress
            if clock.elapsed() >= budget {
                warn!(
                    "⏱️ Reconciliation {} hit its {:?} budget at offset {}",
                    report.run_id, budget, report.next_offset
                );
                report.budget_exhausted = true;
                report.outcome = RunOutcome::Partial;
                return Ok(());
            }
        }
    }

    async fn process_batch(&self, report: &mut ReconciliationReport, page: Vec<SubjectLoad>) -> Result<()> {
        let ids: Vec<String> = page
            .iter()
            .map(|load| match load {
                Ok(subject) => subject.subject_id.clone(),
                Err(e) => e.subject_id.clone(),
            })
            .collect();
        let states = self.db.get_queue_states(&ids).await?;
        let now = Utc::now();

        for load in page {
            let subject = match load {
                Ok(subject) => subject,
                Err(e) => {
                    warn!("⚠️ Skipping malformed subject {}: {}", e.subject_id, e.message);
                    report.record_failure(&e.subject_id, e.message);
                    continue;
                }
            };

            let category = classify(&subject, &self.rules);
            let drift = detect_drift(states.get(&subject.subject_id), category, now);
            report.drift.record(drift);
            debug!("Subject {} -> {} ({:?})", subject.subject_id, category, drift);

            if report.dry_run {
                continue;
            }

            let change = StateChange {
                subject_id: subject.subject_id.clone(),
                category,
                priority_score: self.scorer.score(&subject, category, now),
                now,
            };
            match self.db.apply_state_change(&change).await {
                Ok(outcome) => report.changes.absorb(&outcome),
                Err(e) => {
                    warn!("⚠️ Failed to reconcile subject {}: {}", subject.subject_id, e);
                    report.record_failure(&subject.subject_id, e.to_string());
                }
            }
        }
        Ok(())
    }

    async fn cleanup_orphans(&self, report: &mut ReconciliationReport) {
        let now = Utc::now();
        match self.db.deactivate_unreachable_states(now).await {
            Ok(n) => report.changes.states_deactivated = n,
            Err(e) => {
                warn!("⚠️ Could not deactivate unreachable states: {}", e);
                report.record_failure("*", e.to_string());
            }
        }
        match self.db.invalidate_orphaned_entries(now).await {
            Ok(n) => report.changes.orphaned_entries_invalidated = n,
            Err(e) => {
                warn!("⚠️ Could not invalidate orphaned entries: {}", e);
                report.record_failure("*", e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::config::ScoringConfig;
    use crate::database::SqlEligibilitySource;
    use crate::error::CallCenterError;
    use crate::routing::{CallSubject, Claim, ClaimStatus, Requirement, RequirementStatus, SubjectLoadError};

    /// Serves fixed pages; every page at or past `fail_from` errors
    struct ScriptedSource {
        loads: Vec<SubjectLoad>,
        fail_from: Option<u64>,
    }

    #[async_trait]
    impl EligibilitySource for ScriptedSource {
        async fn count_eligible(&self) -> Result<u64> {
            Ok(self.loads.len() as u64)
        }

        async fn fetch_subjects(&self, offset: u64, limit: u32) -> Result<Vec<SubjectLoad>> {
            if self.fail_from.is_some_and(|from| offset >= from) {
                return Err(CallCenterError::database("record store unavailable"));
            }
            Ok(self.loads.iter().skip(offset as usize).take(limit as usize).cloned().collect())
        }

        async fn get_subject(&self, subject_id: &str) -> Result<Option<CallSubject>> {
            Ok(self
                .loads
                .iter()
                .filter_map(|load| load.as_ref().ok())
                .find(|s| s.subject_id == subject_id)
                .cloned())
        }

        async fn subject_for_phone(&self, _phone_number: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn scripted(db: &DatabaseManager, source: ScriptedSource, config: ReconcilerConfig) -> QueueReconciler {
        let rules = EligibilityRules::from_config(&config);
        QueueReconciler::new(
            db.clone(),
            Arc::new(source),
            PriorityScorer::new(ScoringConfig::default(), rules),
            config,
        )
    }

    async fn seeded(db: &DatabaseManager, count: usize) -> Vec<SubjectLoad> {
        let mut loads = Vec::new();
        for i in 0..count {
            let subject = subject(&format!("{:03}", i), i % 2 == 0);
            db.upsert_subject(&subject).await.unwrap();
            loads.push(Ok(subject));
        }
        loads
    }

    fn subject(id: &str, signed: bool) -> CallSubject {
        CallSubject {
            subject_id: id.to_string(),
            phone_number: Some(format!("+1555{}", id)),
            active: true,
            enabled: true,
            contactable: true,
            signed,
            claims: vec![Claim {
                claim_id: format!("{}-c1", id),
                status: ClaimStatus::Open,
                value_cents: 250_000,
                requirements: vec![Requirement {
                    requirement_type: "MEDICAL_RECORDS".to_string(),
                    status: RequirementStatus::Pending,
                }],
            }],
            last_outcome: None,
            last_contact_at: None,
            total_attempts: 0,
            preferred_contact_hour: None,
            utc_offset_minutes: 0,
        }
    }

    fn reconciler(db: &DatabaseManager) -> QueueReconciler {
        let config = ReconcilerConfig::default();
        let rules = EligibilityRules::from_config(&config);
        QueueReconciler::new(
            db.clone(),
            Arc::new(SqlEligibilitySource::new(db.clone())),
            PriorityScorer::new(ScoringConfig::default(), rules),
            config,
        )
    }

    #[test]
    fn test_drift_detection() {
        let now = Utc::now();
        let mut state = QueueState {
            subject_id: "s".to_string(),
            category: Some(QueueCategory::Unsigned),
            priority_score: 100,
            active: true,
            cooldown_until: None,
            last_reconciled_at: Some(now),
            created_at: now,
            updated_at: now,
        };
        assert_eq!(detect_drift(None, QueueCategory::Unsigned, now), DriftKind::MissingRecord);
        assert_eq!(detect_drift(Some(&state), QueueCategory::Unsigned, now), DriftKind::AlreadyCorrect);
        assert_eq!(detect_drift(Some(&state), QueueCategory::Outstanding, now), DriftKind::WrongCategory);

        state.active = false;
        assert_eq!(
            detect_drift(Some(&state), QueueCategory::Unsigned, now),
            DriftKind::InactiveShouldBeActive
        );

        state.active = true;
        state.cooldown_until = Some(now + chrono::Duration::hours(1));
        assert_eq!(detect_drift(Some(&state), QueueCategory::Unsigned, now), DriftKind::InCooldown);

        state.category = None;
        assert_eq!(detect_drift(Some(&state), QueueCategory::Unsigned, now), DriftKind::MissingCategory);
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        db.upsert_subject(&subject("001", false)).await.unwrap();

        let report = reconciler(&db)
            .run(ReconcileParams {
                dry_run: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.drift.missing_record, 1);
        assert_eq!(db.count_queue_states().await.unwrap(), 0);
        assert!(!report.recommendations.is_empty());
    }

    #[tokio::test]
    async fn test_run_creates_state_and_second_run_is_clean() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        db.upsert_subject(&subject("001", false)).await.unwrap();
        db.upsert_subject(&subject("002", true)).await.unwrap();
        let reconciler = reconciler(&db);

        let first = reconciler.run(ReconcileParams::default()).await.unwrap();
        assert_eq!(first.processed, 2);
        assert_eq!(first.changes.states_created, 2);
        assert_eq!(first.changes.entries_created, 2);
        assert_eq!(first.next_offset, 2);

        let second = reconciler.run(ReconcileParams::default()).await.unwrap();
        assert_eq!(second.drift.already_correct, 2);
        assert_eq!(second.changes.entries_created, 0);

        let runs = db.recent_reconciliation_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs.iter().filter(|r| r.outcome == "COMPLETED").count(), 2);
    }

    #[tokio::test]
    async fn test_max_subjects_yields_partial_with_offset() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        for i in 0..5 {
            db.upsert_subject(&subject(&format!("{:03}", i), false)).await.unwrap();
        }
        let reconciler = reconciler(&db);

        let first = reconciler
            .run(ReconcileParams {
                batch_size: Some(2),
                max_subjects: Some(3),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(first.outcome, RunOutcome::Partial);
        assert_eq!(first.processed, 3);
        assert_eq!(first.next_offset, 3);
        assert!(first.has_more());

        let second = reconciler
            .run(ReconcileParams {
                offset: first.next_offset,
                batch_size: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.outcome, RunOutcome::Completed);
        assert_eq!(second.processed, 2);
        assert_eq!(db.count_queue_states().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_page_failure_aborts_and_keeps_resume_offset() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let loads = seeded(&db, 6).await;
        let params = ReconcileParams {
            batch_size: Some(2),
            ..Default::default()
        };

        let failing = ScriptedSource {
            loads: loads.clone(),
            fail_from: Some(4),
        };
        let report = scripted(&db, failing, ReconcilerConfig::default()).run(params.clone()).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Aborted);
        assert_eq!(report.batches, 2);
        assert_eq!(report.processed, 4);
        assert_eq!(report.next_offset, 4);
        assert!(report.abort_reason.as_deref().is_some_and(|r| r.contains("record store unavailable")));
        assert!(report.recommendations.iter().any(|r| r.contains("offset 4")));
        assert_eq!(db.count_queue_states().await.unwrap(), 4);

        let runs = db.recent_reconciliation_runs(1).await.unwrap();
        assert_eq!(runs[0].run_id, report.run_id);
        assert_eq!(runs[0].outcome, "ABORTED");
        assert_eq!(runs[0].next_offset, 4);

        let healthy = ScriptedSource { loads, fail_from: None };
        let resumed = scripted(&db, healthy, ReconcilerConfig::default())
            .run(ReconcileParams {
                offset: report.next_offset,
                ..params
            })
            .await
            .unwrap();
        assert_eq!(resumed.outcome, RunOutcome::Completed);
        assert_eq!(resumed.processed, 2);
        assert_eq!(db.count_queue_states().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_malformed_subject_is_counted_and_the_rest_applied() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let mut loads = seeded(&db, 3).await;
        loads[1] = Err(SubjectLoadError {
            subject_id: "001".to_string(),
            message: "claim row has no status".to_string(),
        });

        let source = ScriptedSource { loads, fail_from: None };
        let report = scripted(&db, source, ReconcilerConfig::default())
            .run(ReconcileParams::default())
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.processed, 3);
        assert_eq!(report.errors, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].subject_id, "001");
        assert_eq!(report.changes.states_created, 2);
        assert!(report.recommendations.iter().any(|r| r.contains("1 subject(s) failed")));

        let states = db.get_queue_states(&["000".to_string(), "001".to_string(), "002".to_string()]).await.unwrap();
        assert!(states.contains_key("000"));
        assert!(!states.contains_key("001"));
        assert!(states.contains_key("002"));
    }

    #[tokio::test]
    async fn test_exhausted_budget_stops_after_one_batch() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let loads = seeded(&db, 5).await;
        let config = ReconcilerConfig {
            execution_budget_secs: 0,
            ..Default::default()
        };

        let report = scripted(&db, ScriptedSource { loads, fail_from: None }, config)
            .run(ReconcileParams {
                batch_size: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(report.budget_exhausted);
        assert_eq!(report.outcome, RunOutcome::Partial);
        assert_eq!(report.batches, 1);
        assert_eq!(report.next_offset, 2);
        assert!(report.recommendations.iter().any(|r| r.contains("Execution budget")));
    }
}
