//! Integration tests for the call-engine
//!
//! These drive the engine end to end against an in-memory database: the
//! reconciler feeding the outbound queue, the holding queue, concurrent
//! assignment ticks, callbacks and telephony events.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serial_test::serial;
use tokio::task::JoinSet;

use dialq_call_engine::config::DatabaseConfig;
use dialq_call_engine::database::{DatabaseManager, EntryStatus, HoldingStatus};
use dialq_call_engine::orchestrator::{CallRef, RecordingGateway};
use dialq_call_engine::prelude::*;
use dialq_call_engine::queue::RunOutcome;
use dialq_call_engine::routing::{Claim, ClaimStatus, Requirement, RequirementStatus};

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
            value_cents: 500_000,
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

async fn create_test_call_center() -> (Arc<CallCenterEngine>, Arc<RecordingGateway>) {
    dialq_call_engine::logging::init_test_logging();
    let db = DatabaseManager::new_in_memory().await.expect("in-memory database");
    let gateway = Arc::new(RecordingGateway::new());
    let engine = CallCenterEngine::with_database(CallCenterConfig::default(), db, gateway.clone());
    (engine, gateway)
}

async fn ready_agent(engine: &CallCenterEngine, agent_id: &str) {
    engine
        .register_agent(AgentRegistration {
            agent_id: agent_id.to_string(),
            display_name: agent_id.to_string(),
            max_concurrent_calls: Some(1),
        })
        .await
        .unwrap();
    engine.login_agent(agent_id, &format!("{}-session", agent_id), true).await.unwrap();
}

async fn inbound(engine: &CallCenterEngine, call_id: &str, priority: i32) -> EnqueueResult {
    engine
        .enqueue_inbound(InboundCall {
            call_id: call_id.to_string(),
            caller_number: None,
            priority: Some(priority),
        })
        .await
        .unwrap()
}

async fn assert_no_duplicate_live_entries(engine: &CallCenterEngine) {
    let duplicates = engine.database().duplicate_live_entries().await.unwrap();
    assert!(duplicates.is_empty(), "duplicate live entries: {:?}", duplicates);
}

#[tokio::test]
#[serial]
async fn test_concurrent_ticks_assign_each_call_once() {
    let (engine, gateway) = create_test_call_center().await;
    for agent in ["alice", "bob", "carol"] {
        ready_agent(&engine, agent).await;
    }
    for i in 0..5 {
        inbound(&engine, &format!("call-{}", i), 10).await;
    }

    let mut ticks = JoinSet::new();
    for _ in 0..8 {
        let engine = engine.clone();
        ticks.spawn(async move { engine.tick(TickParams::default()).await });
    }
    let mut assigned = 0;
    while let Some(result) = ticks.join_next().await {
        assigned += result.unwrap().unwrap().inbound_assigned;
    }

    let rings = gateway.rings();
    assert_eq!(assigned, 3);
    assert_eq!(rings.len(), 3);
    let agents: HashSet<_> = rings.iter().map(|(agent, _)| agent.clone()).collect();
    let calls: HashSet<_> = rings.iter().map(|(_, call)| call.id().to_string()).collect();
    assert_eq!(agents.len(), 3, "an agent was rung twice: {:?}", rings);
    assert_eq!(calls.len(), 3, "a call was rung twice: {:?}", rings);

    for agent in engine.list_agents().await.unwrap() {
        assert_eq!(agent.current_calls, 1);
        assert_eq!(agent.status, AgentStatus::OnCall);
    }
    let waiting = engine.waiting_calls().await.unwrap();
    assert_eq!(waiting.len(), 2);
    assert_eq!(waiting.iter().map(|e| e.position).collect::<Vec<_>>(), vec![1, 2]);
}

#[tokio::test]
#[serial]
async fn test_single_call_many_ticks() {
    let (engine, gateway) = create_test_call_center().await;
    ready_agent(&engine, "alice").await;
    ready_agent(&engine, "bob").await;
    inbound(&engine, "only-call", 10).await;

    let mut ticks = JoinSet::new();
    for _ in 0..10 {
        let engine = engine.clone();
        ticks.spawn(async move { engine.tick(TickParams { max_items: Some(1) }).await });
    }
    while let Some(result) = ticks.join_next().await {
        result.unwrap().unwrap();
    }

    assert_eq!(gateway.ring_count(), 1);
    let entry = engine.holding_queue().get("only-call").await.unwrap();
    assert_eq!(entry.status, HoldingStatus::Assigned);
    assert_eq!(entry.attempt_count, 1);
}

#[tokio::test]
async fn test_holding_queue_position_scenario() {
    let (engine, _gateway) = create_test_call_center().await;
    inbound(&engine, "a", 10).await;
    inbound(&engine, "b", 10).await;
    inbound(&engine, "c", 40).await;

    let result = inbound(&engine, "d", 10).await;
    assert_eq!(result.position, 3);

    let waiting = engine.waiting_calls().await.unwrap();
    let order: Vec<_> = waiting.iter().map(|e| (e.call_id.as_str(), e.position)).collect();
    assert_eq!(order, vec![("a", 1), ("b", 2), ("d", 3), ("c", 4)]);
    // No ready agents: every estimate is position × average duration, clamped
    let estimates: Vec<_> = waiting.iter().map(|e| e.estimated_wait_secs).collect();
    assert_eq!(estimates, vec![180, 360, 540, 600]);
}

#[tokio::test]
async fn test_reconciler_resumes_across_runs() {
    let (engine, _gateway) = create_test_call_center().await;
    for i in 0..100 {
        engine.database().upsert_subject(&subject(&format!("{:04}", i), i % 2 == 0)).await.unwrap();
    }

    let first = engine
        .reconcile(ReconcileParams {
            max_subjects: Some(50),
            batch_size: Some(20),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(first.processed, 50);
    assert_eq!(first.next_offset, 50);
    assert!(first.has_more());

    let second = engine
        .reconcile(ReconcileParams {
            offset: first.next_offset,
            max_subjects: Some(50),
            batch_size: Some(20),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(second.processed, 50);
    assert_eq!(second.next_offset, 100);

    let third = engine
        .reconcile(ReconcileParams {
            offset: second.next_offset,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(third.outcome, RunOutcome::Completed);
    assert_eq!(third.processed, 0);

    assert_eq!(engine.database().count_queue_states().await.unwrap(), 100);
    assert_no_duplicate_live_entries(&engine).await;
    let stats = engine.statistics().await.unwrap();
    let live: u64 = stats.outbound.live.values().sum();
    assert_eq!(live, 100);
}

#[tokio::test]
async fn test_unsigned_to_outstanding_leaves_no_stale_entry() {
    let (engine, _gateway) = create_test_call_center().await;
    let db = engine.database();
    db.upsert_subject(&subject("0001", false)).await.unwrap();
    engine.reconcile(ReconcileParams::default()).await.unwrap();

    let live = db.live_entries("0001").await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].category, QueueCategory::Unsigned);

    db.upsert_subject(&subject("0001", true)).await.unwrap();
    let report = engine.reconcile(ReconcileParams::default()).await.unwrap();
    assert_eq!(report.drift.wrong_category, 1);

    let live = db.live_entries("0001").await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].category, QueueCategory::Outstanding);
    assert_no_duplicate_live_entries(&engine).await;
}

#[tokio::test]
async fn test_overdue_callback_selected_every_tick_until_completed() {
    let (engine, _gateway) = create_test_call_center().await;
    let callback = engine
        .schedule_callback(NewCallback {
            subject_id: "0007".to_string(),
            scheduled_for: Utc::now() - Duration::minutes(1),
            reason: "asked for a call back".to_string(),
            preferred_agent_id: None,
            origin_call_id: None,
        })
        .await
        .unwrap();

    for _ in 0..3 {
        let report = engine.inject_callbacks().await.unwrap();
        assert_eq!(report.overdue, 1);
        assert!(report.callbacks.iter().any(|c| c.callback_id == callback.callback_id));
    }

    ready_agent(&engine, "alice").await;
    engine.accept_callback(&callback.callback_id, "alice").await.unwrap();
    let report = engine.inject_callbacks().await.unwrap();
    assert_eq!(report.overdue, 1, "accepted but unhandled callbacks stay actionable");

    engine.complete_callback(&callback.callback_id).await.unwrap();
    let report = engine.inject_callbacks().await.unwrap();
    assert_eq!(report.overdue, 0);

    let detail = engine.callback(&callback.callback_id).await.unwrap();
    assert!(detail.entries.iter().all(|e| !e.status.is_live()));
}

#[tokio::test]
async fn test_callback_priority_is_monotonic() {
    let (engine, _gateway) = create_test_call_center().await;
    let db = engine.database();
    db.upsert_subject(&subject("0042", true)).await.unwrap();
    engine.reconcile(ReconcileParams::default()).await.unwrap();
    let scored = db.live_entries("0042").await.unwrap()[0].priority;
    assert!(scored >= engine.config().scoring.min_score);

    let callback = engine
        .schedule_callback(NewCallback {
            subject_id: "0042".to_string(),
            scheduled_for: Utc::now() + Duration::minutes(5),
            reason: "follow up".to_string(),
            preferred_agent_id: None,
            origin_call_id: None,
        })
        .await
        .unwrap();
    engine.inject_callbacks().await.unwrap();
    let injected = db.live_entries("0042").await.unwrap();
    assert_eq!(injected.len(), 1);
    assert!(injected[0].priority < scored);

    ready_agent(&engine, "bob").await;
    engine.accept_callback(&callback.callback_id, "bob").await.unwrap();
    let accepted = db.live_entries("0042").await.unwrap();
    assert_eq!(accepted.len(), 1);
    assert!(accepted[0].priority < injected[0].priority);

    // Neither a fresh injection nor a reconcile pass loosens it again
    engine.inject_callbacks().await.unwrap();
    engine.reconcile(ReconcileParams::default()).await.unwrap();
    let after = db.live_entries("0042").await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].priority, accepted[0].priority);
    assert_no_duplicate_live_entries(&engine).await;
}

#[tokio::test]
async fn test_outbound_call_sets_cooldown() {
    let (engine, gateway) = create_test_call_center().await;
    let db = engine.database();
    db.upsert_subject(&subject("0100", false)).await.unwrap();
    engine.reconcile(ReconcileParams::default()).await.unwrap();
    ready_agent(&engine, "alice").await;

    let report = engine.tick(TickParams::default()).await.unwrap();
    assert_eq!(report.outbound_assigned, 1);
    let (agent, call) = gateway.rings().remove(0);
    assert_eq!(agent, "alice");
    assert!(!call.is_inbound());

    let effect = engine
        .handle_event(TelephonyEvent::CallEnded {
            call: call.clone(),
            agent_id: Some("alice".to_string()),
            outcome: Some(CallOutcome::NoAnswer),
            duration_secs: 20,
        })
        .await
        .unwrap();
    assert_eq!(effect, LifecycleEffect::OutboundCompleted { cooldown_minutes: 240 });

    let entry = db.get_queue_entry(call.id()).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Completed);

    // Cooling down: the next pass must not queue the subject again
    engine.reconcile(ReconcileParams::default()).await.unwrap();
    assert!(db.live_entries("0100").await.unwrap().is_empty());
    assert_eq!(engine.agent("alice").await.unwrap().status, AgentStatus::Available);
}

#[tokio::test]
async fn test_failed_agent_is_skipped_then_call_abandoned() {
    let (engine, gateway) = create_test_call_center().await;
    ready_agent(&engine, "alice").await;
    inbound(&engine, "c-1", 10).await;
    gateway.fail_agent("alice");

    let max = engine.config().orchestrator.max_assignment_attempts;
    let mut abandoned = 0;
    for _ in 0..max {
        abandoned += engine.tick(TickParams::default()).await.unwrap().abandoned;
    }

    let entry = engine.holding_queue().get("c-1").await.unwrap();
    assert_eq!(gateway.ring_count(), 0);
    assert_eq!(entry.failed_agents, vec!["alice".to_string()]);
    // A single agent fails once and is then excluded; the call keeps waiting
    assert_eq!(entry.status, HoldingStatus::Waiting);
    assert_eq!(abandoned, 0);

    let effect = engine
        .handle_event(TelephonyEvent::CallEnded {
            call: CallRef::Inbound {
                call_id: "c-1".to_string(),
            },
            agent_id: None,
            outcome: None,
            duration_secs: 0,
        })
        .await
        .unwrap();
    assert_eq!(effect, LifecycleEffect::Abandoned);
    let missed = engine.database().get_missed_contact("c-1").await.unwrap().unwrap();
    assert_eq!(missed.reason, "caller_hangup");
    assert_eq!(engine.agent("alice").await.unwrap().current_calls, 0);
}

#[tokio::test]
async fn test_heartbeat_expiry_removes_agent_from_ready_set() {
    let (engine, _gateway) = create_test_call_center().await;
    ready_agent(&engine, "alice").await;
    assert_eq!(engine.readiness().ready_agent_count().await.unwrap(), 1);

    let stale = Utc::now() - Duration::seconds(engine.config().agents.heartbeat_timeout_secs as i64 + 5);
    sqlx::query("UPDATE agents SET last_heartbeat = ? WHERE agent_id = 'alice'")
        .bind(stale)
        .execute(engine.database().pool())
        .await
        .unwrap();

    assert_eq!(engine.readiness().ready_agent_count().await.unwrap(), 0);
    let swept = engine.sweep_heartbeats().await.unwrap();
    assert_eq!(swept.expired_agents, vec!["alice".to_string()]);
    assert_eq!(engine.agent("alice").await.unwrap().status, AgentStatus::Offline);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_file_database_handles_concurrent_writers() {
    dialq_call_engine::logging::init_test_logging();
    let path = std::env::temp_dir().join(format!("dialq-{}.db", uuid::Uuid::new_v4()));
    let db = DatabaseManager::with_config(&DatabaseConfig {
        url: format!("sqlite://{}", path.display()),
        max_connections: 8,
        ..Default::default()
    })
    .await
    .unwrap();
    let gateway = Arc::new(RecordingGateway::new());
    let engine = CallCenterEngine::with_database(CallCenterConfig::default(), db.clone(), gateway.clone());
    for agent in ["alice", "bob", "carol", "dave"] {
        ready_agent(&engine, agent).await;
    }

    let mut tasks = JoinSet::new();
    for i in 0..20 {
        let engine = engine.clone();
        tasks.spawn(async move {
            engine
                .enqueue_inbound(InboundCall {
                    call_id: format!("file-call-{}", i),
                    caller_number: None,
                    priority: Some(10),
                })
                .await
                .map(|_| 0)
        });
    }
    for _ in 0..8 {
        let engine = engine.clone();
        tasks.spawn(async move { engine.tick(TickParams::default()).await.map(|r| r.inbound_assigned) });
    }
    let mut assigned = 0;
    while let Some(result) = tasks.join_next().await {
        assigned += result.unwrap().expect("no writer may fail with a busy database");
    }
    assigned += engine.tick(TickParams::default()).await.unwrap().inbound_assigned;

    assert_eq!(assigned, 4);
    assert_eq!(gateway.ring_count(), 4);
    let waiting = engine.waiting_calls().await.unwrap();
    assert_eq!(waiting.len(), 16);
    assert_eq!(waiting.iter().map(|e| e.position).collect::<Vec<_>>(), (1..=16u32).collect::<Vec<_>>());

    db.close().await;
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
    }
}

#[tokio::test]
async fn test_claimed_call_returns_to_queue_when_agent_lookup_fails() {
    let (engine, gateway) = create_test_call_center().await;
    inbound(&engine, "c-stuck", 10).await;
    // A session row whose status no longer decodes makes every agent lookup fail
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO agents (agent_id, display_name, status, session_id, logged_in_at, last_heartbeat)
         VALUES ('ghost', 'Ghost', 'SOMEWHERE_ELSE', 'ghost-session', ?, ?)",
    )
    .bind(now)
    .bind(now)
    .execute(engine.database().pool())
    .await
    .unwrap();

    assert!(engine.tick(TickParams::default()).await.is_err());
    let entry = engine.holding_queue().get("c-stuck").await.unwrap();
    assert_eq!(entry.status, HoldingStatus::Waiting);
    assert_eq!(entry.assigned_agent_id, None);

    sqlx::query("DELETE FROM agents WHERE agent_id = 'ghost'")
        .execute(engine.database().pool())
        .await
        .unwrap();
    ready_agent(&engine, "alice").await;
    let report = engine.tick(TickParams::default()).await.unwrap();
    assert_eq!(report.inbound_assigned, 1);
    assert_eq!(gateway.ring_count(), 1);
}

#[tokio::test]
async fn test_two_callbacks_for_one_subject_keep_a_single_entry() {
    let (engine, _gateway) = create_test_call_center().await;
    let db = engine.database();
    let schedule = |minutes_ago: i64, reason: &str| NewCallback {
        subject_id: "0300".to_string(),
        scheduled_for: Utc::now() - Duration::minutes(minutes_ago),
        reason: reason.to_string(),
        preferred_agent_id: None,
        origin_call_id: None,
    };
    let accepted = engine.schedule_callback(schedule(10, "asked for alice")).await.unwrap();
    engine.schedule_callback(schedule(5, "left a voicemail")).await.unwrap();

    ready_agent(&engine, "alice").await;
    engine.accept_callback(&accepted.callback_id, "alice").await.unwrap();

    for _ in 0..3 {
        let report = engine.inject_callbacks().await.unwrap();
        assert_eq!(report.overdue, 2);
        assert_eq!(report.injected, 0);
        assert_eq!(report.covered, 1);
        assert_eq!(report.errors, 0);

        let live = db.live_entries("0300").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].priority, engine.config().callbacks.accepted_priority);
        assert_eq!(live[0].callback_id.as_deref(), Some(accepted.callback_id.as_str()));
    }

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_entries WHERE subject_id = '0300'")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(rows, 1, "callbacks kept replacing each other's entry");
    assert_no_duplicate_live_entries(&engine).await;
}

#[tokio::test]
async fn test_outbound_ring_failure_moves_to_next_agent() {
    let (engine, gateway) = create_test_call_center().await;
    let db = engine.database();
    db.upsert_subject(&subject("0200", false)).await.unwrap();
    engine.reconcile(ReconcileParams::default()).await.unwrap();
    ready_agent(&engine, "alice").await;
    ready_agent(&engine, "bob").await;
    gateway.fail_agent("alice");

    let report = engine.tick(TickParams::default()).await.unwrap();
    assert_eq!(report.ring_failures, 1);
    assert_eq!(report.outbound_assigned, 1);
    let rings = gateway.rings();
    assert_eq!(rings.len(), 1);
    assert_eq!(rings[0].0, "bob");

    let entry = db.get_queue_entry(rings[0].1.id()).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Assigned);
    assert_eq!(entry.assigned_agent_id.as_deref(), Some("bob"));
    assert_eq!(entry.failed_agents, vec!["alice".to_string()]);
    assert_eq!(engine.agent("alice").await.unwrap().current_calls, 0);
}
