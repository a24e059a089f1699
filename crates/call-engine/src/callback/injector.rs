use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::agent::{rank_ready_agents, ReadinessValidator};
use crate::config::CallbackConfig;
use crate::database::callbacks::InjectionEffect;
use crate::database::{CallbackStatus, DatabaseManager, DbCallback, NewCallback};
use crate::error::{CallCenterError, Result};

/// How a callback's target agent was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Routing {
    /// The agent who accepted the callback
    Accepted,
    /// The requested agent, who is ready
    Preferred,
    /// Best ready agent, because no preferred agent was ready
    Routed,
    /// No ready agent; the entry waits for whoever frees up first
    Unrouted,
}

#[derive(Debug, Clone, Serialize)]
pub struct InjectedCallback {
    pub callback_id: String,
    pub subject_id: String,
    pub overdue: bool,
    pub priority: i32,
    pub target_agent_id: Option<String>,
    pub routing: Routing,
    pub effect: InjectionEffect,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InjectionReport {
    pub upcoming: u32,
    pub overdue: u32,
    pub injected: u32,
    pub refreshed: u32,
    /// Callbacks whose subject already carries a more urgent callback entry
    pub covered: u32,
    pub skipped_assigned: u32,
    pub errors: u32,
    pub callbacks: Vec<InjectedCallback>,
}

/// Promotes scheduled callbacks into the outbound queue at override priority
pub struct CallbackInjector {
    db: DatabaseManager,
    readiness: Arc<ReadinessValidator>,
    config: CallbackConfig,
}

impl CallbackInjector {
    pub fn new(db: DatabaseManager, readiness: Arc<ReadinessValidator>, config: CallbackConfig) -> Self {
        Self { db, readiness, config }
    }

    pub fn config(&self) -> &CallbackConfig {
        &self.config
    }

    /// Inject callbacks coming up in the advance window, plus every overdue one.
    /// Overdue callbacks are picked up on every tick until accepted or completed.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<InjectionReport> {
        let mut report = InjectionReport::default();

        let window_start = now + Duration::seconds(self.config.advance_window_start_secs);
        let window_end = now + Duration::seconds(self.config.advance_window_end_secs);
        let upcoming = self.db.upcoming_callbacks(window_start, window_end).await?;
        let overdue = self.db.overdue_callbacks(now).await?;
        report.upcoming = upcoming.len() as u32;
        report.overdue = overdue.len() as u32;

        let due = upcoming
            .into_iter()
            .map(|cb| (cb, false))
            .chain(overdue.into_iter().map(|cb| (cb, true)));

        for (callback, is_overdue) in due {
            match self.inject_one(&callback, is_overdue, now).await {
                Ok(injected) => {
                    match injected.effect {
                        InjectionEffect::Created => report.injected += 1,
                        InjectionEffect::Refreshed | InjectionEffect::Adopted => report.refreshed += 1,
                        InjectionEffect::Covered => report.covered += 1,
                        InjectionEffect::SkippedAssigned => report.skipped_assigned += 1,
                    }
                    report.callbacks.push(injected);
                }
                Err(e) => {
                    warn!("⚠️ Failed to inject callback {}: {}", callback.callback_id, e);
                    report.errors += 1;
                }
            }
        }

        if report.injected > 0 || report.overdue > 0 {
            info!(
                "⏰ Callback tick: {} upcoming, {} overdue, {} injected, {} refreshed",
                report.upcoming, report.overdue, report.injected, report.refreshed
            );
        }
        Ok(report)
    }

    async fn inject_one(&self, callback: &DbCallback, overdue: bool, now: DateTime<Utc>) -> Result<InjectedCallback> {
        let (priority, target, routing) = if callback.status == CallbackStatus::Accepted {
            (self.config.accepted_priority, callback.accepted_by.clone(), Routing::Accepted)
        } else {
            let (target, routing) = self.route(callback).await?;
            (self.config.injected_priority, target, routing)
        };

        let effect = self.db.inject_callback(callback, priority, target.as_deref(), now).await?;
        debug!(
            "Callback {} (overdue {}) -> {:?} via {:?}",
            callback.callback_id, overdue, effect, routing
        );

        Ok(InjectedCallback {
            callback_id: callback.callback_id.clone(),
            subject_id: callback.subject_id.clone(),
            overdue,
            priority,
            target_agent_id: target,
            routing,
            effect,
        })
    }

    async fn route(&self, callback: &DbCallback) -> Result<(Option<String>, Routing)> {
        if let Some(preferred) = &callback.preferred_agent_id {
            if self.readiness.is_ready(preferred).await?.ready {
                return Ok((Some(preferred.clone()), Routing::Preferred));
            }
        }
        let best = rank_ready_agents(self.readiness.ready_agents().await?, &[])
            .into_iter()
            .next()
            .map(|a| a.agent.agent_id);
        Ok(match best {
            Some(agent_id) => (Some(agent_id), Routing::Routed),
            None => (None, Routing::Unrouted),
        })
    }

    pub async fn schedule(&self, request: NewCallback) -> Result<DbCallback> {
        if request.subject_id.trim().is_empty() {
            return Err(CallCenterError::invalid_input("subject_id must not be empty"));
        }
        if request.reason.trim().is_empty() {
            return Err(CallCenterError::invalid_input("reason must not be empty"));
        }
        let callback = self.db.insert_callback(&request, Utc::now()).await?;
        info!(
            "📅 Scheduled callback {} for subject {} at {}",
            callback.callback_id, callback.subject_id, callback.scheduled_for
        );
        Ok(callback)
    }

    /// PENDING → ACCEPTED for `agent_id`; the override entry tightens to the
    /// accepted priority
    pub async fn accept(&self, callback_id: &str, agent_id: &str) -> Result<DbCallback> {
        if self.db.get_agent(agent_id).await?.is_none() {
            return Err(CallCenterError::not_found(format!("agent {}", agent_id)));
        }
        match self
            .db
            .accept_callback(callback_id, agent_id, self.config.accepted_priority, Utc::now())
            .await?
        {
            Some(callback) => {
                info!("🤝 Callback {} accepted by agent {}", callback_id, agent_id);
                Ok(callback)
            }
            None => Err(CallCenterError::conflict(format!("callback {} is not pending", callback_id))),
        }
    }

    pub async fn complete(&self, callback_id: &str) -> Result<()> {
        let Some(callback) = self.db.get_callback(callback_id).await? else {
            return Err(CallCenterError::not_found(format!("callback {}", callback_id)));
        };
        if !self.db.complete_callback(callback_id, Utc::now()).await? {
            return Err(CallCenterError::conflict(format!(
                "callback {} is already {}",
                callback_id, callback.status
            )));
        }
        info!("✅ Callback {} completed", callback_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    async fn setup() -> (DatabaseManager, CallbackInjector) {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let readiness = Arc::new(ReadinessValidator::new(db.clone(), AgentConfig::default()));
        (db.clone(), CallbackInjector::new(db, readiness, CallbackConfig::default()))
    }

    fn request(subject: &str, at: DateTime<Utc>, preferred: Option<&str>) -> NewCallback {
        NewCallback {
            subject_id: subject.to_string(),
            scheduled_for: at,
            reason: "requested".to_string(),
            preferred_agent_id: preferred.map(str::to_string),
            origin_call_id: None,
        }
    }

    #[tokio::test]
    async fn test_window_selection() {
        let (_db, injector) = setup().await;
        let now = Utc::now();
        injector.schedule(request("in-window", now + Duration::minutes(5), None)).await.unwrap();
        injector.schedule(request("too-early", now + Duration::minutes(30), None)).await.unwrap();
        injector.schedule(request("overdue", now - Duration::minutes(1), None)).await.unwrap();

        let report = injector.tick(now).await.unwrap();
        assert_eq!(report.upcoming, 1);
        assert_eq!(report.overdue, 1);
        assert_eq!(report.injected, 2);
        assert!(report.callbacks.iter().all(|c| c.routing == Routing::Unrouted));
        assert!(report.callbacks.iter().all(|c| c.priority == -10_000));
    }

    #[tokio::test]
    async fn test_preferred_agent_when_ready() {
        let (db, injector) = setup().await;
        db.register_agent("alice", "Alice", 1).await.unwrap();
        db.register_agent("bob", "Bob", 1).await.unwrap();
        db.login_agent("bob", "s", true, Utc::now()).await.unwrap();

        let now = Utc::now();
        injector.schedule(request("s-1", now - Duration::minutes(1), Some("alice"))).await.unwrap();
        let report = injector.tick(now).await.unwrap();
        assert_eq!(report.callbacks[0].routing, Routing::Routed);
        assert_eq!(report.callbacks[0].target_agent_id.as_deref(), Some("bob"));

        db.login_agent("alice", "s", true, Utc::now()).await.unwrap();
        injector.readiness.cache().clear();
        let report = injector.tick(now).await.unwrap();
        assert_eq!(report.callbacks[0].routing, Routing::Preferred);
        assert_eq!(report.refreshed, 1);
    }

    #[tokio::test]
    async fn test_accept_and_complete_errors() {
        let (db, injector) = setup().await;
        db.register_agent("alice", "Alice", 1).await.unwrap();
        let callback = injector
            .schedule(request("s-1", Utc::now() + Duration::minutes(5), None))
            .await
            .unwrap();

        assert!(matches!(
            injector.accept(&callback.callback_id, "ghost").await,
            Err(CallCenterError::NotFound(_))
        ));
        injector.accept(&callback.callback_id, "alice").await.unwrap();
        assert!(matches!(
            injector.accept(&callback.callback_id, "alice").await,
            Err(CallCenterError::Conflict(_))
        ));

        injector.complete(&callback.callback_id).await.unwrap();
        assert!(matches!(
            injector.complete(&callback.callback_id).await,
            Err(CallCenterError::Conflict(_))
        ));
        assert!(matches!(injector.complete("nope").await, Err(CallCenterError::NotFound(_))));
        assert!(injector.schedule(request("", Utc::now(), None)).await.is_err());
    }
}
