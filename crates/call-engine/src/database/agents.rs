//! Agent availability projection
//!
//! Readiness is never stored here: it is derived by
//! [`ReadinessValidator`](crate::agent::ReadinessValidator) from these rows. The
//! only counters the engine owns are `current_calls` and the status flip between
//! `AVAILABLE` and `ON_CALL` that follows them.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info};

use super::{decode_enum, DatabaseManager};
use crate::error::Result;

string_enum! {
    pub enum AgentStatus {
        Available => "AVAILABLE",
        OnCall => "ON_CALL",
        Break => "BREAK",
        Offline => "OFFLINE",
    }
}

/// Agent record from database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbAgent {
    pub agent_id: String,
    pub display_name: String,
    pub active: bool,
    pub status: AgentStatus,
    pub session_id: Option<String>,
    pub logged_in_at: Option<DateTime<Utc>>,
    pub logged_out_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub device_connected: bool,
    pub max_concurrent_calls: u32,
    pub current_calls: u32,
    pub available_since: Option<DateTime<Utc>>,
}

impl DbAgent {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            agent_id: row.try_get("agent_id")?,
            display_name: row.try_get("display_name")?,
            active: row.try_get("active")?,
            status: decode_enum(row, "status")?,
            session_id: row.try_get("session_id")?,
            logged_in_at: row.try_get("logged_in_at")?,
            logged_out_at: row.try_get("logged_out_at")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            last_activity_at: row.try_get("last_activity_at")?,
            device_connected: row.try_get("device_connected")?,
            max_concurrent_calls: row.try_get::<i64, _>("max_concurrent_calls")?.max(0) as u32,
            current_calls: row.try_get::<i64, _>("current_calls")?.max(0) as u32,
            available_since: row.try_get("available_since")?,
        })
    }

    /// A session exists and has not been closed
    pub fn has_session(&self) -> bool {
        self.session_id.is_some() && self.logged_out_at.is_none()
    }

    pub fn has_capacity(&self) -> bool {
        self.current_calls < self.max_concurrent_calls
    }
}

/// Take one call slot on an available agent. Flips the agent to `ON_CALL` once
/// the last slot is taken.
pub(crate) async fn reserve_agent_slot(conn: &mut SqliteConnection, agent_id: &str, now: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE agents
         SET current_calls = current_calls + 1,
             status = CASE WHEN current_calls + 1 >= max_concurrent_calls THEN 'ON_CALL' ELSE status END,
             available_since = CASE WHEN current_calls + 1 >= max_concurrent_calls THEN NULL ELSE available_since END,
             last_activity_at = ?
         WHERE agent_id = ?
           AND active = 1
           AND status = 'AVAILABLE'
           AND session_id IS NOT NULL
           AND current_calls < max_concurrent_calls",
    )
    .bind(now)
    .bind(agent_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Give back one call slot. An `ON_CALL` agent with a free slot again returns
/// to `AVAILABLE`; `BREAK` and `OFFLINE` are left alone.
pub(crate) async fn release_agent_slot(conn: &mut SqliteConnection, agent_id: &str, now: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE agents
         SET current_calls = current_calls - 1,
             status = CASE WHEN status = 'ON_CALL' THEN 'AVAILABLE' ELSE status END,
             available_since = CASE WHEN status = 'ON_CALL' THEN ? ELSE available_since END,
             last_activity_at = ?
         WHERE agent_id = ? AND current_calls > 0",
    )
    .bind(now)
    .bind(now)
    .bind(agent_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

impl DatabaseManager {
    /// Create or update an agent record. New agents start `OFFLINE`.
    pub async fn register_agent(&self, agent_id: &str, display_name: &str, max_concurrent_calls: u32) -> Result<()> {
        sqlx::query(
            "INSERT INTO agents (agent_id, display_name, active, status, max_concurrent_calls)
             VALUES (?, ?, 1, 'OFFLINE', ?)
             ON CONFLICT(agent_id) DO UPDATE SET
                 display_name = excluded.display_name,
                 max_concurrent_calls = excluded.max_concurrent_calls,
                 active = 1",
        )
        .bind(agent_id)
        .bind(display_name)
        .bind(max_concurrent_calls.max(1) as i64)
        .execute(&self.pool)
        .await?;
        info!("👤 Registered agent {} ({})", agent_id, display_name);
        Ok(())
    }

    pub async fn set_agent_active(&self, agent_id: &str, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE agents SET active = ? WHERE agent_id = ?")
            .bind(active)
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<DbAgent>> {
        let row = sqlx::query("SELECT * FROM agents WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(DbAgent::from_row).transpose()
    }

    pub async fn list_agents(&self) -> Result<Vec<DbAgent>> {
        let rows = sqlx::query("SELECT * FROM agents ORDER BY agent_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(DbAgent::from_row).collect()
    }

    /// Agents holding an open session, the candidate pool for readiness checks
    pub async fn agents_with_session(&self) -> Result<Vec<DbAgent>> {
        let rows = sqlx::query(
            "SELECT * FROM agents WHERE session_id IS NOT NULL AND logged_out_at IS NULL ORDER BY agent_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(DbAgent::from_row).collect()
    }

    /// Open a session. The agent becomes `AVAILABLE` with a fresh heartbeat.
    pub async fn login_agent(
        &self,
        agent_id: &str,
        session_id: &str,
        device_connected: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE agents
             SET status = 'AVAILABLE', session_id = ?, logged_in_at = ?, logged_out_at = NULL,
                 last_heartbeat = ?, last_activity_at = ?, device_connected = ?, current_calls = 0,
                 available_since = ?
             WHERE agent_id = ? AND active = 1",
        )
        .bind(session_id)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(device_connected)
        .bind(now)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn logout_agent(&self, agent_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE agents
             SET status = 'OFFLINE', session_id = NULL, logged_out_at = ?, device_connected = 0,
                 available_since = NULL
             WHERE agent_id = ? AND session_id IS NOT NULL",
        )
        .bind(now)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Refresh the heartbeat of a logged-in agent, optionally updating device state
    pub async fn record_heartbeat(
        &self,
        agent_id: &str,
        device_connected: Option<bool>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE agents
             SET last_heartbeat = ?, device_connected = COALESCE(?, device_connected)
             WHERE agent_id = ? AND session_id IS NOT NULL",
        )
        .bind(now)
        .bind(device_connected)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Operator-driven status change for a logged-in agent
    pub async fn set_agent_status(&self, agent_id: &str, status: AgentStatus, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE agents
             SET status = ?,
                 available_since = CASE WHEN ? = 'AVAILABLE' THEN ? ELSE NULL END,
                 last_activity_at = ?
             WHERE agent_id = ? AND session_id IS NOT NULL",
        )
        .bind(status.as_str())
        .bind(status.as_str())
        .bind(now)
        .bind(now)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        debug!("Agent {} status -> {} (applied: {})", agent_id, status, result.rows_affected() > 0);
        Ok(result.rows_affected() > 0)
    }

    pub async fn release_agent(&self, agent_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        release_agent_slot(&mut conn, agent_id, now).await
    }

    /// Heartbeat-only liveness, independent of status and device state
    pub async fn heartbeat_alive_agent_ids(&self, cutoff: DateTime<Utc>) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT agent_id FROM agents
             WHERE session_id IS NOT NULL AND logged_out_at IS NULL AND last_heartbeat >= ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    /// Log out every agent whose heartbeat is older than `cutoff`. Returns the
    /// agents that were swept.
    pub async fn sweep_expired_heartbeats(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut tx = self.begin_write().await?;

        let expired: Vec<String> = sqlx::query_scalar(
            "SELECT agent_id FROM agents
             WHERE session_id IS NOT NULL AND (last_heartbeat IS NULL OR last_heartbeat < ?)
             ORDER BY agent_id",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut swept = Vec::with_capacity(expired.len());
        for agent_id in expired {
            let result = sqlx::query(
                "UPDATE agents
                 SET status = 'OFFLINE', session_id = NULL, logged_out_at = ?, device_connected = 0,
                     available_since = NULL
                 WHERE agent_id = ? AND session_id IS NOT NULL AND (last_heartbeat IS NULL OR last_heartbeat < ?)",
            )
            .bind(now)
            .bind(&agent_id)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() > 0 {
                swept.push(agent_id);
            }
        }

        tx.commit().await?;
        Ok(swept)
    }

    pub async fn agent_status_counts(&self) -> Result<Vec<(AgentStatus, u64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM agents WHERE active = 1 GROUP BY status ORDER BY status")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok((decode_enum(row, "status")?, row.try_get::<i64, _>("n")?.max(0) as u64)))
            .collect()
    }
}
