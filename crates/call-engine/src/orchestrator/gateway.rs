//! Telephony boundary
//!
//! The engine never places or bridges calls itself. It asks a
//! [`TelephonyGateway`] to ring an agent and learns what happened through
//! [`TelephonyEvent`]s fed back into [`CallLifecycle`](super::CallLifecycle).

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

use crate::error::{CallCenterError, Result};
use crate::routing::CallOutcome;

/// The call an agent is being rung for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "snake_case")]
pub enum CallRef {
    /// A caller waiting in the holding queue
    Inbound { call_id: String },
    /// An outbound queue entry the agent should dial
    Outbound {
        entry_id: String,
        subject_id: String,
        phone_number: Option<String>,
    },
}

impl CallRef {
    pub fn id(&self) -> &str {
        match self {
            CallRef::Inbound { call_id } => call_id,
            CallRef::Outbound { entry_id, .. } => entry_id,
        }
    }

    pub fn is_inbound(&self) -> bool {
        matches!(self, CallRef::Inbound { .. })
    }
}

impl std::fmt::Display for CallRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallRef::Inbound { call_id } => write!(f, "inbound:{}", call_id),
            CallRef::Outbound { entry_id, subject_id, .. } => write!(f, "outbound:{}({})", entry_id, subject_id),
        }
    }
}

/// Asynchronous results reported by the telephony side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelephonyEvent {
    CallRinging {
        call: CallRef,
        agent_id: String,
    },
    CallConnected {
        call: CallRef,
        agent_id: String,
    },
    /// The call is over. `agent_id` is `None` when an inbound caller hung up
    /// before reaching anyone.
    CallEnded {
        call: CallRef,
        #[serde(default)]
        agent_id: Option<String>,
        #[serde(default)]
        outcome: Option<CallOutcome>,
        #[serde(default)]
        duration_secs: u32,
    },
    CallFailed {
        call: CallRef,
        #[serde(default)]
        agent_id: Option<String>,
        reason: String,
    },
}

impl TelephonyEvent {
    pub fn call(&self) -> &CallRef {
        match self {
            TelephonyEvent::CallRinging { call, .. }
            | TelephonyEvent::CallConnected { call, .. }
            | TelephonyEvent::CallEnded { call, .. }
            | TelephonyEvent::CallFailed { call, .. } => call,
        }
    }
}

#[async_trait]
pub trait TelephonyGateway: Send + Sync {
    /// Ask the telephony side to ring `agent_id` for `call`. Returning `Ok` means
    /// the request was accepted, not that the agent answered.
    async fn ring_agent(&self, agent_id: &str, call: &CallRef) -> Result<()>;
}

/// Gateway that only logs ring requests, optionally forwarding a `CallRinging`
/// event so the lifecycle sees activity.
#[derive(Debug, Default)]
pub struct LoggingGateway {
    events: Option<mpsc::UnboundedSender<TelephonyEvent>>,
}

impl LoggingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: mpsc::UnboundedSender<TelephonyEvent>) -> Self {
        Self { events: Some(events) }
    }
}

#[async_trait]
impl TelephonyGateway for LoggingGateway {
    async fn ring_agent(&self, agent_id: &str, call: &CallRef) -> Result<()> {
        info!("📳 Ringing agent {} for {}", agent_id, call);
        if let Some(events) = &self.events {
            events
                .send(TelephonyEvent::CallRinging {
                    call: call.clone(),
                    agent_id: agent_id.to_string(),
                })
                .map_err(|e| CallCenterError::orchestration(format!("event channel closed: {}", e)))?;
        }
        Ok(())
    }
}

/// Records ring requests in memory; agents listed in `failing` get an error
#[derive(Debug, Default)]
pub struct RecordingGateway {
    rings: Mutex<Vec<(String, CallRef)>>,
    failing: Mutex<Vec<String>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_agent(&self, agent_id: &str) {
        self.failing.lock().push(agent_id.to_string());
    }

    pub fn rings(&self) -> Vec<(String, CallRef)> {
        self.rings.lock().clone()
    }

    pub fn ring_count(&self) -> usize {
        self.rings.lock().len()
    }
}

#[async_trait]
impl TelephonyGateway for RecordingGateway {
    async fn ring_agent(&self, agent_id: &str, call: &CallRef) -> Result<()> {
        if self.failing.lock().iter().any(|a| a == agent_id) {
            return Err(CallCenterError::orchestration(format!("agent {} unreachable", agent_id)));
        }
        self.rings.lock().push((agent_id.to_string(), call.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = TelephonyEvent::CallEnded {
            call: CallRef::Inbound {
                call_id: "c-1".to_string(),
            },
            agent_id: Some("alice".to_string()),
            outcome: Some(CallOutcome::NoAnswer),
            duration_secs: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "call_ended");
        assert_eq!(json["call"]["direction"], "inbound");
        assert_eq!(json["outcome"], "NO_ANSWER");

        let hangup: TelephonyEvent = serde_json::from_str(
            r#"{"event":"call_ended","call":{"direction":"inbound","call_id":"c-2"}}"#,
        )
        .unwrap();
        assert_eq!(hangup.call().id(), "c-2");
    }

    #[tokio::test]
    async fn test_recording_gateway_fails_configured_agents() {
        let gateway = RecordingGateway::new();
        gateway.fail_agent("bob");
        let call = CallRef::Inbound {
            call_id: "c-1".to_string(),
        };

        gateway.ring_agent("alice", &call).await.unwrap();
        assert!(gateway.ring_agent("bob", &call).await.is_err());
        assert_eq!(gateway.rings(), vec![("alice".to_string(), call)]);
    }

    #[tokio::test]
    async fn test_logging_gateway_forwards_ringing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gateway = LoggingGateway::with_events(tx);
        let call = CallRef::Inbound {
            call_id: "c-9".to_string(),
        };
        gateway.ring_agent("alice", &call).await.unwrap();
        assert!(matches!(rx.recv().await, Some(TelephonyEvent::CallRinging { .. })));
    }
}
