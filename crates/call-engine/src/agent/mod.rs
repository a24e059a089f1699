//! Agent readiness module
//!
//! This module derives whether an agent can take a call right now from the
//! agent availability rows, caches the verdict briefly, and sweeps agents whose
//! heartbeat has expired.

pub mod cache;
pub mod readiness;

pub use cache::ReadinessCache;
pub use readiness::{
    evaluate, rank_ready_agents, readiness_score, NotReadyReason, ReadinessCheck, ReadinessTier, ReadinessValidator, ReadyAgent,
    SharedReadinessValidator,
};
