//! Mesh error taxonomy.
//!
//! Every variant is handled inside the component that produces it; the bus's
//! best-effort contract is the isolation boundary between daemons. Only
//! escalation envelopes carry failures outward, and those are deliberate,
//! typed signals rather than raised errors.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum MeshError {
    /// Publish or subscribe reached a broker that no longer exists. Logged by
    /// the caller and swallowed; signal traffic is telemetry, not
    /// transactions.
    #[error("bus unreachable: {0}")]
    BusUnreachable(String),

    /// Envelope id already seen inside the dedup window. Dropped before any
    /// subscriber channel.
    #[error("duplicate envelope {id} dropped inside dedup window")]
    DuplicateEnvelope { id: Uuid },

    /// Throttle directive that cannot lower anything: the request is at or
    /// above the current ceiling, or the ceiling already sits on the floor.
    #[error("ceiling change to {requested} rejected (current {current}, floor {floor})")]
    CeilingAtFloor {
        requested: usize,
        current: usize,
        floor: usize,
    },

    /// Remediation skill ran past its hard timeout. Recorded as a failed
    /// attempt and escalated.
    #[error("skill '{0}' timed out")]
    SkillTimeout(String),

    /// Remediation skill returned an error. Recorded as a failed attempt and
    /// escalated.
    #[error("skill '{skill}' failed: {reason}")]
    SkillExecution { skill: String, reason: String },

    /// No approval ack arrived inside the bounded wait. Treated as declined.
    #[error("approval request {0} timed out")]
    ApprovalTimeout(String),

    /// Intent id seen again inside the router's idempotency window. The
    /// repeat is a logged no-op; the intent is never executed twice.
    #[error("intent '{0}' already routed")]
    DoubleRoute(String),

    /// Skill registry persistence failure.
    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    /// Wire or record serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = MeshError::CeilingAtFloor {
            requested: 9,
            current: 4,
            floor: 1,
        };
        let text = err.to_string();
        assert!(text.contains('9') && text.contains('4') && text.contains('1'), "{text}");
    }

    #[test]
    fn store_errors_convert() {
        fn inner() -> Result<(), MeshError> {
            let bad: Result<serde_json::Value, _> = serde_json::from_str("{not json");
            bad?;
            Ok(())
        }
        assert!(matches!(inner(), Err(MeshError::Serialization(_))));
    }
}
