//! Signal envelope: the immutable message unit flowing through the vagus bus.
//!
//! Wire shape (JSON): `{id, name, source, intensity, facts, schema_version,
//! timestamp_ms}`. Every daemon in the mesh — and every external collaborator
//! (voice pipeline, optimizer, dashboards) — couples to the rest of the
//! system only through this shape. Readers pick the `facts` keys they know
//! and ignore the rest; envelopes whose schema major exceeds
//! [`ENVELOPE_SCHEMA_VERSION`] are dropped at publish.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Supported envelope schema major version. Bump only on breaking changes to
/// the wire shape; `facts` additions are not breaking.
pub const ENVELOPE_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Signal name registry (wire contract)
// ---------------------------------------------------------------------------

/// Liveness beacon published by the bus itself. Facts: `interval_ms`.
pub const SIG_BUS_HEARTBEAT: &str = "bus_heartbeat";

/// CPU pressure from the resource monitor. Facts: `metric`, `value_pct`, `tier`.
pub const SIG_CPU_PRESSURE: &str = "cpu_pressure";

/// Memory pressure from the resource monitor. Facts: `metric`, `value_pct`, `tier`.
pub const SIG_MEM_PRESSURE: &str = "mem_pressure";

/// Swap pressure from the resource monitor. Facts: `metric`, `value_pct`, `tier`.
pub const SIG_SWAP_PRESSURE: &str = "swap_pressure";

/// Periodic worker-pool counter snapshot. Facts: `ceiling`, `in_flight`,
/// `queued`, `completed`, `failed`, `abandoned`.
pub const SIG_POOL_STATE: &str = "pool_state";

/// Throttle directive consumed by the worker pool.
/// Facts: `requested_ceiling` (integer).
pub const SIG_REDUCE_CONCURRENCY: &str = "reduce_concurrency";

/// Approval ask published before running a non-auto-safe skill.
/// Facts: `request_id`, `skill_id`, `signal`.
pub const SIG_APPROVAL_REQUEST: &str = "remediation_approval_request";

/// Approval answer from an external operator.
/// Facts: `request_id`, `approved` (bool).
pub const SIG_APPROVAL_ACK: &str = "remediation_approval_ack";

/// Failed or declined remediation, re-published at boosted intensity.
/// Facts: `signal`, `skill_id`, `reason`, `original_intensity`.
pub const SIG_ESCALATION: &str = "remediation_escalation";

/// Returns the current epoch time in milliseconds.
pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Severity tiers
// ---------------------------------------------------------------------------

/// Named severity band derived from a [0,5] intensity scalar.
///
/// The monitor's emission gate debounces within a tier and always emits on a
/// tier change, so tier boundaries are the mesh's notion of "newsworthy".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalTier {
    /// Informational, intensity below 1.0.
    Info,
    /// Elevated but pre-warning, [1.0, 2.0).
    Elevated,
    /// Warning band, [2.0, 4.0).
    Warning,
    /// Emergency band, 4.0 and above.
    Critical,
}

impl SignalTier {
    /// Maps an intensity scalar onto its tier. Values are clamped to [0,5]
    /// before banding, so out-of-range inputs still land in a tier.
    pub fn from_intensity(intensity: f32) -> Self {
        let v = intensity.clamp(0.0, 5.0);
        if v >= 4.0 {
            Self::Critical
        } else if v >= 2.0 {
            Self::Warning
        } else if v >= 1.0 {
            Self::Elevated
        } else {
            Self::Info
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Elevated => "elevated",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A single best-effort pub/sub message. Immutable once published: the bus
/// fans out clones, so no subscriber ever observes another's mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Unique per emission; the dedup key.
    pub id: Uuid,
    /// Signal topic, e.g. `mem_pressure` or `reduce_concurrency`.
    pub name: String,
    /// Identifier of the emitting component.
    pub source: String,
    /// Severity scalar in [0.0, 5.0]; informational (<1.0) through
    /// emergency (≥4.0).
    pub intensity: f32,
    /// Opaque key→value payload. Readers ignore unknown keys.
    #[serde(default)]
    pub facts: Value,
    /// Wire schema major version.
    pub schema_version: u32,
    /// Emission time, epoch milliseconds.
    pub timestamp_ms: i64,
}

impl SignalEnvelope {
    /// Creates an envelope with a fresh id, the current timestamp, and the
    /// supported schema version. Intensity is clamped to [0,5].
    pub fn new(name: impl Into<String>, source: impl Into<String>, intensity: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            source: source.into(),
            intensity: intensity.clamp(0.0, 5.0),
            facts: Value::Object(serde_json::Map::new()),
            schema_version: ENVELOPE_SCHEMA_VERSION,
            timestamp_ms: now_epoch_ms(),
        }
    }

    /// Attaches one fact. Non-object `facts` (possible after deserializing a
    /// foreign envelope) are replaced with a fresh object first.
    pub fn with_fact(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if !self.facts.is_object() {
            self.facts = Value::Object(serde_json::Map::new());
        }
        if let Some(map) = self.facts.as_object_mut() {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// String fact accessor; `None` when absent or a different type.
    pub fn fact_str(&self, key: &str) -> Option<&str> {
        self.facts.get(key).and_then(Value::as_str)
    }

    /// Float fact accessor; integers widen.
    pub fn fact_f64(&self, key: &str) -> Option<f64> {
        self.facts.get(key).and_then(Value::as_f64)
    }

    /// Unsigned integer fact accessor.
    pub fn fact_u64(&self, key: &str) -> Option<u64> {
        self.facts.get(key).and_then(Value::as_u64)
    }

    /// Bool fact accessor.
    pub fn fact_bool(&self, key: &str) -> Option<bool> {
        self.facts.get(key).and_then(Value::as_bool)
    }

    /// Severity tier for this envelope's intensity.
    pub fn tier(&self) -> SignalTier {
        SignalTier::from_intensity(self.intensity)
    }

    /// Whether this envelope's schema major is one we can interpret.
    pub fn schema_supported(&self) -> bool {
        self.schema_version <= ENVELOPE_SCHEMA_VERSION
    }

    /// Serializes to JSON bytes for the wire or a store.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Deserializes from JSON bytes. Unknown `facts` keys survive untouched.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}
