//! vagus-core: affective signal mesh (bus, vitals monitor, worker pool,
//! intent router, remediation engine).
//!
//! Everything add-ons need is re-exported flat so the daemon and skill
//! crates keep a consistent public API.

mod bus;
mod config;
mod envelope;
mod error;
mod monitor;
mod pool;
mod registry;
mod remediation;
mod router;

// Signal envelope + well-known signal names
pub use envelope::{
    now_epoch_ms, SignalEnvelope, SignalTier, ENVELOPE_SCHEMA_VERSION, SIG_APPROVAL_ACK,
    SIG_APPROVAL_REQUEST, SIG_BUS_HEARTBEAT, SIG_CPU_PRESSURE, SIG_ESCALATION, SIG_MEM_PRESSURE,
    SIG_POOL_STATE, SIG_REDUCE_CONCURRENCY, SIG_SWAP_PRESSURE,
};

// Bus (pub/sub fan-out, dedup, heartbeat, liveness)
pub use bus::{
    topic_matches, BusConfig, BusHandle, BusStats, LivenessTracker, ReplayGuard, SignalBus,
    Subscription, BUS_SOURCE,
};

// Configuration (file + VAGUS__ env overrides)
pub use config::MeshConfig;

// Errors
pub use error::MeshError;

// Resource monitor (vitals sampling, pressure curves, debounced emission)
pub use monitor::{
    MetricCurve, MonitorConfig, ResourceMonitor, VitalsSample, VitalsStation, MONITOR_SOURCE,
};

// Worker pool (bounded concurrency, deadlines, bus-driven throttling)
pub use pool::{
    PoolConfig, PoolSnapshot, TaskError, TaskState, WorkerPool, WorkerTask, POOL_SOURCE,
};

// Intent router (bus-first dispatch with legacy fallback)
pub use router::{IntentRouter, LegacyDispatch, RouteOutcome, RouterConfig, ROUTER_SOURCE};

// Skill registry (catalog, per-skill effectiveness records, signal bindings)
pub use registry::{
    RemediationSkill, SkillCatalog, SkillContext, SkillError, SkillRecord, SkillStore,
};

// Remediation engine (cooldowns, approval gate, outcome learning, escalation)
pub use remediation::{RemediationConfig, RemediationEngine, REMEDIATION_SOURCE};
