//! Cooldown-gated remediation: pressure in, skill execution or escalation out.
//!
//! The engine drains one subscription sequentially, so a signal type can
//! never be mid-dispatch twice: the cooldown ledger is marked before any
//! skill runs and only this loop writes it. Skill failures, timeouts,
//! declined approvals, and flat outcomes all stay inside the dispatch — the
//! only thing that leaves the engine is an escalation envelope at boosted
//! intensity and an extended cooldown for the signal.

use crate::bus::{BusHandle, LivenessTracker, SignalBus, Subscription};
use crate::envelope::{
    SignalEnvelope, SIG_APPROVAL_ACK, SIG_APPROVAL_REQUEST, SIG_BUS_HEARTBEAT, SIG_ESCALATION,
    SIG_POOL_STATE,
};
use crate::error::MeshError;
use crate::monitor::{VitalsSample, VitalsStation};
use crate::registry::{SkillCatalog, SkillContext, SkillStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Source id stamped on approval requests and escalations.
pub const REMEDIATION_SOURCE: &str = "remediation";

// A metric must drop by at least this many points to count as improved.
const IMPROVEMENT_MARGIN_PCT: f32 = 0.5;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationConfig {
    /// Minimum intensity that triggers dispatch.
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Cooldown window per signal type after a trigger, seconds.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Extended cooldown set after a failed remediation, seconds.
    #[serde(default = "default_failure_cooldown_secs")]
    pub failure_cooldown_secs: u64,
    /// How long to wait for an operator ack before treating a request as
    /// declined, seconds.
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
    /// Hard timeout on one skill execution, seconds.
    #[serde(default = "default_skill_timeout_secs")]
    pub skill_timeout_secs: u64,
    /// Settling time between execution and the after-vitals check, seconds.
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
}

fn default_threshold() -> f32 {
    2.0
}
fn default_cooldown_secs() -> u64 {
    300
}
fn default_failure_cooldown_secs() -> u64 {
    900
}
fn default_approval_timeout_secs() -> u64 {
    30
}
fn default_skill_timeout_secs() -> u64 {
    60
}
fn default_settle_secs() -> u64 {
    5
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            cooldown_secs: default_cooldown_secs(),
            failure_cooldown_secs: default_failure_cooldown_secs(),
            approval_timeout_secs: default_approval_timeout_secs(),
            skill_timeout_secs: default_skill_timeout_secs(),
            settle_secs: default_settle_secs(),
        }
    }
}

impl RemediationConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.failure_cooldown_secs)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    pub fn skill_timeout(&self) -> Duration {
        Duration::from_secs(self.skill_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn sanitized(mut self) -> Self {
        self.threshold = self.threshold.clamp(0.0, 5.0);
        self.cooldown_secs = self.cooldown_secs.max(1);
        self.failure_cooldown_secs = self.failure_cooldown_secs.max(self.cooldown_secs);
        self.approval_timeout_secs = self.approval_timeout_secs.max(1);
        self.skill_timeout_secs = self.skill_timeout_secs.max(1);
        self
    }
}

// ---------------------------------------------------------------------------
// Cooldown ledger
// ---------------------------------------------------------------------------

struct CooldownEntry {
    last_trigger: Instant,
    window: Duration,
}

/// Per-signal cooldown state, created lazily on first trigger and never
/// deleted; cardinality is bounded by the set of signal names.
struct CooldownLedger {
    entries: HashMap<String, CooldownEntry>,
}

impl CooldownLedger {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Remaining cooldown for `signal`, if it is still cooling.
    fn remaining(&self, signal: &str) -> Option<Duration> {
        self.entries
            .get(signal)
            .and_then(|entry| entry.window.checked_sub(entry.last_trigger.elapsed()))
            .filter(|remaining| !remaining.is_zero())
    }

    fn mark(&mut self, signal: &str, window: Duration) {
        self.entries.insert(
            signal.to_string(),
            CooldownEntry {
                last_trigger: Instant::now(),
                window,
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

enum DispatchOutcome {
    /// A skill ran and the triggering metric measurably dropped.
    Improved(String),
    /// Nothing bound and registered for this signal; nothing to run.
    NoCandidate,
}

struct DispatchFailure {
    skill_id: Option<String>,
    error: MeshError,
}

/// Subscribes to pressure signals and drives the select → approve → execute
/// → learn pipeline.
pub struct RemediationEngine {
    config: RemediationConfig,
    bus: BusHandle,
    station: Arc<VitalsStation>,
    store: Arc<SkillStore>,
    catalog: Arc<SkillCatalog>,
    liveness: LivenessTracker,
    cooldowns: CooldownLedger,
    last_pool_ceiling: Option<u64>,
    signals: Subscription,
    approvals: Subscription,
}

impl RemediationEngine {
    pub fn new(
        config: RemediationConfig,
        bus: &SignalBus,
        station: Arc<VitalsStation>,
        store: Arc<SkillStore>,
        catalog: Arc<SkillCatalog>,
    ) -> Self {
        Self {
            config: config.sanitized(),
            bus: bus.handle(REMEDIATION_SOURCE),
            liveness: LivenessTracker::new(bus.config().staleness_horizon()),
            cooldowns: CooldownLedger::new(),
            last_pool_ceiling: None,
            signals: bus.subscribe_many(&["*_pressure", SIG_BUS_HEARTBEAT, SIG_POOL_STATE]),
            approvals: bus.subscribe(SIG_APPROVAL_ACK),
            station,
            store,
            catalog,
        }
    }

    /// Spawns the dispatch loop. Ends on its own once the bus is gone.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&mut self) {
        info!(
            target: "vagus::remediation",
            threshold = self.config.threshold,
            skills = self.catalog.len(),
            "remediation engine listening"
        );
        while let Some(envelope) = self.signals.recv().await {
            self.liveness.observe(&envelope);
            match envelope.name.as_str() {
                SIG_BUS_HEARTBEAT => continue,
                SIG_POOL_STATE => {
                    if let Some(ceiling) = envelope.fact_u64("ceiling") {
                        self.last_pool_ceiling = Some(ceiling);
                    }
                    continue;
                }
                _ => {}
            }
            self.on_pressure(envelope).await;
        }
        debug!(target: "vagus::remediation", "signal channel closed; engine stopping");
    }

    /// Handles one pressure envelope. Nothing raises out of here: the worst
    /// case is an escalation envelope plus an extended cooldown.
    async fn on_pressure(&mut self, trigger: SignalEnvelope) {
        if trigger.intensity < self.config.threshold {
            debug!(
                target: "vagus::remediation",
                signal = %trigger.name,
                intensity = trigger.intensity,
                "below threshold; ignored"
            );
            return;
        }
        if let Some(remaining) = self.cooldowns.remaining(&trigger.name) {
            info!(
                target: "vagus::remediation",
                signal = %trigger.name,
                remaining_secs = remaining.as_secs(),
                "trigger throttled by cooldown"
            );
            return;
        }
        self.cooldowns.mark(&trigger.name, self.config.cooldown());

        match self.dispatch(&trigger).await {
            Ok(DispatchOutcome::Improved(skill_id)) => {
                info!(
                    target: "vagus::remediation",
                    signal = %trigger.name,
                    skill = %skill_id,
                    "remediation improved the signal"
                );
            }
            Ok(DispatchOutcome::NoCandidate) => {}
            Err(failure) => {
                warn!(
                    target: "vagus::remediation",
                    signal = %trigger.name,
                    skill = failure.skill_id.as_deref().unwrap_or("none"),
                    error = %failure.error,
                    "remediation failed; escalating"
                );
                self.escalate(&trigger, &failure);
                self.cooldowns.mark(&trigger.name, self.config.failure_cooldown());
            }
        }
    }

    /// One full remediation attempt for `trigger`.
    async fn dispatch(&mut self, trigger: &SignalEnvelope) -> Result<DispatchOutcome, DispatchFailure> {
        let candidates = self.store.candidates_for(&trigger.name).map_err(|error| {
            DispatchFailure {
                skill_id: None,
                error,
            }
        })?;
        let Some((record, skill)) = candidates
            .iter()
            .find_map(|record| self.catalog.get(&record.skill_id).map(|s| (record.clone(), s)))
        else {
            debug!(
                target: "vagus::remediation",
                signal = %trigger.name,
                "no registered skill bound to signal"
            );
            return Ok(DispatchOutcome::NoCandidate);
        };

        let before = self.station.sample_now().await;

        if !record.auto_safe {
            let approved = match self.request_approval(trigger, &record.skill_id).await {
                Ok(approved) => approved,
                Err(error) => {
                    self.note_outcome(&record.skill_id, false);
                    return Err(DispatchFailure {
                        skill_id: Some(record.skill_id.clone()),
                        error,
                    });
                }
            };
            if !approved {
                self.note_outcome(&record.skill_id, false);
                return Err(DispatchFailure {
                    skill_id: Some(record.skill_id.clone()),
                    error: MeshError::SkillExecution {
                        skill: record.skill_id.clone(),
                        reason: "operator declined".into(),
                    },
                });
            }
        }

        let ctx = SkillContext {
            bus: self.bus.clone(),
            trigger: trigger.clone(),
            last_pool_ceiling: self.last_pool_ceiling,
        };
        let value = match tokio::time::timeout(self.config.skill_timeout(), skill.execute(&ctx)).await
        {
            Err(_) => {
                self.note_outcome(&record.skill_id, false);
                return Err(DispatchFailure {
                    skill_id: Some(record.skill_id.clone()),
                    error: MeshError::SkillTimeout(record.skill_id.clone()),
                });
            }
            Ok(Err(skill_err)) => {
                self.note_outcome(&record.skill_id, false);
                return Err(DispatchFailure {
                    skill_id: Some(record.skill_id.clone()),
                    error: MeshError::SkillExecution {
                        skill: record.skill_id.clone(),
                        reason: skill_err.to_string(),
                    },
                });
            }
            Ok(Ok(value)) => value,
        };
        debug!(
            target: "vagus::remediation",
            skill = %record.skill_id,
            result = %value,
            "skill executed"
        );

        tokio::time::sleep(self.config.settle()).await;
        let after = self.station.sample_now().await;
        let improved = improved(trigger, before, after);
        self.note_outcome(&record.skill_id, improved);

        if improved {
            Ok(DispatchOutcome::Improved(record.skill_id.clone()))
        } else {
            Err(DispatchFailure {
                skill_id: Some(record.skill_id.clone()),
                error: MeshError::SkillExecution {
                    skill: record.skill_id.clone(),
                    reason: "no measurable improvement".into(),
                },
            })
        }
    }

    /// Publishes an approval request and waits, bounded, for the matching
    /// ack. Timeout and a closed channel both mean declined; unrelated acks
    /// inside the window are skipped.
    async fn request_approval(
        &mut self,
        trigger: &SignalEnvelope,
        skill_id: &str,
    ) -> Result<bool, MeshError> {
        if self.liveness.is_stale() {
            warn!(
                target: "vagus::remediation",
                skill = skill_id,
                "bus heartbeat silent; approval unlikely to arrive"
            );
        }
        let request_id = Uuid::new_v4().to_string();
        let request = self
            .bus
            .envelope(SIG_APPROVAL_REQUEST, trigger.intensity)
            .with_fact("request_id", request_id.clone())
            .with_fact("skill_id", skill_id)
            .with_fact("signal", trigger.name.clone())
            .with_fact("original_intensity", f64::from(trigger.intensity));
        self.bus.publish(request);
        info!(
            target: "vagus::remediation",
            skill = skill_id,
            request_id = %request_id,
            "approval requested"
        );

        let deadline = Instant::now() + self.config.approval_timeout();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(MeshError::ApprovalTimeout(skill_id.to_string()));
            }
            match self.approvals.recv_timeout(deadline - now).await {
                None => return Err(MeshError::ApprovalTimeout(skill_id.to_string())),
                Some(ack) => {
                    if ack.fact_str("request_id") == Some(request_id.as_str()) {
                        return Ok(ack.fact_bool("approved").unwrap_or(false));
                    }
                    debug!(target: "vagus::remediation", "unrelated approval ack skipped");
                }
            }
        }
    }

    fn note_outcome(&self, skill_id: &str, success: bool) {
        if let Err(err) = self.store.record_outcome(skill_id, success) {
            warn!(
                target: "vagus::remediation",
                skill = skill_id,
                error = %err,
                "failed to persist outcome"
            );
        }
    }

    /// Publishes the escalation envelope: original signal name, failed skill
    /// id when known, and the intensity boosted by 1.0 (clamped at 5.0).
    fn escalate(&self, trigger: &SignalEnvelope, failure: &DispatchFailure) {
        let intensity = (trigger.intensity + 1.0).min(5.0);
        let mut envelope = self
            .bus
            .envelope(SIG_ESCALATION, intensity)
            .with_fact("signal", trigger.name.clone())
            .with_fact("reason", failure.error.to_string())
            .with_fact("original_intensity", f64::from(trigger.intensity));
        if let Some(skill_id) = &failure.skill_id {
            envelope = envelope.with_fact("skill_id", skill_id.clone());
        }
        self.bus.publish(envelope);
    }
}

/// Outcome check: did the metric behind the triggering signal drop by at
/// least the improvement margin between the two samples?
fn improved(trigger: &SignalEnvelope, before: VitalsSample, after: VitalsSample) -> bool {
    before.metric_for(&trigger.name) - after.metric_for(&trigger.name) >= IMPROVEMENT_MARGIN_PCT
}
