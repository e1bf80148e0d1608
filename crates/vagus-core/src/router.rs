//! Intent routing: bus publish or legacy dispatch, exactly once per intent id.
//!
//! The router is the migration seam between an older synchronous dispatch
//! surface and the signal mesh. A binding table maps intent types to signal
//! names; when bus routing is enabled a bound intent becomes a fire-and-forget
//! envelope, anything else falls through to the injected [`LegacyDispatch`].
//! A replay guard over intent ids makes the choice idempotent: a repeated id
//! executes on neither path.

use crate::bus::{BusHandle, ReplayGuard};
use crate::error::MeshError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Source id stamped on envelopes the router publishes.
pub const ROUTER_SOURCE: &str = "intent-router";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Prefer bus publishes for bound intent types
    /// (`VAGUS__ROUTER__BUS_ENABLED`).
    #[serde(default)]
    pub bus_enabled: bool,
    /// Sliding window inside which a repeated intent id is a no-op, seconds.
    #[serde(default = "default_idempotency_window_secs")]
    pub idempotency_window_secs: u64,
}

fn default_idempotency_window_secs() -> u64 {
    120
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            bus_enabled: false,
            idempotency_window_secs: default_idempotency_window_secs(),
        }
    }
}

impl RouterConfig {
    pub fn idempotency_window(&self) -> Duration {
        Duration::from_secs(self.idempotency_window_secs)
    }

    pub fn sanitized(mut self) -> Self {
        self.idempotency_window_secs = self.idempotency_window_secs.max(1);
        self
    }
}

// ---------------------------------------------------------------------------
// Legacy seam
// ---------------------------------------------------------------------------

/// The synchronous dispatch surface the mesh is migrating away from. Injected
/// so tests and embedding daemons supply their own.
#[async_trait]
pub trait LegacyDispatch: Send + Sync {
    async fn dispatch(
        &self,
        intent_type: &str,
        payload: Option<Value>,
    ) -> Result<Value, Box<dyn std::error::Error + Send + Sync>>;
}

/// What happened to a routed intent.
#[derive(Debug)]
pub enum RouteOutcome {
    /// Bound intent published as an envelope; fire-and-forget.
    Published { signal: String, delivered: usize },
    /// Legacy dispatch ran to completion; its value is carried here.
    Dispatched(Value),
    /// Repeat intent id inside the idempotency window; nothing executed.
    Duplicate,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct IntentRouter {
    config: RouterConfig,
    bindings: HashMap<String, String>,
    guard: ReplayGuard<String>,
    bus: BusHandle,
    legacy: Arc<dyn LegacyDispatch>,
}

impl IntentRouter {
    pub fn new(config: RouterConfig, bus: BusHandle, legacy: Arc<dyn LegacyDispatch>) -> Self {
        let config = config.sanitized();
        let guard = ReplayGuard::new(config.idempotency_window());
        Self {
            config,
            bindings: HashMap::new(),
            guard,
            bus,
            legacy,
        }
    }

    /// Binds an intent type to the signal name published for it while bus
    /// routing is enabled.
    pub fn with_binding(
        mut self,
        intent_type: impl Into<String>,
        signal: impl Into<String>,
    ) -> Self {
        self.bindings.insert(intent_type.into(), signal.into());
        self
    }

    pub fn bus_enabled(&self) -> bool {
        self.config.bus_enabled
    }

    /// Routes one intent. Exactly one effective execution per `intent_id`:
    /// the replay guard is consulted before either path, so a repeat is a
    /// logged no-op even if the first occurrence took the other path.
    pub async fn route(
        &self,
        intent_id: &str,
        intent_type: &str,
        payload: Option<Value>,
    ) -> Result<RouteOutcome, Box<dyn std::error::Error + Send + Sync>> {
        if !self.guard.first_sighting(intent_id.to_string()) {
            let err = MeshError::DoubleRoute(intent_id.to_string());
            warn!(
                target: "vagus::router",
                intent_id,
                intent_type,
                error = %err,
                "repeat intent suppressed"
            );
            return Ok(RouteOutcome::Duplicate);
        }

        if self.config.bus_enabled {
            if let Some(signal) = self.bindings.get(intent_type) {
                let intensity = payload
                    .as_ref()
                    .and_then(|p| p.get("intensity"))
                    .and_then(Value::as_f64)
                    .unwrap_or(1.0) as f32;
                let mut envelope = self
                    .bus
                    .envelope(signal.clone(), intensity)
                    .with_fact("intent_id", intent_id)
                    .with_fact("intent_type", intent_type);
                if let Some(Value::Object(map)) = payload {
                    for (key, value) in map {
                        envelope = envelope.with_fact(key, value);
                    }
                }
                let delivered = self.bus.publish(envelope);
                debug!(
                    target: "vagus::router",
                    intent_id,
                    signal = %signal,
                    delivered,
                    "intent routed to bus"
                );
                return Ok(RouteOutcome::Published {
                    signal: signal.clone(),
                    delivered,
                });
            }
        }

        let value = self.legacy.dispatch(intent_type, payload).await?;
        debug!(target: "vagus::router", intent_id, intent_type, "intent routed to legacy dispatch");
        Ok(RouteOutcome::Dispatched(value))
    }
}
