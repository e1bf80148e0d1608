//! Throttle skill: asks the worker pool to lower its concurrency ceiling by
//! one via a `reduce_concurrency` directive. Relies on the last advertised
//! `pool_state` ceiling; falls back to a configured guess before one arrives.

use serde_json::json;
use tracing::info;
use vagus_core::{RemediationSkill, SkillContext, SkillError, SIG_REDUCE_CONCURRENCY};

const SKILL_ID: &str = "throttle_workers";
const DEFAULT_FALLBACK_CEILING: u64 = 8;

/// Publishes a one-step throttle directive. Auto-safe: the pool itself
/// enforces its floor, so the worst case is a rejected directive.
pub struct ThrottleWorkers {
    fallback_ceiling: u64,
}

impl ThrottleWorkers {
    pub fn new() -> Self {
        Self {
            fallback_ceiling: DEFAULT_FALLBACK_CEILING,
        }
    }

    /// Ceiling assumed when no `pool_state` envelope has been seen yet.
    pub fn with_fallback_ceiling(mut self, ceiling: u64) -> Self {
        self.fallback_ceiling = ceiling.max(2);
        self
    }
}

impl Default for ThrottleWorkers {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RemediationSkill for ThrottleWorkers {
    fn id(&self) -> &str {
        SKILL_ID
    }

    fn auto_safe(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &SkillContext) -> Result<serde_json::Value, SkillError> {
        let current = ctx.last_pool_ceiling.unwrap_or(self.fallback_ceiling);
        if current <= 1 {
            return Err(SkillError::Precondition(format!(
                "pool ceiling already at {current}; nothing left to throttle"
            )));
        }
        let requested = current - 1;

        let directive = ctx
            .bus
            .envelope(SIG_REDUCE_CONCURRENCY, ctx.trigger.intensity)
            .with_fact("requested_ceiling", requested)
            .with_fact("trigger_signal", ctx.trigger.name.clone());
        let delivered = ctx.bus.publish(directive);
        info!(
            target: "vagus::skills",
            skill = SKILL_ID,
            requested,
            delivered,
            "throttle directive published"
        );

        Ok(json!({
            "status": "ok",
            "skill": SKILL_ID,
            "requested_ceiling": requested,
            "delivered": delivered,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vagus_core::{BusConfig, SignalBus, SignalEnvelope, SIG_MEM_PRESSURE};

    fn ctx(bus: &SignalBus, last_pool_ceiling: Option<u64>) -> SkillContext {
        SkillContext {
            bus: bus.handle("test"),
            trigger: SignalEnvelope::new(SIG_MEM_PRESSURE, "test", 2.5),
            last_pool_ceiling,
        }
    }

    #[tokio::test]
    async fn publishes_one_step_reduction() {
        let bus = SignalBus::new(BusConfig::default());
        let mut sub = bus.subscribe(SIG_REDUCE_CONCURRENCY);
        let skill = ThrottleWorkers::new();

        let result = skill.execute(&ctx(&bus, Some(5))).await.unwrap();
        assert_eq!(result["requested_ceiling"], 4);

        let directive = sub.try_recv().expect("directive on the bus");
        assert_eq!(directive.fact_u64("requested_ceiling"), Some(4));
        assert_eq!(directive.fact_str("trigger_signal"), Some(SIG_MEM_PRESSURE));
    }

    #[tokio::test]
    async fn refuses_when_already_at_floor() {
        let bus = SignalBus::new(BusConfig::default());
        let skill = ThrottleWorkers::new();

        let err = skill.execute(&ctx(&bus, Some(1))).await.unwrap_err();
        assert!(matches!(err, SkillError::Precondition(_)));
    }

    #[tokio::test]
    async fn falls_back_before_first_pool_state() {
        let bus = SignalBus::new(BusConfig::default());
        let skill = ThrottleWorkers::new().with_fallback_ceiling(6);

        let result = skill.execute(&ctx(&bus, None)).await.unwrap();
        assert_eq!(result["requested_ceiling"], 5);
    }
}
