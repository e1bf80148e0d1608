//! Host vitals sampling and debounced pressure signals.
//!
//! The [`VitalsStation`] is the single `sysinfo` sampler for the process: the
//! monitor drives it on a timer and appends to the rolling history, while the
//! remediation engine re-samples on demand for before/after outcome checks.
//! Each metric maps to a [0,5] intensity through its own piecewise-linear
//! curve and passes an emission gate (tier change, or debounce elapsed)
//! before a pressure envelope goes out.

use crate::bus::BusHandle;
use crate::envelope::{
    now_epoch_ms, SignalEnvelope, SignalTier, SIG_CPU_PRESSURE, SIG_MEM_PRESSURE, SIG_SWAP_PRESSURE,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Source id stamped on every pressure envelope.
pub const MONITOR_SOURCE: &str = "resource-monitor";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between vitals samples.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Minimum seconds between re-emissions while a metric stays in the same
    /// tier. Tier changes always emit.
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    /// Rolling history length, samples.
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    #[serde(default = "default_cpu_warning_pct")]
    pub cpu_warning_pct: f32,
    #[serde(default = "default_cpu_critical_pct")]
    pub cpu_critical_pct: f32,
    #[serde(default = "default_mem_warning_pct")]
    pub mem_warning_pct: f32,
    #[serde(default = "default_mem_critical_pct")]
    pub mem_critical_pct: f32,
    #[serde(default = "default_swap_warning_pct")]
    pub swap_warning_pct: f32,
    #[serde(default = "default_swap_critical_pct")]
    pub swap_critical_pct: f32,
}

fn default_interval_secs() -> u64 {
    30
}
fn default_debounce_secs() -> u64 {
    120
}
fn default_history_len() -> usize {
    120
}
fn default_cpu_warning_pct() -> f32 {
    75.0
}
fn default_cpu_critical_pct() -> f32 {
    92.0
}
fn default_mem_warning_pct() -> f32 {
    80.0
}
fn default_mem_critical_pct() -> f32 {
    95.0
}
fn default_swap_warning_pct() -> f32 {
    40.0
}
fn default_swap_critical_pct() -> f32 {
    80.0
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            debounce_secs: default_debounce_secs(),
            history_len: default_history_len(),
            cpu_warning_pct: default_cpu_warning_pct(),
            cpu_critical_pct: default_cpu_critical_pct(),
            mem_warning_pct: default_mem_warning_pct(),
            mem_critical_pct: default_mem_critical_pct(),
            swap_warning_pct: default_swap_warning_pct(),
            swap_critical_pct: default_swap_critical_pct(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    /// Floors the timer values and forces each critical threshold above its
    /// warning threshold so every curve keeps a finite slope.
    pub fn sanitized(mut self) -> Self {
        self.interval_secs = self.interval_secs.max(1);
        self.history_len = self.history_len.max(8);
        let fix = |warning: f32, critical: f32| -> (f32, f32) {
            let w = warning.clamp(1.0, 99.0);
            (w, critical.max(w + 0.5).min(100.0))
        };
        (self.cpu_warning_pct, self.cpu_critical_pct) =
            fix(self.cpu_warning_pct, self.cpu_critical_pct);
        (self.mem_warning_pct, self.mem_critical_pct) =
            fix(self.mem_warning_pct, self.mem_critical_pct);
        (self.swap_warning_pct, self.swap_critical_pct) =
            fix(self.swap_warning_pct, self.swap_critical_pct);
        self
    }
}

// ---------------------------------------------------------------------------
// Intensity curve
// ---------------------------------------------------------------------------

/// Piecewise-linear map from a raw percentage to a [0,5] intensity, anchored
/// at the warning threshold (2.0) and the critical threshold (4.0). Above
/// critical the middle segment's slope continues until the 5.0 clamp.
#[derive(Debug, Clone, Copy)]
pub struct MetricCurve {
    warning_pct: f32,
    critical_pct: f32,
}

impl MetricCurve {
    /// `critical_pct` must exceed `warning_pct`; [`MonitorConfig::sanitized`]
    /// guarantees that for configured curves.
    pub fn new(warning_pct: f32, critical_pct: f32) -> Self {
        let warning_pct = warning_pct.max(0.5);
        Self {
            warning_pct,
            critical_pct: critical_pct.max(warning_pct + 0.5),
        }
    }

    pub fn intensity(&self, value_pct: f32) -> f32 {
        let v = value_pct.max(0.0);
        let raw = if v < self.warning_pct {
            2.0 * v / self.warning_pct
        } else {
            2.0 + 2.0 * (v - self.warning_pct) / (self.critical_pct - self.warning_pct)
        };
        raw.min(5.0)
    }
}

// ---------------------------------------------------------------------------
// Vitals station
// ---------------------------------------------------------------------------

/// One sampled reading of the host vitals, percentages in [0,100].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VitalsSample {
    pub cpu_pct: f32,
    pub mem_pct: f32,
    pub swap_pct: f32,
    pub timestamp_ms: i64,
}

impl VitalsSample {
    /// Reading for the metric behind a pressure signal name; the worst of the
    /// three for anything unrecognized.
    pub fn metric_for(&self, signal: &str) -> f32 {
        match signal {
            SIG_CPU_PRESSURE => self.cpu_pct,
            SIG_MEM_PRESSURE => self.mem_pct,
            SIG_SWAP_PRESSURE => self.swap_pct,
            _ => self.cpu_pct.max(self.mem_pct).max(self.swap_pct),
        }
    }
}

/// Shared `sysinfo` sampler plus the bounded rolling history.
///
/// Only the monitor appends to the history; [`VitalsStation::sample_now`]
/// leaves it untouched so on-demand checks do not skew the record.
pub struct VitalsStation {
    sys: RwLock<System>,
    history: RwLock<VecDeque<VitalsSample>>,
    history_len: usize,
}

impl VitalsStation {
    pub fn new(history_len: usize) -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        Self {
            sys: RwLock::new(sys),
            history: RwLock::new(VecDeque::with_capacity(history_len.max(8))),
            history_len: history_len.max(8),
        }
    }

    /// Refreshes CPU and memory counters and returns a fresh sample without
    /// touching the history.
    pub async fn sample_now(&self) -> VitalsSample {
        let mut sys = self.sys.write().await;
        sys.refresh_cpu();
        sys.refresh_memory();

        let pct = |used: u64, total: u64| -> f32 {
            if total == 0 {
                0.0
            } else {
                (used as f64 / total as f64 * 100.0) as f32
            }
        };
        VitalsSample {
            cpu_pct: sys.global_cpu_info().cpu_usage(),
            mem_pct: pct(sys.used_memory(), sys.total_memory()),
            swap_pct: pct(sys.used_swap(), sys.total_swap()),
            timestamp_ms: now_epoch_ms(),
        }
    }

    /// Samples and appends to the rolling history. Monitor use only.
    pub async fn record(&self) -> VitalsSample {
        let sample = self.sample_now().await;
        let mut history = self.history.write().await;
        if history.len() == self.history_len {
            history.pop_front();
        }
        history.push_back(sample);
        sample
    }

    pub async fn latest(&self) -> Option<VitalsSample> {
        self.history.read().await.back().copied()
    }

    /// Snapshot of the rolling history, oldest first.
    pub async fn history(&self) -> Vec<VitalsSample> {
        self.history.read().await.iter().copied().collect()
    }

    pub async fn history_len(&self) -> usize {
        self.history.read().await.len()
    }
}

// ---------------------------------------------------------------------------
// Emission gate
// ---------------------------------------------------------------------------

struct EmissionGate {
    last_tier: Option<SignalTier>,
    last_emit: Option<Instant>,
}

impl EmissionGate {
    fn new() -> Self {
        Self {
            last_tier: None,
            last_emit: None,
        }
    }

    /// Emit on the first reading, on any tier change, or once the debounce
    /// window has elapsed at an unchanged tier. Records the emission.
    fn should_emit(&mut self, tier: SignalTier, debounce: Duration) -> bool {
        let due = match (self.last_tier, self.last_emit) {
            (Some(prev), Some(at)) => tier != prev || at.elapsed() >= debounce,
            _ => true,
        };
        if due {
            self.last_tier = Some(tier);
            self.last_emit = Some(Instant::now());
        }
        due
    }
}

// ---------------------------------------------------------------------------
// Resource monitor
// ---------------------------------------------------------------------------

struct MetricLane {
    signal: &'static str,
    metric: &'static str,
    curve: MetricCurve,
    gate: EmissionGate,
}

/// Samples host vitals on a fixed interval and publishes debounced pressure
/// signals per metric.
pub struct ResourceMonitor {
    config: MonitorConfig,
    station: std::sync::Arc<VitalsStation>,
    bus: BusHandle,
    lanes: [MetricLane; 3],
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig, station: std::sync::Arc<VitalsStation>, bus: BusHandle) -> Self {
        let config = config.sanitized();
        let lanes = [
            MetricLane {
                signal: SIG_CPU_PRESSURE,
                metric: "cpu",
                curve: MetricCurve::new(config.cpu_warning_pct, config.cpu_critical_pct),
                gate: EmissionGate::new(),
            },
            MetricLane {
                signal: SIG_MEM_PRESSURE,
                metric: "mem",
                curve: MetricCurve::new(config.mem_warning_pct, config.mem_critical_pct),
                gate: EmissionGate::new(),
            },
            MetricLane {
                signal: SIG_SWAP_PRESSURE,
                metric: "swap",
                curve: MetricCurve::new(config.swap_warning_pct, config.swap_critical_pct),
                gate: EmissionGate::new(),
            },
        ];
        Self {
            config,
            station,
            bus,
            lanes,
        }
    }

    /// Runs the gates against one sample and returns the envelopes that pass.
    /// Split from the timer so the gate logic is testable with synthetic
    /// readings.
    fn evaluate(&mut self, sample: VitalsSample) -> Vec<SignalEnvelope> {
        let debounce = self.config.debounce();
        let source = self.bus.source().to_string();
        let mut out = Vec::new();
        for lane in &mut self.lanes {
            let value = sample.metric_for(lane.signal);
            let intensity = lane.curve.intensity(value);
            let tier = SignalTier::from_intensity(intensity);
            if lane.gate.should_emit(tier, debounce) {
                out.push(
                    SignalEnvelope::new(lane.signal, source.clone(), intensity)
                        .with_fact("metric", lane.metric)
                        .with_fact("value_pct", f64::from(value))
                        .with_fact("tier", tier.as_str()),
                );
            } else {
                debug!(
                    target: "vagus::monitor",
                    signal = lane.signal,
                    value_pct = value,
                    tier = tier.as_str(),
                    "emission suppressed inside debounce window"
                );
            }
        }
        out
    }

    /// One sampling pass: record a sample, run the gates, publish whatever
    /// passes.
    pub async fn tick(&mut self) {
        let sample = self.station.record().await;
        for envelope in self.evaluate(sample) {
            info!(
                target: "vagus::monitor",
                signal = %envelope.name,
                intensity = envelope.intensity,
                tier = envelope.tier().as_str(),
                "pressure signal emitted"
            );
            self.bus.publish(envelope);
        }
    }

    /// Spawns the sampling loop. Runs until the task is aborted.
    pub fn spawn(mut self) -> JoinHandle<()> {
        let period = self.config.interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.tick().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: f32, mem: f32, swap: f32) -> VitalsSample {
        VitalsSample {
            cpu_pct: cpu,
            mem_pct: mem,
            swap_pct: swap,
            timestamp_ms: now_epoch_ms(),
        }
    }

    #[test]
    fn curve_hits_the_anchor_points() {
        let curve = MetricCurve::new(80.0, 95.0);
        assert!(curve.intensity(0.0).abs() < f32::EPSILON);
        assert!((curve.intensity(40.0) - 1.0).abs() < 1e-4);
        assert!((curve.intensity(80.0) - 2.0).abs() < 1e-4);
        assert!((curve.intensity(95.0) - 4.0).abs() < 1e-4);
    }

    #[test]
    fn curve_continues_same_slope_above_critical_then_clamps() {
        let curve = MetricCurve::new(40.0, 80.0);
        // middle segment climbs 2.0 over 40 points; the same slope holds past
        // critical until the clamp
        let mid_step = curve.intensity(79.0) - curve.intensity(78.0);
        let above_step = curve.intensity(82.0) - curve.intensity(81.0);
        assert!((mid_step - above_step).abs() < 1e-3, "slope must continue past critical");
        assert!((curve.intensity(90.0) - 4.5).abs() < 1e-3);
        assert!((curve.intensity(100.0) - 5.0).abs() < 1e-3);
        assert!((curve.intensity(500.0) - 5.0).abs() < f32::EPSILON);
    }

    #[test]
    fn gate_emits_on_tier_change_and_debounces_within_tier() {
        let mut gate = EmissionGate::new();
        let long = Duration::from_secs(3600);
        assert!(gate.should_emit(SignalTier::Info, long), "first reading emits");
        assert!(!gate.should_emit(SignalTier::Info, long), "same tier inside window");
        assert!(gate.should_emit(SignalTier::Warning, long), "tier change emits");
        assert!(!gate.should_emit(SignalTier::Warning, long));
        assert!(gate.should_emit(SignalTier::Info, long), "tier change back emits");
    }

    #[test]
    fn gate_reemits_once_debounce_elapsed() {
        let mut gate = EmissionGate::new();
        let zero = Duration::from_millis(0);
        assert!(gate.should_emit(SignalTier::Elevated, zero));
        assert!(gate.should_emit(SignalTier::Elevated, zero), "zero debounce always re-emits");
    }

    #[test]
    fn evaluate_emits_per_metric_with_facts() {
        let bus = crate::bus::SignalBus::new(crate::bus::BusConfig::default());
        let station = std::sync::Arc::new(VitalsStation::new(16));
        let mut monitor = ResourceMonitor::new(
            MonitorConfig::default(),
            station,
            bus.handle(MONITOR_SOURCE),
        );

        // mem at the critical anchor, cpu and swap quiet
        let envelopes = monitor.evaluate(sample(10.0, 95.0, 0.0));
        assert_eq!(envelopes.len(), 3, "first pass emits every lane");
        let mem = envelopes
            .iter()
            .find(|e| e.name == SIG_MEM_PRESSURE)
            .expect("mem envelope");
        assert!((mem.intensity - 4.0).abs() < 1e-3);
        assert_eq!(mem.fact_str("metric"), Some("mem"));
        assert_eq!(mem.fact_str("tier"), Some("critical"));
        assert!((mem.fact_f64("value_pct").unwrap() - 95.0).abs() < 1e-3);

        // identical readings straight after: every lane is debounced
        let again = monitor.evaluate(sample(10.0, 95.0, 0.0));
        assert!(again.is_empty(), "unchanged tiers inside debounce stay quiet");

        // mem falls back to quiet: only that lane re-emits
        let relaxed = monitor.evaluate(sample(10.0, 20.0, 0.0));
        assert_eq!(relaxed.len(), 1);
        assert_eq!(relaxed[0].name, SIG_MEM_PRESSURE);
    }

    #[tokio::test]
    async fn station_history_is_bounded_and_ordered() {
        let station = VitalsStation::new(8);
        for _ in 0..12 {
            station.record().await;
        }
        assert_eq!(station.history_len().await, 8);
        let history = station.history().await;
        assert!(history.windows(2).all(|w| w[0].timestamp_ms <= w[1].timestamp_ms));
        assert!(station.latest().await.is_some());
    }

    #[tokio::test]
    async fn sample_now_leaves_history_untouched() {
        let station = VitalsStation::new(8);
        station.record().await;
        let before = station.history_len().await;
        station.sample_now().await;
        assert_eq!(station.history_len().await, before);
    }
}
