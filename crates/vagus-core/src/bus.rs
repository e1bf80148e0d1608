//! Process-local signal bus: best-effort pub/sub with replay dedup and a
//! liveness heartbeat.
//!
//! Fan-out is channel-based: every subscriber owns one bounded inbound
//! channel, and the broker delivers with a non-blocking `try_send`. A full
//! channel drops the envelope for that subscriber only, so a slow consumer
//! can never stall the publisher or its peers. Replayed envelope ids inside
//! the dedup window are dropped before any channel sees them.
//!
//! The broker also publishes its own [`SIG_BUS_HEARTBEAT`] beacon so
//! subscribers can detect a partitioned bus (no beacon within 3× the
//! heartbeat interval) and fall back to local decisions instead of stalling.

use crate::envelope::{now_epoch_ms, SignalEnvelope, SIG_BUS_HEARTBEAT};
use crate::error::MeshError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Source id the broker stamps on its own heartbeat envelopes.
pub const BUS_SOURCE: &str = "vagus-bus";

// How many guard operations between lazy sweeps of expired dedup entries.
const GUARD_SWEEP_EVERY: u64 = 512;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Heartbeat beacon period, milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Sliding window inside which a replayed envelope id is dropped, seconds.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    /// Per-subscriber inbound channel capacity.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}
fn default_dedup_window_secs() -> u64 {
    60
}
fn default_channel_capacity() -> usize {
    256
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            dedup_window_secs: default_dedup_window_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl BusConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    /// Silence past this horizon means the bus should be treated as
    /// partitioned (3× the heartbeat interval).
    pub fn staleness_horizon(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.saturating_mul(3))
    }

    /// Applies hard floors so a hostile environment cannot zero out the
    /// windows.
    pub fn sanitized(mut self) -> Self {
        self.heartbeat_interval_ms = self.heartbeat_interval_ms.max(50);
        self.dedup_window_secs = self.dedup_window_secs.max(1);
        self.channel_capacity = self.channel_capacity.max(8);
        self
    }
}

// ---------------------------------------------------------------------------
// Topic patterns
// ---------------------------------------------------------------------------

/// Returns true when `pattern` matches `name`. A pattern is an exact topic
/// string, or contains a single `*` matching any run of characters
/// (`*_pressure`, `pool_*`, bare `*`).
pub fn topic_matches(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == name,
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
    }
}

// ---------------------------------------------------------------------------
// Replay guard
// ---------------------------------------------------------------------------

/// At-most-once guard over recently seen keys inside a sliding window.
///
/// Used by the bus (envelope ids) and the router (intent ids). Expired
/// entries are swept lazily every [`GUARD_SWEEP_EVERY`] operations, keeping
/// the map bounded by recent traffic rather than total history.
pub struct ReplayGuard<K: Eq + Hash + Clone + 'static> {
    window: Duration,
    seen: DashMap<K, Instant>,
    ops: AtomicU64,
}

impl<K: Eq + Hash + Clone + 'static> ReplayGuard<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: DashMap::new(),
            ops: AtomicU64::new(0),
        }
    }

    /// Records `key` and reports whether this is its first sighting inside
    /// the window. A key seen again after the window expires counts as fresh.
    pub fn first_sighting(&self, key: K) -> bool {
        self.maybe_sweep();
        let now = Instant::now();
        match self.seen.entry(key) {
            Entry::Occupied(mut occupied) => {
                if now.duration_since(*occupied.get()) < self.window {
                    false
                } else {
                    occupied.insert(now);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn maybe_sweep(&self) {
        let ops = self.ops.fetch_add(1, Ordering::Relaxed);
        if ops % GUARD_SWEEP_EVERY == GUARD_SWEEP_EVERY - 1 {
            let window = self.window;
            self.seen.retain(|_, first_seen| first_seen.elapsed() < window);
        }
    }
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

/// Tracks the last heartbeat a subscriber has seen, shareable across tasks.
///
/// `touch()` stores the current epoch-ms with Release ordering; `is_stale()`
/// reads with Acquire, so a beacon observed on one task is visible to all.
#[derive(Clone)]
pub struct LivenessTracker {
    last_beat_ms: Arc<AtomicI64>,
    stale_after_ms: i64,
}

impl LivenessTracker {
    /// Seeds the tracker with "now" so a freshly started component does not
    /// report stale before the first beacon had a chance to arrive.
    pub fn new(stale_after: Duration) -> Self {
        Self {
            last_beat_ms: Arc::new(AtomicI64::new(now_epoch_ms())),
            stale_after_ms: stale_after.as_millis() as i64,
        }
    }

    pub fn touch(&self) {
        self.last_beat_ms.store(now_epoch_ms(), Ordering::Release);
    }

    /// Touches the tracker when the envelope is a bus heartbeat.
    pub fn observe(&self, envelope: &SignalEnvelope) {
        if envelope.name == SIG_BUS_HEARTBEAT {
            self.touch();
        }
    }

    /// Time since the last observed beacon.
    pub fn silence(&self) -> Duration {
        let last = self.last_beat_ms.load(Ordering::Acquire);
        Duration::from_millis(now_epoch_ms().saturating_sub(last).max(0) as u64)
    }

    /// True when beacon silence has crossed the staleness horizon and the
    /// bus should be treated as partitioned.
    pub fn is_stale(&self) -> bool {
        self.silence().as_millis() as i64 >= self.stale_after_ms
    }
}

// ---------------------------------------------------------------------------
// Broker internals
// ---------------------------------------------------------------------------

struct SubscriberSlot {
    id: u64,
    patterns: Vec<String>,
    tx: mpsc::Sender<SignalEnvelope>,
}

impl SubscriberSlot {
    fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| topic_matches(p, name))
    }
}

struct BusInner {
    config: BusConfig,
    subscribers: DashMap<u64, SubscriberSlot>,
    next_subscriber_id: AtomicU64,
    replay_guard: ReplayGuard<uuid::Uuid>,
    delivered: AtomicU64,
    dropped_full: AtomicU64,
    dropped_duplicate: AtomicU64,
    dropped_schema: AtomicU64,
}

impl BusInner {
    fn publish(&self, envelope: SignalEnvelope) -> Result<usize, MeshError> {
        if !envelope.schema_supported() {
            self.dropped_schema.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "vagus::bus",
                name = %envelope.name,
                schema_version = envelope.schema_version,
                "envelope schema major unsupported; dropped"
            );
            return Ok(0);
        }
        if !self.replay_guard.first_sighting(envelope.id) {
            self.dropped_duplicate.fetch_add(1, Ordering::Relaxed);
            debug!(
                target: "vagus::bus",
                id = %envelope.id,
                name = %envelope.name,
                "duplicate envelope dropped"
            );
            return Err(MeshError::DuplicateEnvelope { id: envelope.id });
        }
        Ok(self.fan_out(envelope))
    }

    fn fan_out(&self, envelope: SignalEnvelope) -> usize {
        let mut delivered = 0usize;
        let mut closed: Vec<u64> = Vec::new();
        for slot in self.subscribers.iter() {
            if !slot.matches(&envelope.name) {
                continue;
            }
            match slot.tx.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped_full.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        target: "vagus::bus",
                        subscriber = slot.id,
                        name = %envelope.name,
                        "subscriber channel full; envelope dropped for that subscriber"
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(slot.id),
            }
        }
        for id in closed {
            self.subscribers.remove(&id);
        }
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    fn register(self: &Arc<Self>, patterns: Vec<String>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(
            id,
            SubscriberSlot {
                id,
                patterns: patterns.clone(),
                tx,
            },
        );
        debug!(target: "vagus::bus", subscriber = id, ?patterns, "subscriber registered");
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(self),
        }
    }
}

/// Observability counters for the broker.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BusStats {
    pub subscribers: usize,
    pub delivered: u64,
    pub dropped_full: u64,
    pub dropped_duplicate: u64,
    pub dropped_schema: u64,
}

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// The process-local broker. Cheap to clone handles off; dropped last by the
/// daemon that owns the mesh.
pub struct SignalBus {
    inner: Arc<BusInner>,
}

impl SignalBus {
    pub fn new(config: BusConfig) -> Self {
        let config = config.sanitized();
        let dedup_window = config.dedup_window();
        Self {
            inner: Arc::new(BusInner {
                config,
                subscribers: DashMap::new(),
                next_subscriber_id: AtomicU64::new(1),
                replay_guard: ReplayGuard::new(dedup_window),
                delivered: AtomicU64::new(0),
                dropped_full: AtomicU64::new(0),
                dropped_duplicate: AtomicU64::new(0),
                dropped_schema: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// A publishing handle stamped with `source`. Handles hold a weak
    /// reference: once the broker is gone they report `BusUnreachable`
    /// internally and swallow it, per the best-effort contract.
    pub fn handle(&self, source: impl Into<String>) -> BusHandle {
        BusHandle {
            inner: Arc::downgrade(&self.inner),
            source: source.into(),
        }
    }

    /// Registers a subscriber for one topic pattern.
    pub fn subscribe(&self, pattern: &str) -> Subscription {
        self.inner.register(vec![pattern.to_string()])
    }

    /// Registers a subscriber whose single channel receives every topic
    /// matching any of `patterns`.
    pub fn subscribe_many(&self, patterns: &[&str]) -> Subscription {
        self.inner
            .register(patterns.iter().map(|p| p.to_string()).collect())
    }

    /// Broker-side publish. Component code should prefer a [`BusHandle`];
    /// this entry point returns the typed result for callers that want it.
    pub fn publish(&self, envelope: SignalEnvelope) -> Result<usize, MeshError> {
        self.inner.publish(envelope)
    }

    /// Spawns the heartbeat beacon loop. The loop ends on its own once the
    /// broker has been dropped.
    pub fn start_heartbeat(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let beat = SignalEnvelope::new(SIG_BUS_HEARTBEAT, BUS_SOURCE, 0.0)
                    .with_fact("interval_ms", period.as_millis() as u64);
                if let Err(err) = inner.publish(beat) {
                    debug!(target: "vagus::bus", error = %err, "heartbeat publish suppressed");
                }
            }
        })
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            subscribers: self.inner.subscribers.len(),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped_full: self.inner.dropped_full.load(Ordering::Relaxed),
            dropped_duplicate: self.inner.dropped_duplicate.load(Ordering::Relaxed),
            dropped_schema: self.inner.dropped_schema.load(Ordering::Relaxed),
        }
    }
}

/// Publisher handle owned by one component. Publishing never fails from the
/// caller's perspective: errors are logged and swallowed here, and the
/// number of actual deliveries is returned for observability.
#[derive(Clone)]
pub struct BusHandle {
    inner: Weak<BusInner>,
    source: String,
}

impl BusHandle {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Builds an envelope stamped with this handle's source.
    pub fn envelope(&self, name: impl Into<String>, intensity: f32) -> SignalEnvelope {
        SignalEnvelope::new(name, self.source.clone(), intensity)
    }

    /// Best-effort publish. Returns how many subscribers received the
    /// envelope; 0 covers "no matching subscriber", "duplicate", and "broker
    /// gone" alike, because the caller's own logic must not branch on
    /// delivery.
    pub fn publish(&self, envelope: SignalEnvelope) -> usize {
        let Some(inner) = self.inner.upgrade() else {
            let err = MeshError::BusUnreachable(format!("broker dropped (source {})", self.source));
            debug!(target: "vagus::bus", source = %self.source, error = %err, "publish suppressed");
            return 0;
        };
        match inner.publish(envelope) {
            Ok(delivered) => delivered,
            Err(err) => {
                debug!(target: "vagus::bus", source = %self.source, error = %err, "publish suppressed");
                0
            }
        }
    }
}

/// One subscriber's inbound channel plus its registration. Dropping the
/// subscription deregisters it from the broker.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<SignalEnvelope>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Awaits the next envelope. `None` once the broker is gone and the
    /// channel has drained.
    pub async fn recv(&mut self) -> Option<SignalEnvelope> {
        self.rx.recv().await
    }

    /// Bounded receive: `None` on timeout as well as on a closed, drained
    /// channel. No caller in the mesh blocks on the bus without a bound.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<SignalEnvelope> {
        tokio::time::timeout(timeout, self.rx.recv()).await.ok().flatten()
    }

    /// Non-blocking receive for synchronous drains.
    pub fn try_recv(&mut self) -> Option<SignalEnvelope> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.subscribers.remove(&self.id);
        }
    }
}
