//! Bounded worker pool with a runtime-adjustable concurrency ceiling.
//!
//! Admission is an atomic compare-and-admit against the live ceiling, so
//! `in_flight` can never exceed the ceiling that was in effect at admission
//! time, no matter how many tasks submit concurrently. Lowering the ceiling
//! (locally or via a `reduce_concurrency` directive) affects only future
//! admissions; running tasks drain naturally.
//!
//! A task that outlives its deadline is marked ABANDONED and its admission
//! slot is reclaimed, but the underlying future is detached rather than
//! interrupted and may keep consuming resources until it finishes on its own.
//! A cancellation token would close that gap; the mesh currently accepts it.

use crate::bus::{BusHandle, LivenessTracker, SignalBus, Subscription};
use crate::envelope::{now_epoch_ms, SIG_POOL_STATE, SIG_REDUCE_CONCURRENCY};
use crate::error::MeshError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Source id stamped on `pool_state` envelopes.
pub const POOL_SOURCE: &str = "worker-pool";

// Terminal task entries stay visible this long before the sweep drops them.
const TERMINAL_RETENTION: Duration = Duration::from_secs(300);

/// Boxed error type carried by failed worker tasks.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

type TaskFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send + 'static>>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Concurrency ceiling at startup.
    #[serde(default = "default_initial_ceiling")]
    pub initial_ceiling: usize,
    /// Throttle directives may not push the ceiling below this.
    #[serde(default = "default_floor")]
    pub floor: usize,
    /// Default per-task deadline, seconds.
    #[serde(default = "default_task_deadline_secs")]
    pub task_deadline_secs: u64,
    /// Period of the `pool_state` snapshot envelope, seconds.
    #[serde(default = "default_state_publish_secs")]
    pub state_publish_secs: u64,
}

fn default_initial_ceiling() -> usize {
    8
}
fn default_floor() -> usize {
    1
}
fn default_task_deadline_secs() -> u64 {
    120
}
fn default_state_publish_secs() -> u64 {
    15
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_ceiling: default_initial_ceiling(),
            floor: default_floor(),
            task_deadline_secs: default_task_deadline_secs(),
            state_publish_secs: default_state_publish_secs(),
        }
    }
}

impl PoolConfig {
    pub fn task_deadline(&self) -> Duration {
        Duration::from_secs(self.task_deadline_secs)
    }

    pub fn state_publish_interval(&self) -> Duration {
        Duration::from_secs(self.state_publish_secs)
    }

    pub fn sanitized(mut self) -> Self {
        self.floor = self.floor.max(1);
        self.initial_ceiling = self.initial_ceiling.max(self.floor);
        self.task_deadline_secs = self.task_deadline_secs.max(1);
        self.state_publish_secs = self.state_publish_secs.max(1);
        self
    }
}

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// QUEUED → RUNNING → {DONE, FAILED}; RUNNING past its deadline ⇒ ABANDONED.
/// A task leaves RUNNING exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Done,
    Failed,
    Abandoned,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Abandoned)
    }
}

/// Public view of one tracked task.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerTask {
    pub id: Uuid,
    pub label: String,
    pub enqueued_ms: i64,
    pub state: TaskState,
}

struct TaskEntry {
    label: String,
    enqueued_ms: i64,
    state: TaskState,
    finished_at: Option<Instant>,
}

struct PendingTask {
    id: Uuid,
    deadline: Duration,
    future: TaskFuture,
}

/// Live counter snapshot, also the payload of the `pool_state` envelope.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolSnapshot {
    pub ceiling: usize,
    pub in_flight: usize,
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
    pub abandoned: u64,
}

// ---------------------------------------------------------------------------
// Pool internals
// ---------------------------------------------------------------------------

struct PoolInner {
    config: PoolConfig,
    ceiling: AtomicUsize,
    in_flight: AtomicUsize,
    queued: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    tasks: DashMap<Uuid, TaskEntry>,
    pending: Mutex<VecDeque<PendingTask>>,
    bus: BusHandle,
    liveness: LivenessTracker,
}

impl PoolInner {
    /// Atomic compare-and-admit: increments `in_flight` only while it is
    /// under the ceiling read in the same retry loop.
    fn try_admit(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let ceiling = self.ceiling.load(Ordering::Acquire);
                (current < ceiling).then_some(current + 1)
            })
            .is_ok()
    }

    fn release_slot(self: &Arc<Self>) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.drain_pending();
    }

    /// Lowers the ceiling. Requests at/above the current ceiling or below the
    /// floor are rejected so a repeated directive can never ratchet past the
    /// floor or accidentally raise capacity.
    fn reduce_ceiling(&self, requested: usize) -> Result<usize, MeshError> {
        let floor = self.config.floor;
        self.ceiling
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (requested >= floor && requested < current).then_some(requested)
            })
            .map(|_| requested)
            .map_err(|current| MeshError::CeilingAtFloor {
                requested,
                current,
                floor,
            })
    }

    /// Moves queued work into admission slots until capacity or the queue
    /// runs out.
    fn drain_pending(self: &Arc<Self>) {
        loop {
            if !self.try_admit() {
                break;
            }
            let next = self.pending.lock().unwrap().pop_front();
            match next {
                Some(task) => self.launch(task),
                None => {
                    // admitted a slot with nothing queued behind it
                    self.in_flight.fetch_sub(1, Ordering::AcqRel);
                    break;
                }
            }
        }
    }

    fn launch(self: &Arc<Self>, task: PendingTask) {
        if let Some(mut entry) = self.tasks.get_mut(&task.id) {
            entry.state = TaskState::Running;
        }
        self.queued.fetch_sub(1, Ordering::AcqRel);

        let inner = Arc::clone(self);
        let PendingTask { id, deadline, future } = task;
        tokio::spawn(async move {
            let workload = tokio::spawn(future);
            let outcome = match tokio::time::timeout(deadline, workload).await {
                Ok(Ok(Ok(()))) => TaskState::Done,
                Ok(Ok(Err(err))) => {
                    debug!(target: "vagus::pool", task = %id, error = %err, "task failed");
                    TaskState::Failed
                }
                Ok(Err(join_err)) => {
                    warn!(target: "vagus::pool", task = %id, error = %join_err, "task panicked");
                    TaskState::Failed
                }
                Err(_) => {
                    // Dropping the JoinHandle detaches the workload: the slot
                    // is reclaimed here, the future keeps running on its own.
                    warn!(target: "vagus::pool", task = %id, "deadline exceeded; task abandoned");
                    TaskState::Abandoned
                }
            };
            if inner.finish(id, outcome) {
                match outcome {
                    TaskState::Done => inner.completed.fetch_add(1, Ordering::Relaxed),
                    TaskState::Failed => inner.failed.fetch_add(1, Ordering::Relaxed),
                    TaskState::Abandoned => inner.abandoned.fetch_add(1, Ordering::Relaxed),
                    TaskState::Queued | TaskState::Running => 0,
                };
                inner.release_slot();
            }
        });
    }

    /// Records the single transition out of RUNNING. Returns false when the
    /// entry is gone or already terminal, in which case the caller must not
    /// touch the counters again.
    fn finish(&self, id: Uuid, next: TaskState) -> bool {
        let Some(mut entry) = self.tasks.get_mut(&id) else {
            return false;
        };
        if entry.state != TaskState::Running {
            return false;
        }
        entry.state = next;
        entry.finished_at = Some(Instant::now());
        true
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            ceiling: self.ceiling.load(Ordering::Acquire),
            in_flight: self.in_flight.load(Ordering::Acquire),
            queued: self.queued.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }

    fn publish_state(&self) {
        let snap = self.snapshot();
        let envelope = self
            .bus
            .envelope(SIG_POOL_STATE, 0.0)
            .with_fact("ceiling", snap.ceiling as u64)
            .with_fact("in_flight", snap.in_flight as u64)
            .with_fact("queued", snap.queued as u64)
            .with_fact("completed", snap.completed)
            .with_fact("failed", snap.failed)
            .with_fact("abandoned", snap.abandoned);
        self.bus.publish(envelope);
    }

    fn sweep_terminal(&self) {
        self.tasks.retain(|_, entry| match entry.finished_at {
            Some(at) => at.elapsed() < TERMINAL_RETENTION,
            None => true,
        });
    }
}

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// The bounded pool. Clone-cheap via its inner `Arc`; submitters and the
/// daemon's loops share one instance.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, bus: &SignalBus) -> Self {
        let config = config.sanitized();
        let liveness = LivenessTracker::new(bus.config().staleness_horizon());
        Self {
            inner: Arc::new(PoolInner {
                ceiling: AtomicUsize::new(config.initial_ceiling),
                in_flight: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                abandoned: AtomicU64::new(0),
                tasks: DashMap::new(),
                pending: Mutex::new(VecDeque::new()),
                bus: bus.handle(POOL_SOURCE),
                liveness,
                config,
            }),
        }
    }

    /// Enqueues a task under the configured default deadline. Must be called
    /// inside a tokio runtime; admitted work is spawned immediately.
    pub fn submit<F>(&self, label: impl Into<String>, future: F) -> Uuid
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.submit_with_deadline(label, self.inner.config.task_deadline(), future)
    }

    pub fn submit_with_deadline<F>(
        &self,
        label: impl Into<String>,
        deadline: Duration,
        future: F,
    ) -> Uuid
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        self.inner.tasks.insert(
            id,
            TaskEntry {
                label: label.into(),
                enqueued_ms: now_epoch_ms(),
                state: TaskState::Queued,
                finished_at: None,
            },
        );
        self.inner.queued.fetch_add(1, Ordering::AcqRel);
        self.inner.pending.lock().unwrap().push_back(PendingTask {
            id,
            deadline,
            future: Box::pin(future),
        });
        self.inner.drain_pending();
        id
    }

    /// Applies a throttle request. See [`PoolInner::reduce_ceiling`] rules;
    /// rejected requests surface as [`MeshError::CeilingAtFloor`].
    pub fn reduce_ceiling(&self, requested: usize) -> Result<usize, MeshError> {
        self.inner.reduce_ceiling(requested)
    }

    pub fn ceiling(&self) -> usize {
        self.inner.ceiling.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.inner.snapshot()
    }

    pub fn task(&self, id: Uuid) -> Option<WorkerTask> {
        self.inner.tasks.get(&id).map(|entry| WorkerTask {
            id,
            label: entry.label.clone(),
            enqueued_ms: entry.enqueued_ms,
            state: entry.state,
        })
    }

    pub fn task_state(&self, id: Uuid) -> Option<TaskState> {
        self.inner.tasks.get(&id).map(|entry| entry.state)
    }

    /// Publishes one `pool_state` snapshot envelope now.
    pub fn publish_state(&self) {
        self.inner.publish_state();
    }

    /// Consumes `reduce_concurrency` directives from the given subscription.
    /// Subscribe it to both the directive topic and `bus_heartbeat` so the
    /// liveness tracker stays fed.
    pub fn spawn_throttle_listener(&self, mut sub: Subscription) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(envelope) = sub.recv().await {
                inner.liveness.observe(&envelope);
                if envelope.name != SIG_REDUCE_CONCURRENCY {
                    continue;
                }
                let Some(requested) = envelope.fact_u64("requested_ceiling") else {
                    warn!(
                        target: "vagus::pool",
                        source = %envelope.source,
                        "throttle directive without requested_ceiling fact; ignored"
                    );
                    continue;
                };
                match inner.reduce_ceiling(requested as usize) {
                    Ok(ceiling) => {
                        info!(
                            target: "vagus::pool",
                            ceiling,
                            source = %envelope.source,
                            "concurrency ceiling lowered by directive"
                        );
                    }
                    Err(err) => {
                        warn!(target: "vagus::pool", error = %err, "throttle directive rejected");
                    }
                }
            }
        })
    }

    /// Periodic `pool_state` publisher; also sweeps stale terminal task
    /// entries. When the bus heartbeat goes silent the pool keeps its current
    /// ceiling and keeps admitting — degraded, not stalled.
    pub fn spawn_state_publisher(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let period = self.inner.config.state_publish_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut was_stale = false;
            loop {
                interval.tick().await;
                inner.sweep_terminal();
                inner.publish_state();
                let stale = inner.liveness.is_stale();
                if stale && !was_stale {
                    warn!(
                        target: "vagus::pool",
                        silence_ms = inner.liveness.silence().as_millis() as u64,
                        "bus heartbeat silent; running on local decisions"
                    );
                } else if !stale && was_stale {
                    info!(target: "vagus::pool", "bus heartbeat back; leaving degraded mode");
                }
                was_stale = stale;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, SignalBus};
    use crate::envelope::{SignalEnvelope, SIG_POOL_STATE, SIG_REDUCE_CONCURRENCY};

    fn test_bus() -> SignalBus {
        SignalBus::new(BusConfig {
            heartbeat_interval_ms: 50,
            dedup_window_secs: 60,
            channel_capacity: 64,
        })
    }

    fn test_pool(bus: &SignalBus, ceiling: usize, floor: usize) -> WorkerPool {
        WorkerPool::new(
            PoolConfig {
                initial_ceiling: ceiling,
                floor,
                task_deadline_secs: 30,
                state_publish_secs: 1,
            },
            bus,
        )
    }

    async fn wait_until<F: Fn(PoolSnapshot) -> bool>(pool: &WorkerPool, pred: F) {
        for _ in 0..200 {
            if pred(pool.snapshot()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never reached expected state: {:?}", pool.snapshot());
    }

    #[test]
    fn reduce_ceiling_rejects_raises_and_floor_breaks() {
        let bus = test_bus();
        let pool = test_pool(&bus, 5, 2);

        assert!(matches!(
            pool.reduce_ceiling(5),
            Err(MeshError::CeilingAtFloor { requested: 5, current: 5, .. })
        ));
        assert!(matches!(pool.reduce_ceiling(9), Err(MeshError::CeilingAtFloor { .. })));
        assert!(matches!(
            pool.reduce_ceiling(1),
            Err(MeshError::CeilingAtFloor { requested: 1, floor: 2, .. })
        ));
        assert_eq!(pool.reduce_ceiling(3).unwrap(), 3);
        assert_eq!(pool.ceiling(), 3);
        // repeat of the same request is now a no-op
        assert!(pool.reduce_ceiling(3).is_err());
    }

    #[tokio::test]
    async fn completed_and_failed_tasks_update_counters() {
        let bus = test_bus();
        let pool = test_pool(&bus, 4, 1);

        let ok_id = pool.submit("ok", async { Ok(()) });
        pool.submit("boom", async { Err::<(), TaskError>("boom".into()) });

        wait_until(&pool, |s| s.completed == 1 && s.failed == 1).await;
        let snap = pool.snapshot();
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.queued, 0);
        assert_eq!(pool.task_state(ok_id), Some(TaskState::Done));
    }

    #[tokio::test]
    async fn admissions_stop_at_the_ceiling() {
        let bus = test_bus();
        let pool = test_pool(&bus, 2, 1);
        let (release, rx) = tokio::sync::watch::channel(false);

        let mut ids = Vec::new();
        for i in 0..5 {
            let mut rx = rx.clone();
            ids.push(pool.submit(format!("blocked-{i}"), async move {
                let _ = rx.wait_for(|go| *go).await;
                Ok(())
            }));
        }

        wait_until(&pool, |s| s.in_flight == 2 && s.queued == 3).await;
        assert_eq!(pool.task_state(ids[0]), Some(TaskState::Running));
        assert_eq!(pool.task_state(ids[4]), Some(TaskState::Queued));

        release.send(true).unwrap();
        wait_until(&pool, |s| s.completed == 5 && s.in_flight == 0).await;
    }

    #[tokio::test]
    async fn deadline_abandons_slot_but_detaches_future() {
        let bus = test_bus();
        let pool = test_pool(&bus, 2, 1);

        let id = pool.submit_with_deadline("slow", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });

        wait_until(&pool, |s| s.abandoned == 1).await;
        assert_eq!(pool.task_state(id), Some(TaskState::Abandoned));
        let snap = pool.snapshot();
        assert_eq!(snap.in_flight, 0, "abandonment must reclaim the slot");
        assert_eq!(snap.completed, 0);
    }

    #[tokio::test]
    async fn lowered_ceiling_gates_queue_drain() {
        let bus = test_bus();
        let pool = test_pool(&bus, 5, 1);
        let (release, rx) = tokio::sync::watch::channel(false);

        for i in 0..5 {
            let mut rx = rx.clone();
            pool.submit(format!("wave1-{i}"), async move {
                let _ = rx.wait_for(|go| *go).await;
                Ok(())
            });
        }
        wait_until(&pool, |s| s.in_flight == 5).await;

        pool.reduce_ceiling(2).unwrap();
        let (release2, rx2) = tokio::sync::watch::channel(false);
        for i in 0..3 {
            let mut rx2 = rx2.clone();
            pool.submit(format!("wave2-{i}"), async move {
                let _ = rx2.wait_for(|go| *go).await;
                Ok(())
            });
        }

        // pre-existing tasks may still be running over the new ceiling, but
        // nothing new is admitted
        tokio::time::sleep(Duration::from_millis(80)).await;
        let snap = pool.snapshot();
        assert_eq!(snap.in_flight, 5);
        assert_eq!(snap.queued, 3);

        release.send(true).unwrap();
        wait_until(&pool, |s| s.completed == 5).await;
        // second wave is admitted only under the lowered ceiling
        wait_until(&pool, |s| s.in_flight == 2 && s.queued == 1).await;
        assert!(pool.snapshot().in_flight <= 2);

        release2.send(true).unwrap();
        wait_until(&pool, |s| s.completed == 8 && s.in_flight == 0).await;
    }

    #[tokio::test]
    async fn throttle_listener_applies_and_rejects_directives() {
        let bus = test_bus();
        let pool = test_pool(&bus, 6, 2);
        let listener = pool.spawn_throttle_listener(bus.subscribe(SIG_REDUCE_CONCURRENCY));
        let handle = bus.handle("test-governor");

        handle.publish(
            handle
                .envelope(SIG_REDUCE_CONCURRENCY, 1.0)
                .with_fact("requested_ceiling", 3_u64),
        );
        for _ in 0..100 {
            if pool.ceiling() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.ceiling(), 3);

        // below floor: rejected, ceiling unchanged
        handle.publish(
            handle
                .envelope(SIG_REDUCE_CONCURRENCY, 1.0)
                .with_fact("requested_ceiling", 0_u64),
        );
        // missing fact: ignored
        handle.publish(handle.envelope(SIG_REDUCE_CONCURRENCY, 1.0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.ceiling(), 3);

        listener.abort();
    }

    #[tokio::test]
    async fn pool_state_envelope_carries_all_counters() {
        let bus = test_bus();
        let pool = test_pool(&bus, 4, 1);
        let mut sub = bus.subscribe(SIG_POOL_STATE);

        pool.submit("ok", async { Ok(()) });
        wait_until(&pool, |s| s.completed == 1).await;
        pool.publish_state();

        let state: SignalEnvelope = sub
            .recv_timeout(Duration::from_millis(200))
            .await
            .expect("pool_state envelope");
        assert_eq!(state.source, POOL_SOURCE);
        assert_eq!(state.fact_u64("ceiling"), Some(4));
        assert_eq!(state.fact_u64("in_flight"), Some(0));
        assert_eq!(state.fact_u64("completed"), Some(1));
        assert_eq!(state.fact_u64("failed"), Some(0));
        assert_eq!(state.fact_u64("abandoned"), Some(0));
    }
}
