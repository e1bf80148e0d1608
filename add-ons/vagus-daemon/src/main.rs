//! Vagus Mesh Daemon
//!
//! A long-running process that wires the signal bus, resource monitor,
//! worker pool, and remediation engine together, registers the built-in
//! skills, and keeps the loops alive until ctrl-c.

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vagus_core::{
    MeshConfig, RemediationEngine, RemediationSkill, ResourceMonitor, SignalBus, SkillCatalog,
    SkillRecord, SkillStore, VitalsStation, WorkerPool, MONITOR_SOURCE, SIG_BUS_HEARTBEAT,
    SIG_CPU_PRESSURE, SIG_MEM_PRESSURE, SIG_REDUCE_CONCURRENCY, SIG_SWAP_PRESSURE,
};
use vagus_skills::{ScratchPurge, ScratchSweep, ThrottleWorkers};

/// Periodic log line with bus and pool counters.
const STATS_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[vagus-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = MeshConfig::load().expect("load MeshConfig");

    // NOTE: sled is single-writer; a second mesh process must point
    // VAGUS__STORE_PATH at its own directory.
    let store = Arc::new(SkillStore::open(&config.store_path).expect("open skill registry"));
    let catalog = Arc::new(build_catalog(&config, &store));

    let bus = SignalBus::new(config.bus.clone());
    let heartbeat = bus.start_heartbeat();

    let station = Arc::new(VitalsStation::new(config.monitor.history_len));
    let monitor = ResourceMonitor::new(
        config.monitor.clone(),
        Arc::clone(&station),
        bus.handle(MONITOR_SOURCE),
    )
    .spawn();

    let pool = WorkerPool::new(config.pool.clone(), &bus);
    let throttle = pool.spawn_throttle_listener(
        bus.subscribe_many(&[SIG_REDUCE_CONCURRENCY, SIG_BUS_HEARTBEAT]),
    );
    let pool_state = pool.spawn_state_publisher();

    let engine = RemediationEngine::new(
        config.remediation.clone(),
        &bus,
        Arc::clone(&station),
        Arc::clone(&store),
        Arc::clone(&catalog),
    )
    .spawn();

    tracing::info!(
        store_path = %config.store_path,
        scratch_dir = %config.scratch_dir,
        skills = catalog.len(),
        pool_ceiling = config.pool.initial_ceiling,
        monitor_interval_secs = config.monitor.interval_secs,
        "vagus daemon started"
    );

    let mut stats_interval = tokio::time::interval(Duration::from_secs(STATS_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = stats_interval.tick() => {
                let bus_stats = bus.stats();
                let snap = pool.snapshot();
                tracing::info!(
                    subscribers = bus_stats.subscribers,
                    delivered = bus_stats.delivered,
                    dropped_full = bus_stats.dropped_full,
                    dropped_duplicate = bus_stats.dropped_duplicate,
                    pool_ceiling = snap.ceiling,
                    in_flight = snap.in_flight,
                    queued = snap.queued,
                    completed = snap.completed,
                    failed = snap.failed,
                    abandoned = snap.abandoned,
                    "mesh stats"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down daemon");
                break;
            }
        }
    }

    engine.abort();
    monitor.abort();
    throttle.abort();
    pool_state.abort();
    heartbeat.abort();
    if let Err(e) = store.flush() {
        tracing::warn!(error = %e, "skill registry flush failed on shutdown");
    }
}

/// Registers the built-in skills, seeds their effectiveness records, and
/// binds them to the pressure signals they answer.
fn build_catalog(config: &MeshConfig, store: &SkillStore) -> SkillCatalog {
    let max_age = Duration::from_secs(config.scratch_max_age_secs);
    let skills: Vec<Arc<dyn RemediationSkill>> = vec![
        Arc::new(ThrottleWorkers::new().with_fallback_ceiling(config.pool.initial_ceiling as u64)),
        Arc::new(ScratchSweep::new(&config.scratch_dir, max_age)),
        Arc::new(ScratchPurge::new(&config.scratch_dir)),
    ];

    let mut catalog = SkillCatalog::new();
    for skill in skills {
        store
            .seed_record(SkillRecord::new(skill.id(), skill.auto_safe()))
            .expect("seed skill record");
        catalog.register(skill);
    }

    // Eligibility per signal; the engine orders candidates by recorded
    // effectiveness, so binding order only matters before any outcomes exist.
    let bindings = [
        (SIG_CPU_PRESSURE, "throttle_workers"),
        (SIG_MEM_PRESSURE, "throttle_workers"),
        (SIG_MEM_PRESSURE, "scratch_sweep"),
        (SIG_MEM_PRESSURE, "scratch_purge"),
        (SIG_SWAP_PRESSURE, "scratch_sweep"),
        (SIG_SWAP_PRESSURE, "scratch_purge"),
    ];
    for (signal, skill_id) in bindings {
        store.bind(signal, skill_id).expect("bind skill to signal");
    }

    catalog
}
