//! Skill registry: persisted effectiveness records, signal bindings, and the
//! execution traits remediation skills implement.
//!
//! Records live in sled so the learning loop survives restarts. Selection
//! ranks by `effectiveness` descending with ties broken by fewer attempts,
//! which keeps a little exploration in the mix: an untried skill outranks one
//! that has tried and failed, and among equals the less-exercised one goes
//! first.

use crate::bus::BusHandle;
use crate::envelope::{now_epoch_ms, SignalEnvelope};
use crate::error::MeshError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const RECORDS_TREE: &str = "skill_records";
const BINDINGS_TREE: &str = "signal_bindings";

// ---------------------------------------------------------------------------
// Skill execution contract
// ---------------------------------------------------------------------------

/// Typed failure surface for skill executions. Timeouts are applied by the
/// engine, not the skill, so they are not represented here.
#[derive(Debug, Error)]
pub enum SkillError {
    #[error("skill io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("precondition not met: {0}")]
    Precondition(String),
    #[error("execution failed: {0}")]
    Execution(String),
}

/// Runtime facts handed to one skill execution.
pub struct SkillContext {
    /// Publisher for envelopes the skill emits (e.g. throttle directives).
    pub bus: BusHandle,
    /// The pressure envelope that triggered remediation.
    pub trigger: SignalEnvelope,
    /// Last ceiling advertised via `pool_state`, when one has been seen.
    pub last_pool_ceiling: Option<u64>,
}

/// A named remediation action. Implementations live in `vagus-skills`; the
/// engine only selects skills whose id both has a registry record bound to
/// the triggering signal and resolves in the catalog.
#[async_trait]
pub trait RemediationSkill: Send + Sync {
    fn id(&self) -> &str;
    /// Whether the skill may execute without operator approval.
    fn auto_safe(&self) -> bool;
    async fn execute(&self, ctx: &SkillContext) -> Result<Value, SkillError>;
}

/// In-memory lookup of registered skill implementations.
#[derive(Default, Clone)]
pub struct SkillCatalog {
    skills: Vec<Arc<dyn RemediationSkill>>,
}

impl SkillCatalog {
    pub fn new() -> Self {
        Self { skills: Vec::new() }
    }

    pub fn register(&mut self, skill: Arc<dyn RemediationSkill>) {
        debug!(
            target: "vagus::registry",
            skill = skill.id(),
            auto_safe = skill.auto_safe(),
            "skill registered"
        );
        self.skills.push(skill);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn RemediationSkill>> {
        self.skills.iter().find(|s| s.id() == id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.skills.iter().map(|s| s.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Skill records
// ---------------------------------------------------------------------------

/// Effectiveness ledger for one skill. Mutated only by the remediation
/// engine once an outcome is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillRecord {
    pub skill_id: String,
    #[serde(default)]
    pub attempts: u64,
    #[serde(default)]
    pub successes: u64,
    #[serde(default)]
    pub auto_safe: bool,
    #[serde(default)]
    pub updated_ms: i64,
}

impl SkillRecord {
    pub fn new(skill_id: impl Into<String>, auto_safe: bool) -> Self {
        Self {
            skill_id: skill_id.into(),
            attempts: 0,
            successes: 0,
            auto_safe,
            updated_ms: now_epoch_ms(),
        }
    }

    /// `successes / attempts`; 0.0 before the first attempt.
    pub fn effectiveness(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    pub fn note_outcome(&mut self, success: bool) {
        self.attempts += 1;
        if success {
            self.successes += 1;
        }
        self.updated_ms = now_epoch_ms();
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

// ---------------------------------------------------------------------------
// Persistent store
// ---------------------------------------------------------------------------

/// sled-backed persistence: one tree of records keyed by skill id, one tree
/// of signal-name → skill-id bindings.
///
/// sled is single-writer per path; each daemon process opens its own store
/// directory.
pub struct SkillStore {
    db: sled::Db,
    records: sled::Tree,
    bindings: sled::Tree,
}

impl SkillStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MeshError> {
        let db = sled::open(path)?;
        let records = db.open_tree(RECORDS_TREE)?;
        let bindings = db.open_tree(BINDINGS_TREE)?;
        Ok(Self {
            db,
            records,
            bindings,
        })
    }

    pub fn save_record(&self, record: &SkillRecord) -> Result<(), MeshError> {
        self.records
            .insert(record.skill_id.as_bytes(), record.to_bytes())?;
        Ok(())
    }

    /// Inserts only when the id is absent, so learned statistics survive a
    /// restart's re-registration pass.
    pub fn seed_record(&self, record: SkillRecord) -> Result<(), MeshError> {
        if self.records.get(record.skill_id.as_bytes())?.is_none() {
            self.save_record(&record)?;
        }
        Ok(())
    }

    pub fn record(&self, skill_id: &str) -> Result<Option<SkillRecord>, MeshError> {
        Ok(self
            .records
            .get(skill_id.as_bytes())?
            .and_then(|ivec| SkillRecord::from_bytes(&ivec)))
    }

    /// Read-modify-write of one record's counters. The remediation loop is
    /// the store's only writer, so the plain get/insert pair is enough.
    pub fn record_outcome(&self, skill_id: &str, success: bool) -> Result<SkillRecord, MeshError> {
        let mut record = self
            .record(skill_id)?
            .unwrap_or_else(|| SkillRecord::new(skill_id, false));
        record.note_outcome(success);
        self.save_record(&record)?;
        Ok(record)
    }

    /// Appends `skill_id` to the signal's binding list if not already there.
    pub fn bind(&self, signal: &str, skill_id: &str) -> Result<(), MeshError> {
        let mut ids = self.bound_skills(signal)?;
        if !ids.iter().any(|id| id == skill_id) {
            ids.push(skill_id.to_string());
            self.bindings.insert(signal.as_bytes(), serde_json::to_vec(&ids)?)?;
        }
        Ok(())
    }

    pub fn bound_skills(&self, signal: &str) -> Result<Vec<String>, MeshError> {
        Ok(self
            .bindings
            .get(signal.as_bytes())?
            .and_then(|ivec| serde_json::from_slice(&ivec).ok())
            .unwrap_or_default())
    }

    /// Records bound to `signal`, ranked best-first: effectiveness
    /// descending, ties by fewer attempts. Bound ids without a record are
    /// skipped.
    pub fn candidates_for(&self, signal: &str) -> Result<Vec<SkillRecord>, MeshError> {
        let mut out = Vec::new();
        for id in self.bound_skills(signal)? {
            if let Some(record) = self.record(&id)? {
                out.push(record);
            }
        }
        out.sort_by(|a, b| {
            b.effectiveness()
                .partial_cmp(&a.effectiveness())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.attempts.cmp(&b.attempts))
        });
        Ok(out)
    }

    pub fn flush(&self) -> Result<(), MeshError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoopSkill(&'static str);

    #[async_trait]
    impl RemediationSkill for NoopSkill {
        fn id(&self) -> &str {
            self.0
        }
        fn auto_safe(&self) -> bool {
            true
        }
        async fn execute(&self, _ctx: &SkillContext) -> Result<Value, SkillError> {
            Ok(json!({}))
        }
    }

    fn temp_store() -> (tempfile::TempDir, SkillStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SkillStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn effectiveness_is_zero_before_attempts() {
        let mut record = SkillRecord::new("sweep", true);
        assert_eq!(record.effectiveness(), 0.0);
        record.note_outcome(true);
        record.note_outcome(false);
        assert!((record.effectiveness() - 0.5).abs() < f64::EPSILON);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.successes, 1);
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SkillStore::open(dir.path()).unwrap();
            let mut record = SkillRecord::new("throttle_workers", true);
            record.note_outcome(true);
            store.save_record(&record).unwrap();
            store.bind("mem_pressure", "throttle_workers").unwrap();
            store.flush().unwrap();
        }
        let store = SkillStore::open(dir.path()).unwrap();
        let record = store.record("throttle_workers").unwrap().expect("persisted record");
        assert_eq!(record.attempts, 1);
        assert_eq!(record.successes, 1);
        assert!(record.auto_safe);
        assert_eq!(store.bound_skills("mem_pressure").unwrap(), vec!["throttle_workers"]);
    }

    #[test]
    fn seed_never_clobbers_learned_stats() {
        let (_dir, store) = temp_store();
        let mut learned = SkillRecord::new("sweep", true);
        learned.note_outcome(true);
        learned.note_outcome(true);
        store.save_record(&learned).unwrap();

        store.seed_record(SkillRecord::new("sweep", true)).unwrap();
        assert_eq!(store.record("sweep").unwrap().unwrap().attempts, 2);

        store.seed_record(SkillRecord::new("fresh", false)).unwrap();
        assert_eq!(store.record("fresh").unwrap().unwrap().attempts, 0);
    }

    #[test]
    fn bind_is_idempotent_and_ordered() {
        let (_dir, store) = temp_store();
        store.bind("cpu_pressure", "a").unwrap();
        store.bind("cpu_pressure", "b").unwrap();
        store.bind("cpu_pressure", "a").unwrap();
        assert_eq!(store.bound_skills("cpu_pressure").unwrap(), vec!["a", "b"]);
        assert!(store.bound_skills("swap_pressure").unwrap().is_empty());
    }

    #[test]
    fn candidates_rank_by_effectiveness_then_fewer_attempts() {
        let (_dir, store) = temp_store();
        let mut half = SkillRecord::new("half", true); // 2/4
        for success in [true, false, true, false] {
            half.note_outcome(success);
        }
        let mut veteran = SkillRecord::new("veteran", true); // 2/2
        veteran.note_outcome(true);
        veteran.note_outcome(true);
        let mut rookie = SkillRecord::new("rookie", true); // 1/1
        rookie.note_outcome(true);
        let untried = SkillRecord::new("untried", true); // 0/0

        for record in [&half, &veteran, &rookie, &untried] {
            store.save_record(record).unwrap();
            store.bind("mem_pressure", &record.skill_id).unwrap();
        }

        let ranked: Vec<String> = store
            .candidates_for("mem_pressure")
            .unwrap()
            .into_iter()
            .map(|r| r.skill_id)
            .collect();
        assert_eq!(ranked, vec!["rookie", "veteran", "half", "untried"]);
    }

    #[test]
    fn record_outcome_creates_missing_records() {
        let (_dir, store) = temp_store();
        let record = store.record_outcome("adhoc", false).unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(record.successes, 0);
        assert!(!record.auto_safe);
    }

    #[test]
    fn catalog_resolves_registered_ids() {
        let mut catalog = SkillCatalog::new();
        assert!(catalog.is_empty());
        catalog.register(Arc::new(NoopSkill("sweep")));
        catalog.register(Arc::new(NoopSkill("purge")));
        assert_eq!(catalog.len(), 2);
        assert!(catalog.get("sweep").is_some());
        assert!(catalog.get("missing").is_none());
        assert_eq!(catalog.ids(), vec!["sweep", "purge"]);
    }
}
