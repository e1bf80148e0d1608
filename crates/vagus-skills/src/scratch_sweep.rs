//! Scratch sweep skill: deletes scratch files older than a retention age to
//! relieve memory-mapped and disk-backed pressure. Directories are left in
//! place; only regular files are removed.

use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use vagus_core::{RemediationSkill, SkillContext, SkillError};
use walkdir::WalkDir;

const SKILL_ID: &str = "scratch_sweep";

/// Age-based scratch cleanup. Auto-safe: anything under the scratch root is
/// reproducible by definition, and the age cutoff keeps in-use files alive.
pub struct ScratchSweep {
    dir: PathBuf,
    max_age: Duration,
}

impl ScratchSweep {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
        }
    }
}

/// Removes files under `dir` whose modification time is at least `max_age`
/// ago. Returns (removed count, freed bytes). Unreadable entries are skipped.
fn sweep_files(dir: &Path, max_age: Duration) -> (u64, u64) {
    let mut removed = 0u64;
    let mut freed = 0u64;
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let age = meta
            .modified()
            .ok()
            .and_then(|t| t.elapsed().ok())
            .unwrap_or(Duration::ZERO);
        if age < max_age {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                removed += 1;
                freed += meta.len();
            }
            Err(err) => {
                warn!(
                    target: "vagus::skills",
                    skill = SKILL_ID,
                    path = %entry.path().display(),
                    error = %err,
                    "could not remove scratch file"
                );
            }
        }
    }
    (removed, freed)
}

#[async_trait::async_trait]
impl RemediationSkill for ScratchSweep {
    fn id(&self) -> &str {
        SKILL_ID
    }

    fn auto_safe(&self) -> bool {
        true
    }

    async fn execute(&self, _ctx: &SkillContext) -> Result<serde_json::Value, SkillError> {
        if !self.dir.exists() {
            return Ok(json!({
                "status": "ok",
                "skill": SKILL_ID,
                "dir": self.dir.display().to_string(),
                "removed": 0,
                "freed_bytes": 0,
            }));
        }
        let (removed, freed_bytes) = sweep_files(&self.dir, self.max_age);
        info!(
            target: "vagus::skills",
            skill = SKILL_ID,
            removed,
            freed_bytes,
            "scratch sweep finished"
        );
        Ok(json!({
            "status": "ok",
            "skill": SKILL_ID,
            "dir": self.dir.display().to_string(),
            "removed": removed,
            "freed_bytes": freed_bytes,
        }))
    }
}
