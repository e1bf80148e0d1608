//! Scratch purge skill: empties the scratch directory outright, regardless
//! of file age. Approval-gated, since it can remove files another process is
//! still using; the engine only runs it after an operator ack.

use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};
use vagus_core::{RemediationSkill, SkillContext, SkillError};
use walkdir::WalkDir;

const SKILL_ID: &str = "scratch_purge";

pub struct ScratchPurge {
    dir: PathBuf,
}

impl ScratchPurge {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait::async_trait]
impl RemediationSkill for ScratchPurge {
    fn id(&self) -> &str {
        SKILL_ID
    }

    fn auto_safe(&self) -> bool {
        false
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

        let mut removed = 0u64;
        let mut freed_bytes = 0u64;
        for entry in WalkDir::new(&self.dir)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    removed += 1;
                    freed_bytes += size;
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
        info!(
            target: "vagus::skills",
            skill = SKILL_ID,
            removed,
            freed_bytes,
            "scratch purge finished"
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

#[cfg(test)]
mod tests {
    use super::*;
    use vagus_core::{BusConfig, SignalBus, SignalEnvelope, SIG_MEM_PRESSURE};

    fn ctx(bus: &SignalBus) -> SkillContext {
        SkillContext {
            bus: bus.handle("test"),
            trigger: SignalEnvelope::new(SIG_MEM_PRESSURE, "test", 4.1),
            last_pool_ceiling: None,
        }
    }

    #[tokio::test]
    async fn purge_empties_nested_scratch() {
        let bus = SignalBus::new(BusConfig::default());
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(scratch.path().join("fresh.tmp"), b"xx").unwrap();
        std::fs::create_dir_all(scratch.path().join("deep/deeper")).unwrap();
        std::fs::write(scratch.path().join("deep/deeper/old.tmp"), b"yyyy").unwrap();

        let skill = ScratchPurge::new(scratch.path());
        let result = skill.execute(&ctx(&bus)).await.unwrap();

        assert_eq!(result["removed"], 2);
        assert_eq!(result["freed_bytes"], 6);
        assert!(!scratch.path().join("fresh.tmp").exists());
        assert!(!scratch.path().join("deep/deeper/old.tmp").exists());
    }

    #[tokio::test]
    async fn missing_dir_reports_nothing_removed() {
        let bus = SignalBus::new(BusConfig::default());
        let skill = ScratchPurge::new("/no/scratch/root");
        let result = skill.execute(&ctx(&bus)).await.unwrap();
        assert_eq!(result["removed"], 0);
        assert_eq!(result["freed_bytes"], 0);
    }
}
