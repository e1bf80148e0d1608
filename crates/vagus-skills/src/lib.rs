//! Built-in remediation skills for the vagus mesh.
//!
//! Each skill implements [`RemediationSkill`] from vagus-core; the daemon
//! registers them in a catalog, seeds their registry records, and binds them
//! to the pressure signals they answer.

pub use vagus_core::{RemediationSkill, SkillCatalog, SkillContext, SkillError};

mod scratch_purge;
mod scratch_sweep;
mod throttle_workers;

pub use scratch_purge::ScratchPurge;
pub use scratch_sweep::ScratchSweep;
pub use throttle_workers::ThrottleWorkers;
