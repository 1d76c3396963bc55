use std::path::PathBuf;

use tracing::{info, warn};

use crate::config::Settings;
use crate::engine::{Collaborators, UpgradeEngine, UpgradeReport};
use crate::error::UpgradeFailure;
use crate::lock::{InstanceLock, LockOutcome};
use crate::validator::{BinaryRole, BinaryValidator};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(UpgradeReport),
    /// Another instance holds the lock for this service.
    Busy {
        lock: PathBuf,
        holder: Option<String>,
    },
}

/// Validates both binaries, takes the per-service lock, then waits and upgrades.
/// Nothing is polled unless validation passed and the lock was acquired.
pub fn run_upgrade(
    settings: &Settings,
    validator: &BinaryValidator,
    collaborators: Collaborators,
) -> Result<RunOutcome, UpgradeFailure> {
    for key in &settings.ignored_values {
        warn!(key = %key, "unparseable value ignored; default used");
    }
    validate_binaries(settings, validator)?;

    let lock = match InstanceLock::acquire(&settings.lock_dir, &settings.target.service_id)? {
        LockOutcome::Acquired(lock) => lock,
        LockOutcome::Busy { path, holder } => {
            info!(
                lock = %path.display(),
                holder = holder.as_deref().unwrap_or("unknown"),
                "another instance is handling this upgrade; exiting"
            );
            return Ok(RunOutcome::Busy { lock: path, holder });
        }
    };

    let report = UpgradeEngine::new(settings, collaborators).run()?;
    info!(
        final_state = %report.final_state,
        trigger_height = report.trigger_height,
        lock = %lock.path().display(),
        "upgrade complete"
    );
    Ok(RunOutcome::Completed(report))
}

pub fn validate_binaries(
    settings: &Settings,
    validator: &BinaryValidator,
) -> Result<(), UpgradeFailure> {
    validator.validate_executable(
        &settings.target.candidate_binary,
        BinaryRole::Candidate,
        settings.target.expected_sha256.as_deref(),
    )?;
    validator.validate_executable(&settings.target.active_binary, BinaryRole::Active, None)?;
    Ok(())
}
