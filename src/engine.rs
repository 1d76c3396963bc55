use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use tracing::{error, info, warn};

use crate::backup::{BackupManager, BackupOutcome};
use crate::config::{GraceSettings, PollingPolicy, Settings, UpgradeTarget};
use crate::error::{FailureKind, UpgradeFailure};
use crate::fsops::{Filesystem, LocalFilesystem};
use crate::height::{CurlStatusClient, HeightSource, ObservedHeight, PollOutcome, StatusClient};
use crate::observability;
use crate::pause::Pause;
use crate::service::{ServiceController, SystemctlController};
use crate::validator::{normalize_sha256_hex, ContentDigest, Sha256Digest};

/// Consecutive unavailable polls after which each further failure logs at error level.
pub const FAILURE_ESCALATION_THRESHOLD: u32 = 10;

const INSTALLED_MODE: u32 = 0o755;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UpgradeState {
    Triggered,
    Stopping,
    StoppedVerified,
    BackingUp,
    Swapping,
    Starting,
    StartedVerified,
    Done,
    Failed,
}

impl UpgradeState {
    pub fn as_str(self) -> &'static str {
        match self {
            UpgradeState::Triggered => "TRIGGERED",
            UpgradeState::Stopping => "STOPPING",
            UpgradeState::StoppedVerified => "STOPPED_VERIFIED",
            UpgradeState::BackingUp => "BACKING_UP",
            UpgradeState::Swapping => "SWAPPING",
            UpgradeState::Starting => "STARTING",
            UpgradeState::StartedVerified => "STARTED_VERIFIED",
            UpgradeState::Done => "DONE",
            UpgradeState::Failed => "FAILED",
        }
    }
}

impl Display for UpgradeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pass through the upgrade sequence.
#[derive(Debug, Clone)]
pub struct UpgradeRun {
    pub trigger_height: u64,
    pub state: UpgradeState,
    pub service_stopped: bool,
    pub failed_at: Option<UpgradeState>,
    pub history: Vec<UpgradeState>,
    pub backup: Option<BackupOutcome>,
}

impl UpgradeRun {
    pub fn new(trigger_height: u64) -> Self {
        Self {
            trigger_height,
            state: UpgradeState::Triggered,
            service_stopped: false,
            failed_at: None,
            history: vec![UpgradeState::Triggered],
            backup: None,
        }
    }

    /// Last state whose entry action succeeded.
    pub fn last_reached(&self) -> UpgradeState {
        self.failed_at.unwrap_or(self.state)
    }

    /// True once the service has been stopped and not yet verified running again.
    pub fn needs_rollback_start(&self) -> bool {
        self.service_stopped && self.last_reached() < UpgradeState::StartedVerified
    }

    fn reach(&mut self, state: UpgradeState) {
        self.state = state;
        self.history.push(state);
        info!(
            state = %state,
            trigger_height = self.trigger_height,
            "upgrade state reached"
        );
        observability::record_transition(state.as_str());
    }

    fn fail(&mut self) -> UpgradeState {
        let last = self.last_reached();
        self.failed_at = Some(last);
        self.state = UpgradeState::Failed;
        self.history.push(UpgradeState::Failed);
        observability::record_transition(UpgradeState::Failed.as_str());
        last
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeReport {
    pub trigger_height: u64,
    pub final_state: UpgradeState,
    pub history: Vec<UpgradeState>,
    pub backup: Option<BackupOutcome>,
}

/// Everything the engine touches outside its own memory.
pub struct Collaborators {
    pub status_client: Box<dyn StatusClient>,
    pub service: Arc<dyn ServiceController>,
    pub fs: Arc<dyn Filesystem>,
    pub digest: Arc<dyn ContentDigest>,
    pub pause: Arc<dyn Pause>,
}

impl Collaborators {
    /// curl, systemctl, SHA-256 and the local filesystem.
    pub fn system(settings: &Settings, pause: Arc<dyn Pause>) -> Self {
        Self {
            status_client: Box::new(CurlStatusClient::new(&settings.rpc)),
            service: Arc::new(SystemctlController::new(&settings.service_manager)),
            fs: Arc::new(LocalFilesystem),
            digest: Arc::new(Sha256Digest),
            pause,
        }
    }
}

pub struct UpgradeEngine {
    target: UpgradeTarget,
    policy: PollingPolicy,
    grace: GraceSettings,
    height: HeightSource,
    backup: BackupManager,
    service: Arc<dyn ServiceController>,
    fs: Arc<dyn Filesystem>,
    digest: Arc<dyn ContentDigest>,
    pause: Arc<dyn Pause>,
}

impl UpgradeEngine {
    pub fn new(settings: &Settings, collaborators: Collaborators) -> Self {
        let Collaborators {
            status_client,
            service,
            fs,
            digest,
            pause,
        } = collaborators;
        let height = HeightSource::new(
            status_client,
            settings.target.rpc_endpoint.clone(),
            &settings.polling,
            Arc::clone(&pause),
        );
        let backup = BackupManager::new(&settings.backup, Arc::clone(&fs));

        Self {
            target: settings.target.clone(),
            policy: settings.polling.clone(),
            grace: settings.grace.clone(),
            height,
            backup,
            service,
            fs,
            digest,
            pause,
        }
    }

    pub fn run(&self) -> Result<UpgradeReport, UpgradeFailure> {
        info!(
            target_height = self.target.target_height,
            service = %self.target.service_id,
            rpc_endpoint = %self.target.rpc_endpoint,
            "waiting for upgrade height"
        );
        let trigger_height = self.wait_for_target()?;
        self.execute_upgrade(trigger_height)
    }

    /// Polls until the observed height equals the target. Overshoot is a safety abort.
    pub fn wait_for_target(&self) -> Result<u64, UpgradeFailure> {
        let target = self.target.target_height;
        let mut observed = ObservedHeight::default();

        loop {
            match self.height.poll()? {
                PollOutcome::Height(height) => {
                    observed.record_success(height);
                    observability::record_height_poll("ok", Some(height));

                    if height > target {
                        error!(
                            observed_height = height,
                            target_height = target,
                            "observed height is past the upgrade height; refusing to upgrade"
                        );
                        return Err(UpgradeFailure::safety_abort(format!(
                            "observed height {} is past target height {}; the upgrade window was missed",
                            height, target
                        )));
                    }
                    if height == target {
                        info!(
                            observed_height = height,
                            target_height = target,
                            "target height reached"
                        );
                        return Ok(height);
                    }

                    let blocks_remaining = target - height;
                    let interval = self.policy.interval_for(blocks_remaining);
                    info!(
                        observed_height = height,
                        target_height = target,
                        blocks_remaining = blocks_remaining,
                        interval_secs = interval.as_secs(),
                        "waiting for target height"
                    );
                    self.pause.pause(interval)?;
                }
                PollOutcome::Unavailable {
                    attempts,
                    last_error,
                } => {
                    let failures = observed.record_failure();
                    observability::record_height_poll("unavailable", None);
                    let interval = self.policy.fallback_interval();
                    if failures >= FAILURE_ESCALATION_THRESHOLD {
                        error!(
                            consecutive_failures = failures,
                            attempts = attempts,
                            last_observed_height = observed.latest,
                            interval_secs = interval.as_secs(),
                            error = %last_error,
                            "status endpoint still unavailable"
                        );
                    } else {
                        warn!(
                            consecutive_failures = failures,
                            attempts = attempts,
                            interval_secs = interval.as_secs(),
                            error = %last_error,
                            "status endpoint unavailable"
                        );
                    }
                    self.pause.pause(interval)?;
                }
            }
        }
    }

    /// Runs the stop, backup, swap and start sequence exactly once.
    pub fn execute_upgrade(&self, trigger_height: u64) -> Result<UpgradeReport, UpgradeFailure> {
        let mut run = UpgradeRun::new(trigger_height);
        observability::record_transition(UpgradeState::Triggered.as_str());
        info!(
            trigger_height = trigger_height,
            service = %self.target.service_id,
            candidate = %self.target.candidate_binary.display(),
            active = %self.target.active_binary.display(),
            "upgrade triggered"
        );

        match self.drive(&mut run) {
            Ok(()) => Ok(UpgradeReport {
                trigger_height,
                final_state: run.state,
                history: run.history,
                backup: run.backup,
            }),
            Err(failure) => {
                let failed_at = run.fail();
                error!(
                    state = %failed_at,
                    kind = failure.kind.as_str(),
                    error = %failure.message,
                    "upgrade sequence failed"
                );
                if run.needs_rollback_start() {
                    self.rollback_start();
                }
                let kind = match failure.kind {
                    FailureKind::Interrupted => FailureKind::Interrupted,
                    _ => FailureKind::Sequence,
                };
                Err(UpgradeFailure::new(
                    kind,
                    format!("FAILED at {}: {}", failed_at, failure.message),
                ))
            }
        }
    }

    fn drive(&self, run: &mut UpgradeRun) -> Result<(), UpgradeFailure> {
        let service_id = self.target.service_id.as_str();

        self.pause.check()?;
        self.service
            .stop(service_id)
            .map_err(|err| UpgradeFailure::sequence(format!("stop failed: {:#}", err)))?;
        run.service_stopped = true;
        run.reach(UpgradeState::Stopping);

        self.pause.pause(self.grace.stop_grace())?;
        if self.query_active(service_id)? {
            return Err(UpgradeFailure::sequence(format!(
                "service {} still active {}s after stop",
                service_id, self.grace.stop_grace_secs
            )));
        }
        run.reach(UpgradeState::StoppedVerified);

        self.pause.check()?;
        let backup = self.backup.backup(&self.target.active_binary, service_id)?;
        run.backup = Some(backup);
        run.reach(UpgradeState::BackingUp);

        self.pause.check()?;
        self.swap_binary()?;
        run.reach(UpgradeState::Swapping);

        self.pause.check()?;
        self.service
            .start(service_id)
            .map_err(|err| UpgradeFailure::sequence(format!("start failed: {:#}", err)))?;
        run.reach(UpgradeState::Starting);

        self.pause.pause(self.grace.start_grace())?;
        if !self.query_active(service_id)? {
            return Err(UpgradeFailure::sequence(format!(
                "service {} not active {}s after start",
                service_id, self.grace.start_grace_secs
            )));
        }
        run.reach(UpgradeState::StartedVerified);

        if !self.query_active(service_id)? {
            return Err(UpgradeFailure::sequence(format!(
                "service {} stopped right after start verification",
                service_id
            )));
        }
        run.reach(UpgradeState::Done);
        Ok(())
    }

    fn query_active(&self, service_id: &str) -> Result<bool, UpgradeFailure> {
        self.service.is_active(service_id).map_err(|err| {
            UpgradeFailure::sequence(format!("service state query failed: {:#}", err))
        })
    }

    /// Stages the candidate next to the active path, re-checks the pinned digest
    /// on the staged bytes, then renames it into place.
    fn swap_binary(&self) -> Result<(), UpgradeFailure> {
        let active = self.target.active_binary.as_path();
        let staged = staging_path(active)?;

        if let Err(err) =
            self.fs
                .install_file(&self.target.candidate_binary, &staged, INSTALLED_MODE)
        {
            self.discard_staged(&staged);
            return Err(UpgradeFailure::sequence(format!(
                "failed staging candidate: {:#}",
                err
            )));
        }

        if let Err(err) = self.verify_staged(&staged) {
            self.discard_staged(&staged);
            return Err(UpgradeFailure::sequence(format!(
                "staged candidate rejected: {:#}",
                err
            )));
        }

        if let Err(err) = self.fs.rename(&staged, active) {
            self.discard_staged(&staged);
            return Err(UpgradeFailure::sequence(format!(
                "failed swapping binary into place: {:#}",
                err
            )));
        }

        info!(
            active = %active.display(),
            candidate = %self.target.candidate_binary.display(),
            "binary swapped"
        );
        Ok(())
    }

    fn verify_staged(&self, staged: &Path) -> anyhow::Result<()> {
        let Some(expected) = self.target.expected_sha256.as_deref() else {
            return Ok(());
        };
        let expected = normalize_sha256_hex(expected)?;
        let actual = self.digest.hex_digest(staged)?.to_ascii_lowercase();
        if actual != expected {
            return Err(anyhow!(
                "checksum mismatch for {} (expected {}, got {})",
                self.target.candidate_binary.display(),
                expected,
                actual
            ));
        }
        info!(staged = %staged.display(), "staged candidate digest verified");
        Ok(())
    }

    fn discard_staged(&self, staged: &Path) {
        if !self.fs.exists(staged) {
            return;
        }
        if let Err(err) = self.fs.remove_file(staged) {
            warn!(
                staged = %staged.display(),
                error = %format!("{:#}", err),
                "failed removing staged candidate"
            );
        }
    }

    fn rollback_start(&self) {
        let service_id = self.target.service_id.as_str();
        warn!(service = service_id, "attempting rollback start");
        match self.service.start(service_id) {
            Ok(()) => info!(service = service_id, "rollback start issued"),
            Err(err) => error!(
                service = service_id,
                error = %format!("{:#}", err),
                "rollback start failed; manual intervention required"
            ),
        }
    }
}

/// `<dir>/.<name>.upgrade-tmp`, on the same filesystem as the active binary.
pub fn staging_path(active: &Path) -> Result<PathBuf, UpgradeFailure> {
    let name = active.file_name().ok_or_else(|| {
        UpgradeFailure::sequence(format!(
            "active binary path {} has no file name",
            active.display()
        ))
    })?;
    let parent = active
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok(parent.join(format!(".{}.upgrade-tmp", name.to_string_lossy())))
}

#[cfg(test)]
mod tests {
    use super::{
        staging_path, Collaborators, UpgradeEngine, UpgradeRun, UpgradeState,
    };
    use crate::backup::BackupOutcome;
    use crate::config::{
        BackupSettings, GraceSettings, PollingPolicy, RpcSettings, ServiceManagerSettings,
        Settings, UpgradeTarget,
    };
    use crate::error::FailureKind;
    use crate::fsops::{Filesystem, LocalFilesystem};
    use crate::testing::{FailingFilesystem, RecordingPause, RecordingService, ScriptedStatusClient};
    use crate::validator::{ContentDigest, Sha256Digest};
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        _temp: tempfile::TempDir,
        settings: Settings,
        active: PathBuf,
        backups: PathBuf,
    }

    fn fixture(target_height: u64, backup_enabled: bool) -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let candidate = temp.path().join("candidate");
        let active = temp.path().join("bin").join("node");
        let backups = temp.path().join("backups");
        fs::create_dir_all(active.parent().expect("parent")).expect("mkdir");
        fs::write(&candidate, b"new-binary").expect("candidate");
        fs::write(&active, b"old-binary").expect("active");

        let settings = Settings {
            target: UpgradeTarget {
                target_height,
                rpc_endpoint: "http://127.0.0.1:26657".to_string(),
                service_id: "node".to_string(),
                candidate_binary: candidate,
                active_binary: active.clone(),
                expected_sha256: None,
            },
            polling: PollingPolicy::default(),
            rpc: RpcSettings::default(),
            backup: BackupSettings {
                enabled: backup_enabled,
                dir: backups.clone(),
            },
            grace: GraceSettings::default(),
            service_manager: ServiceManagerSettings::default(),
            lock_dir: temp.path().join("lock"),
            env_file: None,
            ignored_values: Vec::new(),
        };
        Fixture {
            _temp: temp,
            settings,
            active,
            backups,
        }
    }

    fn engine(
        fixture: &Fixture,
        heights: Vec<Result<u64, &'static str>>,
        service: Arc<RecordingService>,
        fs: Arc<dyn Filesystem>,
        pause: Arc<RecordingPause>,
    ) -> UpgradeEngine {
        UpgradeEngine::new(
            &fixture.settings,
            Collaborators {
                status_client: Box::new(ScriptedStatusClient::new(heights)),
                service,
                fs,
                digest: Arc::new(Sha256Digest),
                pause,
            },
        )
    }

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|value| Duration::from_secs(*value)).collect()
    }

    #[test]
    fn far_then_near_then_trigger_completes_upgrade() {
        let fixture = fixture(1000, true);
        let service = Arc::new(RecordingService::default());
        let pause = Arc::new(RecordingPause::default());
        let engine = engine(
            &fixture,
            vec![Ok(850), Ok(920), Ok(1000)],
            Arc::clone(&service),
            Arc::new(LocalFilesystem),
            Arc::clone(&pause),
        );

        let report = engine.run().expect("upgrade");

        assert_eq!(report.final_state, UpgradeState::Done);
        assert_eq!(report.trigger_height, 1000);
        assert_eq!(
            report.history,
            vec![
                UpgradeState::Triggered,
                UpgradeState::Stopping,
                UpgradeState::StoppedVerified,
                UpgradeState::BackingUp,
                UpgradeState::Swapping,
                UpgradeState::Starting,
                UpgradeState::StartedVerified,
                UpgradeState::Done,
            ]
        );
        // far, near, stop grace, start grace
        assert_eq!(pause.recorded(), secs(&[30, 1, 5, 5]));
        assert_eq!(fs::read(&fixture.active).expect("active"), b"new-binary");
        assert!(!staging_path(&fixture.active).expect("staging").exists());

        let Some(BackupOutcome::Created(backup)) = report.backup else {
            panic!("expected backup");
        };
        assert!(backup.starts_with(&fixture.backups));
        assert_eq!(fs::read(&backup).expect("backup"), b"old-binary");
        assert_eq!(service.count("stop"), 1);
        assert_eq!(service.count("start"), 1);
    }

    #[test]
    fn overshoot_aborts_without_side_effects() {
        let fixture = fixture(1000, true);
        let service = Arc::new(RecordingService::default());
        let pause = Arc::new(RecordingPause::default());
        let engine = engine(
            &fixture,
            vec![Ok(1001)],
            Arc::clone(&service),
            Arc::new(LocalFilesystem),
            Arc::clone(&pause),
        );

        let err = engine.run().expect_err("safety abort");
        assert_eq!(err.kind, FailureKind::SafetyAbort);
        assert!(service.calls().is_empty());
        assert!(pause.recorded().is_empty());
        assert_eq!(fs::read(&fixture.active).expect("active"), b"old-binary");
        assert!(!fixture.backups.exists());
    }

    #[test]
    fn overshoot_after_waiting_still_aborts() {
        let fixture = fixture(1000, true);
        let service = Arc::new(RecordingService::default());
        let engine = engine(
            &fixture,
            vec![Ok(999), Ok(1002)],
            Arc::clone(&service),
            Arc::new(LocalFilesystem),
            Arc::new(RecordingPause::default()),
        );

        let err = engine.run().expect_err("safety abort");
        assert_eq!(err.kind, FailureKind::SafetyAbort);
        assert!(service.calls().is_empty());
    }

    #[test]
    fn unavailable_poll_sleeps_fallback_interval_then_recovers() {
        let fixture = fixture(1000, false);
        let pause = Arc::new(RecordingPause::default());
        let engine = engine(
            &fixture,
            vec![Err("refused"), Err("refused"), Err("refused"), Ok(1000)],
            Arc::new(RecordingService::default()),
            Arc::new(LocalFilesystem),
            Arc::clone(&pause),
        );

        let height = engine.wait_for_target().expect("reached");
        assert_eq!(height, 1000);
        // two retry delays inside the poll, then exactly one fallback interval
        assert_eq!(pause.recorded(), secs(&[2, 2, 1]));
    }

    #[test]
    fn rename_failure_keeps_original_and_restarts_service() {
        let fixture = fixture(1000, false);
        let service = Arc::new(RecordingService::default());
        let engine = engine(
            &fixture,
            vec![Ok(1000)],
            Arc::clone(&service),
            Arc::new(FailingFilesystem::failing_rename()),
            Arc::new(RecordingPause::default()),
        );

        let err = engine.run().expect_err("swap fails");
        assert_eq!(err.kind, FailureKind::Sequence);
        assert!(err.message.starts_with("FAILED at BACKING_UP"));
        assert_eq!(fs::read(&fixture.active).expect("active"), b"old-binary");
        assert!(!staging_path(&fixture.active).expect("staging").exists());
        assert_eq!(service.calls(), vec!["stop", "is-active", "start"]);
    }

    #[test]
    fn install_failure_keeps_original_and_restarts_service() {
        let fixture = fixture(1000, false);
        let service = Arc::new(RecordingService::default());
        let engine = engine(
            &fixture,
            vec![Ok(1000)],
            Arc::clone(&service),
            Arc::new(FailingFilesystem::failing_install()),
            Arc::new(RecordingPause::default()),
        );

        let err = engine.run().expect_err("staging fails");
        assert_eq!(err.kind, FailureKind::Sequence);
        assert!(err.message.starts_with("FAILED at BACKING_UP"), "{}", err.message);
        assert!(err.message.contains("failed staging candidate"));
        assert_eq!(fs::read(&fixture.active).expect("active"), b"old-binary");
        assert!(!staging_path(&fixture.active).expect("staging").exists());
        assert_eq!(service.calls(), vec!["stop", "is-active", "start"]);
    }

    #[test]
    fn candidate_replaced_after_validation_is_not_installed() {
        let mut fixture = fixture(1000, false);
        let candidate = fixture.settings.target.candidate_binary.clone();
        let pinned = Sha256Digest.hex_digest(&candidate).expect("digest");
        fixture.settings.target.expected_sha256 = Some(pinned);
        fs::write(&candidate, b"tampered").expect("overwrite candidate");

        let service = Arc::new(RecordingService::default());
        let engine = engine(
            &fixture,
            vec![Ok(999), Ok(1000)],
            Arc::clone(&service),
            Arc::new(LocalFilesystem),
            Arc::new(RecordingPause::default()),
        );

        let err = engine.run().expect_err("digest mismatch");
        assert_eq!(err.kind, FailureKind::Sequence);
        assert!(err.message.starts_with("FAILED at BACKING_UP"), "{}", err.message);
        assert!(err.message.contains("checksum mismatch"));
        assert_eq!(fs::read(&fixture.active).expect("active"), b"old-binary");
        assert!(!staging_path(&fixture.active).expect("staging").exists());
        assert_eq!(service.calls(), vec!["stop", "is-active", "start"]);
    }

    #[test]
    fn pinned_candidate_left_intact_is_installed() {
        let mut fixture = fixture(1000, false);
        let pinned = Sha256Digest
            .hex_digest(&fixture.settings.target.candidate_binary)
            .expect("digest");
        fixture.settings.target.expected_sha256 = Some(pinned.to_ascii_uppercase());
        let engine = engine(
            &fixture,
            vec![Ok(1000)],
            Arc::new(RecordingService::default()),
            Arc::new(LocalFilesystem),
            Arc::new(RecordingPause::default()),
        );

        let report = engine.run().expect("upgrade");
        assert_eq!(report.final_state, UpgradeState::Done);
        assert_eq!(fs::read(&fixture.active).expect("active"), b"new-binary");
    }

    #[test]
    fn candidate_swapped_for_symlink_is_not_followed() {
        let fixture = fixture(1000, false);
        let candidate = &fixture.settings.target.candidate_binary;
        let elsewhere = candidate.with_file_name("elsewhere");
        fs::write(&elsewhere, b"other-binary").expect("write");
        fs::remove_file(candidate).expect("remove candidate");
        std::os::unix::fs::symlink(&elsewhere, candidate).expect("symlink");

        let service = Arc::new(RecordingService::default());
        let engine = engine(
            &fixture,
            vec![Ok(1000)],
            Arc::clone(&service),
            Arc::new(LocalFilesystem),
            Arc::new(RecordingPause::default()),
        );

        let err = engine.run().expect_err("symlinked candidate");
        assert!(err.message.starts_with("FAILED at BACKING_UP"), "{}", err.message);
        assert_eq!(fs::read(&fixture.active).expect("active"), b"old-binary");
        assert_eq!(service.count("start"), 1);
    }

    #[test]
    fn failing_start_command_is_retried_once_as_rollback() {
        let fixture = fixture(1000, false);
        let service = Arc::new(RecordingService {
            fail_start: true,
            ..RecordingService::default()
        });
        let engine = engine(
            &fixture,
            vec![Ok(1000)],
            Arc::clone(&service),
            Arc::new(LocalFilesystem),
            Arc::new(RecordingPause::default()),
        );

        let err = engine.run().expect_err("start fails");
        assert_eq!(err.kind, FailureKind::Sequence);
        assert!(err.message.starts_with("FAILED at SWAPPING"), "{}", err.message);
        assert!(err.message.contains("start failed"));
        assert_eq!(service.calls(), vec!["stop", "is-active", "start", "start"]);
        assert_eq!(fs::read(&fixture.active).expect("active"), b"new-binary");
    }

    #[test]
    fn start_verification_failure_rolls_back_once() {
        let fixture = fixture(1000, false);
        let service = Arc::new(RecordingService {
            never_becomes_active: true,
            ..RecordingService::default()
        });
        let engine = engine(
            &fixture,
            vec![Ok(1000)],
            Arc::clone(&service),
            Arc::new(LocalFilesystem),
            Arc::new(RecordingPause::default()),
        );

        let err = engine.run().expect_err("start verification fails");
        assert_eq!(err.kind, FailureKind::Sequence);
        assert!(err.message.starts_with("FAILED at STARTING"), "{}", err.message);
        assert_eq!(service.count("start"), 2);
        assert_eq!(fs::read(&fixture.active).expect("active"), b"new-binary");
        assert!(!fixture.backups.exists());
    }

    #[test]
    fn stop_failure_is_not_retried_and_not_rolled_back() {
        let fixture = fixture(1000, true);
        let service = Arc::new(RecordingService {
            fail_stop: true,
            ..RecordingService::default()
        });
        let engine = engine(
            &fixture,
            vec![Ok(1000)],
            Arc::clone(&service),
            Arc::new(LocalFilesystem),
            Arc::new(RecordingPause::default()),
        );

        let err = engine.run().expect_err("stop fails");
        assert!(err.message.starts_with("FAILED at TRIGGERED"));
        assert_eq!(service.calls(), vec!["stop"]);
    }

    #[test]
    fn service_that_keeps_running_blocks_the_swap() {
        let fixture = fixture(1000, true);
        let service = Arc::new(RecordingService {
            ignores_stop: true,
            ..RecordingService::default()
        });
        let engine = engine(
            &fixture,
            vec![Ok(1000)],
            Arc::clone(&service),
            Arc::new(LocalFilesystem),
            Arc::new(RecordingPause::default()),
        );

        let err = engine.run().expect_err("still active");
        assert!(err.message.starts_with("FAILED at STOPPING"));
        assert_eq!(fs::read(&fixture.active).expect("active"), b"old-binary");
        assert_eq!(service.count("start"), 1);
    }

    #[test]
    fn backup_failure_aborts_before_swap() {
        let fixture = fixture(1000, true);
        let service = Arc::new(RecordingService::default());
        let engine = engine(
            &fixture,
            vec![Ok(1000)],
            Arc::clone(&service),
            Arc::new(FailingFilesystem::failing_copy()),
            Arc::new(RecordingPause::default()),
        );

        let err = engine.run().expect_err("backup fails");
        assert!(err.message.starts_with("FAILED at STOPPED_VERIFIED"));
        assert_eq!(fs::read(&fixture.active).expect("active"), b"old-binary");
        assert_eq!(service.count("start"), 1);
    }

    #[test]
    fn fresh_install_skips_backup_and_installs_candidate() {
        let fixture = fixture(1000, true);
        fs::remove_file(&fixture.active).expect("remove active");
        let engine = engine(
            &fixture,
            vec![Ok(1000)],
            Arc::new(RecordingService::default()),
            Arc::new(LocalFilesystem),
            Arc::new(RecordingPause::default()),
        );

        let report = engine.run().expect("upgrade");
        assert!(matches!(report.backup, Some(BackupOutcome::Skipped(_))));
        assert_eq!(fs::read(&fixture.active).expect("active"), b"new-binary");
    }

    #[test]
    fn interrupt_while_waiting_has_no_side_effects() {
        let fixture = fixture(1000, true);
        let service = Arc::new(RecordingService::default());
        let engine = engine(
            &fixture,
            vec![Ok(10), Ok(20)],
            Arc::clone(&service),
            Arc::new(LocalFilesystem),
            Arc::new(RecordingPause::interrupting_after(1)),
        );

        let err = engine.run().expect_err("interrupted");
        assert_eq!(err.kind, FailureKind::Interrupted);
        assert!(service.calls().is_empty());
    }

    #[test]
    fn interrupt_during_stop_grace_restarts_service() {
        let fixture = fixture(1000, true);
        let service = Arc::new(RecordingService::default());
        let engine = engine(
            &fixture,
            vec![Ok(1000)],
            Arc::clone(&service),
            Arc::new(LocalFilesystem),
            Arc::new(RecordingPause::interrupting_after(1)),
        );

        let err = engine.run().expect_err("interrupted");
        assert_eq!(err.kind, FailureKind::Interrupted);
        assert!(err.message.starts_with("FAILED at STOPPING"));
        assert_eq!(service.calls(), vec!["stop", "start"]);
        assert_eq!(fs::read(&fixture.active).expect("active"), b"old-binary");
    }

    #[test]
    fn rollback_predicate_tracks_stop_and_start_verification() {
        let mut run = UpgradeRun::new(5);
        assert!(!run.needs_rollback_start());
        run.service_stopped = true;
        run.reach(UpgradeState::Stopping);
        assert!(run.needs_rollback_start());
        run.reach(UpgradeState::Swapping);
        run.fail();
        assert!(run.needs_rollback_start());
        assert_eq!(run.failed_at, Some(UpgradeState::Swapping));

        let mut verified = UpgradeRun::new(5);
        verified.service_stopped = true;
        verified.reach(UpgradeState::StartedVerified);
        verified.fail();
        assert!(!verified.needs_rollback_start());
    }

    #[test]
    fn staging_path_is_hidden_sibling() {
        assert_eq!(
            staging_path(Path::new("/usr/local/bin/node")).expect("path"),
            PathBuf::from("/usr/local/bin/.node.upgrade-tmp")
        );
        assert_eq!(
            staging_path(Path::new("node")).expect("path"),
            PathBuf::from("./.node.upgrade-tmp")
        );
        assert!(staging_path(Path::new("/")).is_err());
    }
}
