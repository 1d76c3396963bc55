use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::BackupSettings;
use crate::error::UpgradeFailure;
use crate::fsops::{EntryKind, Filesystem};

const BACKUP_MODE: u32 = 0o600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    Created(PathBuf),
    Skipped(String),
}

pub struct BackupManager {
    enabled: bool,
    dir: PathBuf,
    fs: Arc<dyn Filesystem>,
}

impl BackupManager {
    pub fn new(settings: &BackupSettings, fs: Arc<dyn Filesystem>) -> Self {
        Self {
            enabled: settings.enabled,
            dir: settings.dir.clone(),
            fs,
        }
    }

    pub fn backup(&self, active: &Path, service_id: &str) -> Result<BackupOutcome, UpgradeFailure> {
        self.backup_at(active, service_id, Utc::now())
    }

    fn backup_at(
        &self,
        active: &Path,
        service_id: &str,
        now: DateTime<Utc>,
    ) -> Result<BackupOutcome, UpgradeFailure> {
        if !self.enabled {
            info!(service = service_id, "backup disabled; skipping");
            return Ok(BackupOutcome::Skipped("backup disabled".to_string()));
        }
        if !self.fs.exists(active) {
            info!(
                active = %active.display(),
                "active executable absent; nothing to back up"
            );
            return Ok(BackupOutcome::Skipped(format!(
                "active executable {} does not exist",
                active.display()
            )));
        }

        let destination = self.dir.join(backup_file_name(service_id, now));
        self.copy_into_backup_dir(active, &destination)
            .map_err(|err| UpgradeFailure::sequence(format!("backup failed: {:#}", err)))?;

        info!(
            active = %active.display(),
            backup = %destination.display(),
            "active executable backed up"
        );
        Ok(BackupOutcome::Created(destination))
    }

    fn copy_into_backup_dir(&self, active: &Path, destination: &Path) -> Result<()> {
        match self.fs.entry_kind(&self.dir)? {
            EntryKind::Directory => {}
            EntryKind::Missing => self.fs.create_private_dir(&self.dir)?,
            EntryKind::Symlink => {
                return Err(anyhow!(
                    "backup directory {} is a symbolic link; refusing to use it",
                    self.dir.display()
                ));
            }
            EntryKind::File | EntryKind::Other => {
                return Err(anyhow!(
                    "backup directory {} is not a directory",
                    self.dir.display()
                ));
            }
        }

        self.fs.copy_file(active, destination, BACKUP_MODE)?;
        Ok(())
    }
}

pub fn backup_file_name(service_id: &str, now: DateTime<Utc>) -> String {
    format!("{}-{}.bak", service_id, now.format("%Y%m%d%H%M%S"))
}
