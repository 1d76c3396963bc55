use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use fs2::FileExt;
use tracing::debug;

use crate::error::UpgradeFailure;

/// Exclusive advisory lock for one service id. Released when dropped or when the process dies.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

#[derive(Debug)]
pub enum LockOutcome {
    Acquired(InstanceLock),
    /// Another instance holds the lock; `holder` is its diagnostic line, if readable.
    Busy { path: PathBuf, holder: Option<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct LockHolder {
    pid: Option<u32>,
    started_at: Option<String>,
}

impl InstanceLock {
    pub fn acquire(lock_dir: &Path, service_id: &str) -> Result<LockOutcome, UpgradeFailure> {
        prepare_lock_dir(lock_dir).map_err(UpgradeFailure::from_config_error)?;
        let path = lock_dir.join(format!("{}.lock", service_id));

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .custom_flags(nix::libc::O_NOFOLLOW)
            .open(&path)
            .with_context(|| format!("failed opening instance lock {}", path.display()))
            .map_err(UpgradeFailure::from_config_error)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                let holder = read_lock_holder(&path).map(|holder| format_lock_holder(&holder));
                debug!(
                    lock = %path.display(),
                    holder = holder.as_deref().unwrap_or("unknown"),
                    "instance lock is held elsewhere"
                );
                return Ok(LockOutcome::Busy { path, holder });
            }
            Err(err) => {
                return Err(UpgradeFailure::configuration(format!(
                    "failed acquiring instance lock {}: {}",
                    path.display(),
                    err
                )));
            }
        }

        let details = format!(
            "pid={} started_at={}\n",
            std::process::id(),
            Utc::now().to_rfc3339()
        );
        file.set_len(0)
            .and_then(|_| file.write_all(details.as_bytes()))
            .and_then(|_| file.flush())
            .with_context(|| format!("failed writing instance lock {}", path.display()))
            .map_err(UpgradeFailure::from_config_error)?;

        debug!(lock = %path.display(), "instance lock acquired");
        Ok(LockOutcome::Acquired(Self { file, path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // The lock file itself is never removed.
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(lock = %self.path.display(), error = %err, "instance lock release failed");
        }
    }
}

fn prepare_lock_dir(lock_dir: &Path) -> Result<()> {
    match fs::symlink_metadata(lock_dir) {
        Ok(metadata) => {
            if metadata.file_type().is_symlink() {
                return Err(anyhow!(
                    "lock directory {} is a symbolic link; refusing to use it",
                    lock_dir.display()
                ));
            }
            if !metadata.is_dir() {
                return Err(anyhow!(
                    "lock directory {} is not a directory",
                    lock_dir.display()
                ));
            }
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(lock_dir)
            .with_context(|| format!("failed creating lock directory {}", lock_dir.display())),
        Err(err) => Err(err)
            .with_context(|| format!("failed reading lock directory {}", lock_dir.display())),
    }
}

fn read_lock_holder(path: &Path) -> Option<LockHolder> {
    let raw = fs::read_to_string(path).ok()?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let mut holder = LockHolder::default();
    for token in raw.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        match key {
            "pid" => holder.pid = value.trim().parse::<u32>().ok(),
            "started_at" if !value.trim().is_empty() => {
                holder.started_at = Some(value.trim().to_string());
            }
            _ => {}
        }
    }
    if holder == LockHolder::default() {
        return None;
    }
    Some(holder)
}

fn format_lock_holder(holder: &LockHolder) -> String {
    let mut parts = Vec::new();
    if let Some(pid) = holder.pid {
        parts.push(format!("pid={}", pid));
    }
    if let Some(started_at) = holder.started_at.as_deref() {
        parts.push(format!("started_at={}", started_at));
    }
    parts.join(" ")
}
