//! Scripted collaborators for unit tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::error::UpgradeFailure;
use crate::fsops::{EntryKind, Filesystem, LocalFilesystem};
use crate::height::StatusClient;
use crate::pause::Pause;
use crate::service::ServiceController;

/// Pauses are recorded instead of slept. Interrupts after `interrupt_after` pauses, if set.
#[derive(Default)]
pub struct RecordingPause {
    recorded: Mutex<Vec<Duration>>,
    interrupted: AtomicBool,
    interrupt_after: Option<usize>,
}

impl RecordingPause {
    pub fn interrupting_after(pauses: usize) -> Self {
        Self {
            interrupt_after: Some(pauses),
            ..Self::default()
        }
    }

    pub fn recorded(&self) -> Vec<Duration> {
        self.recorded.lock().expect("pause log").clone()
    }
}

impl Pause for RecordingPause {
    fn pause(&self, duration: Duration) -> Result<(), UpgradeFailure> {
        self.check()?;
        let mut recorded = self.recorded.lock().expect("pause log");
        recorded.push(duration);
        let limit = self.interrupt_after.unwrap_or(10_000);
        if recorded.len() >= limit {
            self.interrupted.store(true, Ordering::SeqCst);
            return Err(UpgradeFailure::interrupted("termination signal received"));
        }
        Ok(())
    }

    fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

/// Returns scripted heights in order; errors once the script runs out.
pub struct ScriptedStatusClient {
    script: Mutex<VecDeque<Result<u64, &'static str>>>,
}

impl ScriptedStatusClient {
    pub fn new(script: Vec<Result<u64, &'static str>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
        }
    }
}

impl StatusClient for ScriptedStatusClient {
    fn latest_height(&self, _endpoint: &str) -> Result<u64> {
        match self.script.lock().expect("script").pop_front() {
            Some(Ok(height)) => Ok(height),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("script exhausted")),
        }
    }
}

/// In-memory service that records every call.
pub struct RecordingService {
    pub calls: Mutex<Vec<String>>,
    pub running: AtomicBool,
    pub fail_stop: bool,
    pub fail_start: bool,
    pub ignores_stop: bool,
    pub never_becomes_active: bool,
}

impl Default for RecordingService {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            fail_stop: false,
            fail_start: false,
            ignores_stop: false,
            never_becomes_active: false,
        }
    }
}

impl RecordingService {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.calls().iter().filter(|call| call.as_str() == verb).count()
    }

    fn record(&self, verb: &str) {
        self.calls.lock().expect("calls").push(verb.to_string());
    }
}

impl ServiceController for RecordingService {
    fn stop(&self, _service_id: &str) -> Result<()> {
        self.record("stop");
        if self.fail_stop {
            return Err(anyhow!("stop refused"));
        }
        if !self.ignores_stop {
            self.running.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn start(&self, _service_id: &str) -> Result<()> {
        self.record("start");
        if self.fail_start {
            return Err(anyhow!("start refused"));
        }
        if !self.never_becomes_active {
            self.running.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_active(&self, _service_id: &str) -> Result<bool> {
        self.record("is-active");
        Ok(self.running.load(Ordering::SeqCst))
    }
}

/// Real filesystem with selected operations forced to fail.
#[derive(Default)]
pub struct FailingFilesystem {
    pub fail_copy: bool,
    pub fail_install: bool,
    pub fail_rename: bool,
    /// Reported for every directory instead of looking at the disk.
    pub dir_kind: Option<EntryKind>,
}

impl FailingFilesystem {
    pub fn failing_copy() -> Self {
        Self {
            fail_copy: true,
            ..Self::default()
        }
    }

    pub fn failing_install() -> Self {
        Self {
            fail_install: true,
            ..Self::default()
        }
    }

    pub fn failing_rename() -> Self {
        Self {
            fail_rename: true,
            ..Self::default()
        }
    }
}

impl Filesystem for FailingFilesystem {
    fn exists(&self, path: &Path) -> bool {
        LocalFilesystem.exists(path)
    }

    fn entry_kind(&self, path: &Path) -> Result<EntryKind> {
        let kind = LocalFilesystem.entry_kind(path)?;
        match (kind, self.dir_kind) {
            (EntryKind::Directory, Some(reported)) => Ok(reported),
            _ => Ok(kind),
        }
    }

    fn create_private_dir(&self, path: &Path) -> Result<()> {
        LocalFilesystem.create_private_dir(path)
    }

    fn copy_file(&self, from: &Path, to: &Path, mode: u32) -> Result<u64> {
        if self.fail_copy {
            return Err(anyhow!("injected copy failure"));
        }
        LocalFilesystem.copy_file(from, to, mode)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> Result<()> {
        LocalFilesystem.set_mode(path, mode)
    }

    fn install_file(&self, from: &Path, to: &Path, mode: u32) -> Result<()> {
        if self.fail_install {
            return Err(anyhow!("injected install failure"));
        }
        LocalFilesystem.install_file(from, to, mode)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if self.fail_rename {
            return Err(anyhow!("injected rename failure"));
        }
        LocalFilesystem.rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        LocalFilesystem.remove_file(path)
    }
}

