use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::UpgradeFailure;

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Every suspension point of the orchestrator goes through this seam.
pub trait Pause: Send + Sync {
    /// Sleeps for `duration`, returning early with an interrupted failure on shutdown.
    fn pause(&self, duration: Duration) -> Result<(), UpgradeFailure>;

    fn interrupted(&self) -> bool;

    fn check(&self) -> Result<(), UpgradeFailure> {
        if self.interrupted() {
            return Err(UpgradeFailure::interrupted(
                "termination signal received",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownAwarePause {
    shutdown: Arc<AtomicBool>,
}

impl ShutdownAwarePause {
    pub fn new(shutdown: Arc<AtomicBool>) -> Self {
        Self { shutdown }
    }

    /// Installs a SIGINT/SIGTERM handler that only flips the shared flag.
    pub fn install_signal_handler() -> anyhow::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let signal_flag = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            signal_flag.store(true, Ordering::SeqCst);
            tracing::warn!(action = "graceful_stop", "termination signal received");
        })?;
        Ok(Self::new(shutdown))
    }
}

impl Pause for ShutdownAwarePause {
    fn pause(&self, duration: Duration) -> Result<(), UpgradeFailure> {
        let started = Instant::now();
        loop {
            self.check()?;
            let elapsed = started.elapsed();
            if elapsed >= duration {
                return Ok(());
            }
            thread::sleep((duration - elapsed).min(SLEEP_SLICE));
        }
    }

    fn interrupted(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
