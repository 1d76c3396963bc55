use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use crate::config::ServiceManagerSettings;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(90);
const COMMAND_POLL: Duration = Duration::from_millis(50);

/// Init-system control over the managed service.
pub trait ServiceController: Send + Sync {
    fn stop(&self, service_id: &str) -> Result<()>;
    fn start(&self, service_id: &str) -> Result<()>;
    fn is_active(&self, service_id: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct SystemctlController {
    program: String,
    user_scope: bool,
    timeout: Duration,
}

impl SystemctlController {
    pub fn new(settings: &ServiceManagerSettings) -> Self {
        Self {
            program: settings.systemctl_bin.clone(),
            user_scope: settings.user_scope,
            timeout: COMMAND_TIMEOUT,
        }
    }

    fn command(&self, verb: &str, service_id: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        if self.user_scope {
            cmd.arg("--user");
        }
        cmd.arg(verb);
        if verb == "is-active" {
            cmd.arg("--quiet");
        }
        cmd.arg(service_id);
        cmd
    }

    fn run_checked(&self, verb: &str, service_id: &str) -> Result<()> {
        let result = run_quiet_command(self.command(verb, service_id), self.timeout)
            .with_context(|| format!("failed to execute {} {} {}", self.program, verb, service_id))?;
        if !result.success() {
            return Err(anyhow!(
                "{} {} {} failed: {}",
                self.program,
                verb,
                service_id,
                result.describe()
            ));
        }
        debug!(verb = verb, service = service_id, "service manager command succeeded");
        Ok(())
    }
}

impl ServiceController for SystemctlController {
    fn stop(&self, service_id: &str) -> Result<()> {
        self.run_checked("stop", service_id)
    }

    fn start(&self, service_id: &str) -> Result<()> {
        self.run_checked("start", service_id)
    }

    /// A non-zero `is-active --quiet` status means "not active", not a failure.
    fn is_active(&self, service_id: &str) -> Result<bool> {
        let result = run_quiet_command(self.command("is-active", service_id), self.timeout)
            .with_context(|| {
                format!("failed to execute {} is-active {}", self.program, service_id)
            })?;
        Ok(result.success())
    }
}

struct CommandExecResult {
    status: ExitStatus,
    stderr: String,
}

impl CommandExecResult {
    fn success(&self) -> bool {
        self.status.success()
    }

    fn describe(&self) -> String {
        let code = self
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |code| code.to_string());
        if self.stderr.is_empty() {
            format!("code={}", code)
        } else {
            format!("code={} stderr={}", code, self.stderr)
        }
    }
}

fn run_quiet_command(mut command: Command, timeout: Duration) -> Result<CommandExecResult> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(anyhow!("command timed out after {}s", timeout.as_secs()));
        }
        thread::sleep(COMMAND_POLL);
    };

    let mut stderr = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        let _ = pipe.read_to_string(&mut stderr);
    }

    Ok(CommandExecResult {
        status,
        stderr: stderr.trim().to_string(),
    })
}
