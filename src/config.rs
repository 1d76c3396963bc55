use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::error::UpgradeFailure;
use crate::validator::{normalize_sha256_hex, BinaryValidator};

const ENV_FILE_ENV: &str = "HEIGHT_UPGRADE_ENV_FILE";

pub const DEFAULT_RPC_ENDPOINT: &str = "http://127.0.0.1:26657";
pub const DEFAULT_SERVICE_ID: &str = "node";
pub const DEFAULT_ACTIVE_BINARY: &str = "/usr/local/bin/node";
pub const DEFAULT_BACKUP_DIR: &str = "/var/backups/height-upgrade";
pub const DEFAULT_LOCK_DIR: &str = "/run/height-upgrade";

#[derive(Debug, Clone)]
pub struct Settings {
    pub target: UpgradeTarget,
    pub polling: PollingPolicy,
    pub rpc: RpcSettings,
    pub backup: BackupSettings,
    pub grace: GraceSettings,
    pub service_manager: ServiceManagerSettings,
    pub lock_dir: PathBuf,
    pub env_file: Option<PathBuf>,
    /// Keys whose values could not be parsed and fell back to defaults.
    pub ignored_values: Vec<String>,
}

/// Resolved once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeTarget {
    pub target_height: u64,
    pub rpc_endpoint: String,
    pub service_id: String,
    pub candidate_binary: PathBuf,
    pub active_binary: PathBuf,
    pub expected_sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingPolicy {
    pub threshold_blocks: u64,
    pub far_interval_secs: u64,
    pub near_interval_secs: u64,
    pub fallback_interval_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self {
            threshold_blocks: 100,
            far_interval_secs: 30,
            near_interval_secs: 1,
            fallback_interval_secs: 1,
            retry_attempts: 3,
            retry_delay_secs: 2,
        }
    }
}

impl PollingPolicy {
    /// Far cadence strictly above the threshold, near cadence at or below it.
    pub fn interval_for(&self, blocks_remaining: u64) -> Duration {
        if blocks_remaining > self.threshold_blocks {
            Duration::from_secs(self.far_interval_secs)
        } else {
            Duration::from_secs(self.near_interval_secs)
        }
    }

    pub fn fallback_interval(&self) -> Duration {
        Duration::from_secs(self.fallback_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn attempts(&self) -> u32 {
        self.retry_attempts.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcSettings {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 1,
            request_timeout_secs: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSettings {
    pub enabled: bool,
    pub dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraceSettings {
    pub stop_grace_secs: u64,
    pub start_grace_secs: u64,
}

impl Default for GraceSettings {
    fn default() -> Self {
        Self {
            stop_grace_secs: 5,
            start_grace_secs: 5,
        }
    }
}

impl GraceSettings {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn start_grace(&self) -> Duration {
        Duration::from_secs(self.start_grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceManagerSettings {
    pub systemctl_bin: String,
    pub user_scope: bool,
}

impl Default for ServiceManagerSettings {
    fn default() -> Self {
        Self {
            systemctl_bin: "systemctl".to_string(),
            user_scope: false,
        }
    }
}

impl Settings {
    /// Reads the process environment (after the optional companion file) exactly once.
    pub fn load() -> Result<Self, UpgradeFailure> {
        let env_file = load_env_file()?;
        let mut ignored_values = Vec::new();

        let target = load_upgrade_target().map_err(UpgradeFailure::from_config_error)?;

        let defaults = PollingPolicy::default();
        let polling = PollingPolicy {
            threshold_blocks: read_u64_env(
                "HEIGHT_UPGRADE_DYNAMIC_THRESHOLD_BLOCKS",
                defaults.threshold_blocks,
                &mut ignored_values,
            ),
            far_interval_secs: read_u64_env(
                "HEIGHT_UPGRADE_FAR_INTERVAL_SECS",
                defaults.far_interval_secs,
                &mut ignored_values,
            ),
            near_interval_secs: read_u64_env(
                "HEIGHT_UPGRADE_NEAR_INTERVAL_SECS",
                defaults.near_interval_secs,
                &mut ignored_values,
            ),
            fallback_interval_secs: read_u64_env(
                "HEIGHT_UPGRADE_FALLBACK_INTERVAL_SECS",
                defaults.fallback_interval_secs,
                &mut ignored_values,
            ),
            retry_attempts: read_u32_env(
                "HEIGHT_UPGRADE_RPC_RETRIES",
                defaults.retry_attempts,
                &mut ignored_values,
            ),
            retry_delay_secs: read_u64_env(
                "HEIGHT_UPGRADE_RPC_RETRY_DELAY_SECS",
                defaults.retry_delay_secs,
                &mut ignored_values,
            ),
        };

        let rpc_defaults = RpcSettings::default();
        let rpc = RpcSettings {
            connect_timeout_secs: read_u64_env(
                "HEIGHT_UPGRADE_RPC_CONNECT_TIMEOUT_SECS",
                rpc_defaults.connect_timeout_secs,
                &mut ignored_values,
            ),
            request_timeout_secs: read_u64_env(
                "HEIGHT_UPGRADE_RPC_TIMEOUT_SECS",
                rpc_defaults.request_timeout_secs,
                &mut ignored_values,
            ),
        };

        let backup = BackupSettings {
            enabled: read_bool_env("HEIGHT_UPGRADE_BACKUP_ENABLED", true, &mut ignored_values),
            dir: read_path_env("HEIGHT_UPGRADE_BACKUP_DIR", DEFAULT_BACKUP_DIR),
        };

        let grace_defaults = GraceSettings::default();
        let grace = GraceSettings {
            stop_grace_secs: read_u64_env(
                "HEIGHT_UPGRADE_STOP_GRACE_SECS",
                grace_defaults.stop_grace_secs,
                &mut ignored_values,
            ),
            start_grace_secs: read_u64_env(
                "HEIGHT_UPGRADE_START_GRACE_SECS",
                grace_defaults.start_grace_secs,
                &mut ignored_values,
            ),
        };

        let service_manager = ServiceManagerSettings {
            systemctl_bin: read_non_empty_env("HEIGHT_UPGRADE_SYSTEMCTL_BIN")
                .unwrap_or_else(|| "systemctl".to_string()),
            user_scope: read_bool_env("HEIGHT_UPGRADE_SYSTEMCTL_USER", false, &mut ignored_values),
        };

        let lock_dir = read_path_env("HEIGHT_UPGRADE_LOCK_DIR", DEFAULT_LOCK_DIR);

        Ok(Self {
            target,
            polling,
            rpc,
            backup,
            grace,
            service_manager,
            lock_dir,
            env_file,
            ignored_values,
        })
    }

    pub fn doctor_report(&self) -> DoctorReport {
        let mut warnings = Vec::new();

        if self.target.candidate_binary == self.target.active_binary {
            warnings.push(
                "HEIGHT_UPGRADE_CANDIDATE_BINARY equals HEIGHT_UPGRADE_ACTIVE_BINARY; the swap would replace the binary with itself"
                    .to_string(),
            );
        }
        if self.polling.near_interval_secs > self.polling.far_interval_secs {
            warnings.push(
                "HEIGHT_UPGRADE_NEAR_INTERVAL_SECS is larger than HEIGHT_UPGRADE_FAR_INTERVAL_SECS; polling slows down near the target"
                    .to_string(),
            );
        }
        if self.polling.retry_attempts == 0 {
            warnings.push(
                "HEIGHT_UPGRADE_RPC_RETRIES=0 is clamped to a single attempt per poll".to_string(),
            );
        }
        if self.rpc.request_timeout_secs < self.rpc.connect_timeout_secs {
            warnings.push(
                "HEIGHT_UPGRADE_RPC_TIMEOUT_SECS should be >= HEIGHT_UPGRADE_RPC_CONNECT_TIMEOUT_SECS"
                    .to_string(),
            );
        }
        if !self.backup.enabled {
            warnings.push(
                "HEIGHT_UPGRADE_BACKUP_ENABLED=false; no recovery copy of the active binary will be kept"
                    .to_string(),
            );
        }
        if self.target.expected_sha256.is_none() {
            warnings.push(
                "HEIGHT_UPGRADE_EXPECTED_SHA256 is not set; candidate content is not pinned"
                    .to_string(),
            );
        }
        for key in &self.ignored_values {
            warnings.push(format!("{} has an unparseable value; default used", key));
        }

        DoctorReport {
            target_height: self.target.target_height,
            rpc_endpoint: self.target.rpc_endpoint.clone(),
            service_id: self.target.service_id.clone(),
            candidate_binary: self.target.candidate_binary.clone(),
            active_binary: self.target.active_binary.clone(),
            expected_sha256_loaded: self.target.expected_sha256.is_some(),
            threshold_blocks: self.polling.threshold_blocks,
            far_interval_secs: self.polling.far_interval_secs,
            near_interval_secs: self.polling.near_interval_secs,
            fallback_interval_secs: self.polling.fallback_interval_secs,
            retry_attempts: self.polling.attempts(),
            retry_delay_secs: self.polling.retry_delay_secs,
            backup_enabled: self.backup.enabled,
            backup_dir: self.backup.dir.clone(),
            lock_dir: self.lock_dir.clone(),
            env_file: self.env_file.clone(),
            warnings,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DoctorReport {
    pub target_height: u64,
    pub rpc_endpoint: String,
    pub service_id: String,
    pub candidate_binary: PathBuf,
    pub active_binary: PathBuf,
    pub expected_sha256_loaded: bool,
    pub threshold_blocks: u64,
    pub far_interval_secs: u64,
    pub near_interval_secs: u64,
    pub fallback_interval_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
    pub backup_enabled: bool,
    pub backup_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub env_file: Option<PathBuf>,
    pub warnings: Vec<String>,
}

fn load_upgrade_target() -> Result<UpgradeTarget> {
    let raw_height = read_non_empty_env("HEIGHT_UPGRADE_TARGET_HEIGHT")
        .ok_or_else(|| anyhow!("HEIGHT_UPGRADE_TARGET_HEIGHT is required"))?;
    let target_height = raw_height.parse::<u64>().map_err(|_| {
        anyhow!(
            "HEIGHT_UPGRADE_TARGET_HEIGHT must be a positive integer, got '{}'",
            raw_height
        )
    })?;
    if target_height == 0 {
        return Err(anyhow!("HEIGHT_UPGRADE_TARGET_HEIGHT must be > 0"));
    }

    let candidate_binary = read_non_empty_env("HEIGHT_UPGRADE_CANDIDATE_BINARY")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("HEIGHT_UPGRADE_CANDIDATE_BINARY is required"))?;

    let service_id = read_non_empty_env("HEIGHT_UPGRADE_SERVICE")
        .unwrap_or_else(|| DEFAULT_SERVICE_ID.to_string());
    let service_id = normalize_service_id(&service_id)?;

    let expected_sha256 = read_non_empty_env("HEIGHT_UPGRADE_EXPECTED_SHA256")
        .map(|value| normalize_sha256_hex(&value))
        .transpose()
        .context("invalid HEIGHT_UPGRADE_EXPECTED_SHA256")?;

    let rpc_endpoint = read_non_empty_env("HEIGHT_UPGRADE_RPC_ENDPOINT")
        .unwrap_or_else(|| DEFAULT_RPC_ENDPOINT.to_string())
        .trim_end_matches('/')
        .to_string();

    Ok(UpgradeTarget {
        target_height,
        rpc_endpoint,
        service_id,
        candidate_binary,
        active_binary: read_path_env("HEIGHT_UPGRADE_ACTIVE_BINARY", DEFAULT_ACTIVE_BINARY),
        expected_sha256,
    })
}

/// Service ids end up in lock and backup file names, so path separators are refused.
pub fn normalize_service_id(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("service id is empty"));
    }
    if trimmed.starts_with('.') {
        return Err(anyhow!("service id must not start with '.'"));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
    {
        return Err(anyhow!(
            "invalid service id '{}'. allowed chars: A-Z, a-z, 0-9, '-', '_', '.' and '@'",
            trimmed
        ));
    }
    Ok(trimmed.to_string())
}

fn read_non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn read_path_env(key: &str, default: &str) -> PathBuf {
    read_non_empty_env(key)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

fn read_u64_env(key: &str, default: u64, ignored: &mut Vec<String>) -> u64 {
    let Some(value) = read_non_empty_env(key) else {
        return default;
    };
    value.parse::<u64>().unwrap_or_else(|_| {
        ignored.push(key.to_string());
        default
    })
}

fn read_u32_env(key: &str, default: u32, ignored: &mut Vec<String>) -> u32 {
    let Some(value) = read_non_empty_env(key) else {
        return default;
    };
    value.parse::<u32>().unwrap_or_else(|_| {
        ignored.push(key.to_string());
        default
    })
}

fn read_bool_env(key: &str, default: bool, ignored: &mut Vec<String>) -> bool {
    let Some(value) = read_non_empty_env(key) else {
        return default;
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            ignored.push(key.to_string());
            default
        }
    }
}

fn load_env_file() -> Result<Option<PathBuf>, UpgradeFailure> {
    let Some(path) = read_non_empty_env(ENV_FILE_ENV) else {
        return Ok(None);
    };
    let path = PathBuf::from(path);
    BinaryValidator::for_current_user().validate_settings_file(&path)?;
    load_dotenv_from(&path).map_err(UpgradeFailure::from_config_error)?;
    Ok(Some(path))
}

fn load_dotenv_from(path: &Path) -> Result<()> {
    dotenvy::from_path(path)
        .with_context(|| format!("failed loading {} from {}", ENV_FILE_ENV, path.display()))
}
