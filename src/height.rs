use std::process::{Command, Output};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{PollingPolicy, RpcSettings};
use crate::error::UpgradeFailure;
use crate::pause::Pause;

/// Wire-level status query; one call is one attempt.
pub trait StatusClient: Send + Sync {
    fn latest_height(&self, endpoint: &str) -> Result<u64>;
}

#[derive(Debug, Clone)]
pub struct CurlStatusClient {
    curl_bin: String,
    connect_timeout_secs: u64,
    request_timeout_secs: u64,
}

impl CurlStatusClient {
    pub fn new(rpc: &RpcSettings) -> Self {
        Self {
            curl_bin: "curl".to_string(),
            connect_timeout_secs: rpc.connect_timeout_secs.max(1),
            request_timeout_secs: rpc.request_timeout_secs.max(1),
        }
    }

    pub fn with_curl_bin(mut self, curl_bin: impl Into<String>) -> Self {
        self.curl_bin = curl_bin.into();
        self
    }
}

impl StatusClient for CurlStatusClient {
    fn latest_height(&self, endpoint: &str) -> Result<u64> {
        let url = format!("{}/status", endpoint.trim_end_matches('/'));
        let output = Command::new(&self.curl_bin)
            .arg("-sS")
            .arg("--fail")
            .arg("--connect-timeout")
            .arg(self.connect_timeout_secs.to_string())
            .arg("-m")
            .arg(self.request_timeout_secs.to_string())
            .arg(&url)
            .output()
            .with_context(|| format!("failed to execute {} for {}", self.curl_bin, url))?;

        if !output.status.success() {
            return Err(anyhow!(
                "status query failed for {}: {}",
                url,
                describe_curl_failure(&output)
            ));
        }

        let raw = String::from_utf8(output.stdout).context("status endpoint returned non-utf8")?;
        parse_latest_block_height(&raw)
    }
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    result: Option<StatusResult>,
    sync_info: Option<SyncInfo>,
}

#[derive(Debug, Deserialize)]
struct StatusResult {
    sync_info: Option<SyncInfo>,
}

#[derive(Debug, Deserialize)]
struct SyncInfo {
    latest_block_height: Option<Value>,
}

/// Accepts both the JSON-RPC envelope (`result.sync_info`) and a bare `sync_info`.
pub fn parse_latest_block_height(raw: &str) -> Result<u64> {
    let payload: StatusResponse =
        serde_json::from_str(raw).context("failed to decode status payload")?;
    let sync_info = payload
        .result
        .and_then(|result| result.sync_info)
        .or(payload.sync_info)
        .ok_or_else(|| anyhow!("status payload is missing sync_info"))?;
    let value = sync_info
        .latest_block_height
        .ok_or_else(|| anyhow!("status payload is missing latest_block_height"))?;

    let height = match &value {
        Value::String(text) => text
            .trim()
            .parse::<u64>()
            .map_err(|_| anyhow!("latest_block_height is not a non-negative integer: {:?}", text))?,
        Value::Number(number) => number
            .as_u64()
            .ok_or_else(|| anyhow!("latest_block_height is not a non-negative integer: {}", number))?,
        other => return Err(anyhow!("latest_block_height has unexpected type: {}", other)),
    };
    if height == 0 {
        return Err(anyhow!("latest_block_height is zero; node is not serving blocks yet"));
    }
    Ok(height)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Height(u64),
    Unavailable { attempts: u32, last_error: String },
}

pub struct HeightSource {
    client: Box<dyn StatusClient>,
    endpoint: String,
    attempts: u32,
    retry_delay: Duration,
    pause: Arc<dyn Pause>,
}

impl HeightSource {
    pub fn new(
        client: Box<dyn StatusClient>,
        endpoint: impl Into<String>,
        policy: &PollingPolicy,
        pause: Arc<dyn Pause>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            attempts: policy.attempts(),
            retry_delay: policy.retry_delay(),
            pause,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Exhausted retries are an `Unavailable` outcome; only an interrupt is an error.
    pub fn poll(&self) -> Result<PollOutcome, UpgradeFailure> {
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            self.pause.check()?;
            match self.client.latest_height(&self.endpoint) {
                Ok(0) => {
                    last_error = "status endpoint reported height 0".to_string();
                }
                Ok(height) => {
                    debug!(attempt = attempt, height = height, "height query succeeded");
                    return Ok(PollOutcome::Height(height));
                }
                Err(err) => {
                    last_error = format!("{:#}", err);
                }
            }

            if attempt < self.attempts {
                debug!(
                    attempt = attempt,
                    total_attempts = self.attempts,
                    delay_secs = self.retry_delay.as_secs(),
                    error = %last_error,
                    "height query failed, retrying"
                );
                self.pause.pause(self.retry_delay)?;
            }
        }

        warn!(
            attempts = self.attempts,
            endpoint = %self.endpoint,
            error = %last_error,
            "height query exhausted retries"
        );
        Ok(PollOutcome::Unavailable {
            attempts: self.attempts,
            last_error,
        })
    }
}

/// Latest good height plus the run of consecutive unavailable polls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedHeight {
    pub latest: Option<u64>,
    pub consecutive_failures: u32,
}

impl ObservedHeight {
    pub fn record_success(&mut self, height: u64) {
        self.latest = Some(height);
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }
}

fn describe_curl_failure(output: &Output) -> String {
    let code = output
        .status
        .code()
        .map(|value| value.to_string())
        .unwrap_or_else(|| "signal".to_string());
    let stderr = truncate_for_log(&String::from_utf8_lossy(&output.stderr), 300);
    format!("code={} stderr={}", code, stderr.trim())
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    let mut out = String::new();
    for (i, ch) in value.chars().enumerate() {
        if i >= max_chars {
            out.push_str("...");
            break;
        }
        out.push(ch);
    }
    out
}
