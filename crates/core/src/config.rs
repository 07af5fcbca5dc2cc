//! Configuration management for Aegis nodes and verifiers.
//!
//! Configuration is read from a TOML file, then selectively overridden from
//! `AEGIS_*` environment variables, then validated. Any validation failure is
//! a [`CoreError::Config`] and is fatal at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CoreError, Result};

/// Number of PCRs in a TPM 2.0 SHA-256 bank.
pub const PCR_COUNT: u8 = 24;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub tpm: TpmConfig,
    pub verifier: VerifierConfig,
    pub renewal: RenewalConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// In-process simulated TPM. Development and tests only.
    #[default]
    Software,
    /// Kernel TPM resource manager via the TSS stack.
    Hardware,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable node UUID reported by the certification service.
    pub node_uuid: String,
    /// Certification RPC bind address. Must be a loopback address.
    pub listen_addr: String,
    /// Delegated certification requests allowed per caller per minute (0 = unlimited).
    pub certify_rate_limit: u32,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TpmConfig {
    pub device: DeviceKind,
    /// Per-call hardware timeout in milliseconds.
    pub quote_timeout_ms: u64,
    /// Attempts for retryable (`DeviceBusy`) failures.
    pub retry_attempts: u32,
    /// Initial backoff; doubles after each retry.
    pub retry_backoff_ms: u64,
    /// Enrollment-issued AK certificate (JSON).
    pub ak_certificate_path: Option<PathBuf>,
    /// Manufacturer-issued EK certificate (JSON).
    pub ek_certificate_path: Option<PathBuf>,
    /// Persistent handle of the enrolled AK (hardware only).
    pub ak_persistent_handle: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// JSON trust anchor bundle (EK and AK roots).
    pub trust_anchor_path: Option<PathBuf>,
    /// PCR indices every quote must cover.
    pub pcr_selection: Vec<u8>,
    pub nonce_ttl_secs: u64,
    /// Reject nodes with no enrolled measurement baseline.
    pub require_baseline: bool,
    /// Known-good PCR values (JSON list of `{index, value}`, hex values)
    /// enrolled for this node's self-attestation.
    pub baseline_path: Option<PathBuf>,
    pub location_service_url: Option<String>,
    pub location_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenewalConfig {
    pub period_secs: u64,
    /// Lifetime of an issued identity; it lapses unless renewed.
    pub identity_ttl_secs: u64,
    pub max_consecutive_failures: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_uuid: "00000000-0000-0000-0000-000000000000".to_string(),
            listen_addr: "127.0.0.1:9002".to_string(),
            certify_rate_limit: 60,
            log_format: LogFormat::Pretty,
        }
    }
}

impl Default for TpmConfig {
    fn default() -> Self {
        Self {
            device: DeviceKind::Software,
            quote_timeout_ms: 30_000,
            retry_attempts: 3,
            retry_backoff_ms: 2_000,
            ak_certificate_path: None,
            ek_certificate_path: None,
            ak_persistent_handle: None,
        }
    }
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            trust_anchor_path: None,
            pcr_selection: (0..=7).collect(),
            nonce_ttl_secs: 300,
            require_baseline: true,
            baseline_path: None,
            location_service_url: None,
            location_timeout_ms: 5_000,
        }
    }
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            period_secs: 60,
            identity_ttl_secs: 300,
            max_consecutive_failures: 3,
        }
    }
}

impl Config {
    /// Load, override from the environment, and validate.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn default_config() -> Self {
        Self::default()
    }

    /// Apply `AEGIS_*` environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(uuid) = std::env::var("AEGIS_NODE_UUID") {
            self.node.node_uuid = uuid;
        }
        if let Ok(addr) = std::env::var("AEGIS_LISTEN_ADDR") {
            self.node.listen_addr = addr;
        }
        if let Ok(url) = std::env::var("AEGIS_LOCATION_SERVICE_URL") {
            self.verifier.location_service_url = Some(url);
        }
        match std::env::var("AEGIS_TPM_DEVICE").as_deref() {
            Ok("hardware") => self.tpm.device = DeviceKind::Hardware,
            Ok("software") => self.tpm.device = DeviceKind::Software,
            _ => {}
        }
        if let Ok("json") = std::env::var("AEGIS_LOG_FORMAT").as_deref() {
            self.node.log_format = LogFormat::Json;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.node_uuid.trim().is_empty() {
            return Err(CoreError::Config("node.node_uuid must not be empty".into()));
        }
        if self.verifier.pcr_selection.is_empty() {
            return Err(CoreError::Config(
                "verifier.pcr_selection must name at least one PCR".into(),
            ));
        }
        if let Some(index) = self
            .verifier
            .pcr_selection
            .iter()
            .find(|&&index| index >= PCR_COUNT)
        {
            return Err(CoreError::Config(format!(
                "verifier.pcr_selection contains PCR {} (max {})",
                index,
                PCR_COUNT - 1
            )));
        }
        if self.tpm.quote_timeout_ms == 0 || self.tpm.retry_attempts == 0 {
            return Err(CoreError::Config(
                "tpm.quote_timeout_ms and tpm.retry_attempts must be non-zero".into(),
            ));
        }
        if self.verifier.trust_anchor_path.is_some()
            && self.verifier.require_baseline
            && self.verifier.baseline_path.is_none()
        {
            return Err(CoreError::Config(
                "self-attestation with verifier.require_baseline needs verifier.baseline_path"
                    .into(),
            ));
        }
        if self.verifier.nonce_ttl_secs == 0 {
            return Err(CoreError::Config("verifier.nonce_ttl_secs must be non-zero".into()));
        }
        if self.renewal.period_secs == 0 || self.renewal.identity_ttl_secs == 0 {
            return Err(CoreError::Config(
                "renewal.period_secs and renewal.identity_ttl_secs must be non-zero".into(),
            ));
        }
        if self.renewal.max_consecutive_failures == 0 {
            return Err(CoreError::Config(
                "renewal.max_consecutive_failures must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl TpmConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.quote_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl VerifierConfig {
    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_ttl_secs)
    }

    pub fn location_timeout(&self) -> Duration {
        Duration::from_millis(self.location_timeout_ms)
    }
}

impl RenewalConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn identity_ttl(&self) -> Duration {
        Duration::from_secs(self.identity_ttl_secs)
    }
}
