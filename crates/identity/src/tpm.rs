//! Trusted Platform Module (TPM) key hierarchy management.
//!
//! [`KeyHierarchyManager`] owns the EK, the enrolled AK and the session
//! Application Key of one chip. Every hardware command runs on a dedicated
//! worker thread that owns the [`TpmDevice`]; callers talk to it over a
//! queue, so commands never interleave. A panic inside a command is caught
//! on the worker and returned as [`TpmError::MalformedResponse`], and a
//! command that outlives its timeout is reported as
//! [`TpmError::DeviceUnavailable`]. Neither can reach the caller's task.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use aegis_core::config::{DeviceKind, TpmConfig};

use crate::device::{SoftwareTpm, TpmDevice};
use crate::error::{IdentityError, IdentityResult, TpmError};
use crate::pki::{
    certify_qualifying_data, quote_qualifying_data, AppKeyCertificate, AttestationKeyCertificate,
    EndorsementCertificate,
};
use crate::structures::name_of;

const WORKER_QUEUE_DEPTH: usize = 32;

/// One PCR register value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PcrValue {
    pub index: u8,
    #[serde(with = "hex::serde")]
    pub value: Vec<u8>,
}

/// Handle to the session Application Key. Public material only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppKeyHandle {
    /// Marshalled `TPMT_PUBLIC`.
    pub public: Vec<u8>,
    pub name: Vec<u8>,
}

/// Timeout and retry policy for hardware calls.
#[derive(Debug, Clone, Copy)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl CallPolicy {
    pub fn from_config(config: &TpmConfig) -> Self {
        Self {
            timeout: config.call_timeout(),
            attempts: config.retry_attempts.max(1),
            initial_backoff: config.retry_backoff(),
        }
    }
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self::from_config(&TpmConfig::default())
    }
}

struct WorkerState {
    device: Box<dyn TpmDevice>,
    app_key: Option<AppKeyHandle>,
}

type Job = Box<dyn FnOnce(&mut WorkerState) + Send>;

#[derive(Default)]
struct Credentials {
    ek_certificate: Option<EndorsementCertificate>,
    ak_certificate: Option<AttestationKeyCertificate>,
}

/// Serialized access to one TPM's key hierarchy.
#[derive(Clone)]
pub struct KeyHierarchyManager {
    jobs: mpsc::Sender<Job>,
    policy: CallPolicy,
    credentials: Arc<RwLock<Credentials>>,
    device_name: Arc<str>,
}

impl std::fmt::Debug for KeyHierarchyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyHierarchyManager")
            .field("device", &self.device_name)
            .field("policy", &self.policy)
            .finish()
    }
}

impl KeyHierarchyManager {
    /// Start the worker thread that will own `device`.
    pub fn spawn(device: Box<dyn TpmDevice>, policy: CallPolicy) -> IdentityResult<Self> {
        let device_name: Arc<str> = device.describe().into();
        let (jobs, mut rx) = mpsc::channel::<Job>(WORKER_QUEUE_DEPTH);
        let mut state = WorkerState {
            device,
            app_key: None,
        };

        std::thread::Builder::new()
            .name("tpm-worker".to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    job(&mut state);
                }
                debug!("TPM worker exiting");
            })?;

        info!(device = %device_name, "STATUS: KeyHierarchyManager :: worker :: ACTIVE");
        Ok(Self {
            jobs,
            policy,
            credentials: Arc::new(RwLock::new(Credentials::default())),
            device_name,
        })
    }

    /// Build the device named in configuration and load enrolled credentials.
    /// An AK certificate that does not match the resident keys is refused.
    pub async fn from_config(config: &TpmConfig) -> IdentityResult<Self> {
        let device: Box<dyn TpmDevice> = match config.device {
            DeviceKind::Software => {
                warn!("Using simulated TPM; not suitable for production attestation");
                Box::new(SoftwareTpm::new())
            }
            DeviceKind::Hardware => hardware_device(config)?,
        };
        let manager = Self::spawn(device, CallPolicy::from_config(config))?;

        if let Some(path) = &config.ek_certificate_path {
            let cert: EndorsementCertificate =
                serde_json::from_str(&std::fs::read_to_string(path)?)?;
            manager.set_ek_certificate(cert)?;
        }
        if let Some(path) = &config.ak_certificate_path {
            let cert: AttestationKeyCertificate =
                serde_json::from_str(&std::fs::read_to_string(path)?)?;
            manager.install_ak_certificate(cert).await?;
        }
        Ok(manager)
    }

    pub fn policy(&self) -> CallPolicy {
        self.policy
    }

    /// Run one command on the worker with timeout and panic isolation.
    async fn submit<T, F>(&self, op: &'static str, f: F) -> Result<T, TpmError>
    where
        T: Send + 'static,
        F: FnOnce(&mut WorkerState) -> Result<T, TpmError> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |state| {
            let result = catch_unwind(AssertUnwindSafe(|| f(state))).unwrap_or_else(|panic| {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(op, %detail, "TPM command panicked");
                Err(TpmError::MalformedResponse(format!("{op} panicked: {detail}")))
            });
            let _ = reply_tx.send(result);
        });

        let exchange = async {
            self.jobs
                .send(job)
                .await
                .map_err(|_| TpmError::DeviceUnavailable("TPM worker stopped".into()))?;
            reply_rx.await.map_err(|_| {
                TpmError::DeviceUnavailable(format!("{op}: worker dropped the request"))
            })?
        };

        match tokio::time::timeout(self.policy.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, timeout_ms = self.policy.timeout.as_millis() as u64, "TPM call timed out");
                Err(TpmError::DeviceUnavailable(format!("{op}: timed out")))
            }
        }
    }

    /// Submit with bounded exponential backoff on `DeviceBusy`.
    async fn call<T, F>(&self, op: &'static str, f: F) -> Result<T, TpmError>
    where
        T: Send + 'static,
        F: Fn(&mut WorkerState) -> Result<T, TpmError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let mut backoff = self.policy.initial_backoff;
        let mut attempt = 1;
        loop {
            let f = Arc::clone(&f);
            match self.submit(op, move |state| f(state)).await {
                Err(err) if err.is_retryable() && attempt < self.policy.attempts => {
                    warn!(op, attempt, backoff_ms = backoff.as_millis() as u64, "TPM busy, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub async fn ek_public(&self) -> Result<Vec<u8>, TpmError> {
        self.call("ek_public", |state| state.device.ek_public()).await
    }

    pub async fn ak_public(&self) -> Result<Vec<u8>, TpmError> {
        self.call("ak_public", |state| state.device.load_or_create_ak())
            .await
    }

    /// Return the session Application Key, creating it on first use.
    pub async fn ensure_app_key(&self) -> Result<AppKeyHandle, TpmError> {
        self.call("ensure_app_key", |state| {
            if let Some(handle) = &state.app_key {
                return Ok(handle.clone());
            }
            let public = state.device.create_app_key()?;
            let handle = AppKeyHandle {
                name: name_of(&public),
                public,
            };
            state.app_key = Some(handle.clone());
            info!(name = %hex::encode(&handle.name), "Application Key created");
            Ok(handle)
        })
        .await
    }

    /// Flush the session Application Key; the next `ensure_app_key` makes a new one.
    pub async fn retire_app_key(&self) -> Result<(), TpmError> {
        self.call("retire_app_key", |state| {
            if state.app_key.take().is_some() {
                state.device.flush_app_key()?;
                info!("Application Key retired");
            }
            Ok(())
        })
        .await
    }

    /// Quote the selected PCRs over `SHA-256(nonce)` with the Application Key.
    /// Returns the marshalled quote blob.
    pub async fn sign_quote(&self, nonce: &str, pcr_selection: &[u8]) -> Result<Vec<u8>, TpmError> {
        let qualifying_data = quote_qualifying_data(nonce);
        let selection = pcr_selection.to_vec();
        self.call("sign_quote", move |state| {
            if state.app_key.is_none() {
                return Err(TpmError::UnknownKey("no application key".into()));
            }
            let blob = state.device.quote(&qualifying_data, &selection)?;
            blob.marshal()
                .map_err(|e| TpmError::MalformedResponse(e.to_string()))
        })
        .await
    }

    /// Certify a resident Application Key with the enrolled AK, bound to
    /// `nonce`.
    pub async fn certify(
        &self,
        app_key_public: &[u8],
        nonce: &str,
    ) -> Result<AppKeyCertificate, TpmError> {
        let (ek_certificate, ak_certificate) = {
            let creds = self
                .credentials
                .read()
                .map_err(|_| TpmError::DeviceUnavailable("credential store poisoned".into()))?;
            match (&creds.ek_certificate, &creds.ak_certificate) {
                (Some(ek), Some(ak)) => (ek.clone(), ak.clone()),
                _ => return Err(TpmError::AkNotReady),
            }
        };

        let qualifying_data = certify_qualifying_data(app_key_public, nonce);
        let requested = app_key_public.to_vec();
        let output = self
            .call("certify", move |state| {
                match &state.app_key {
                    Some(handle) if handle.public == requested => {}
                    _ => {
                        return Err(TpmError::UnknownKey(
                            "App Key is not resident in this TPM".into(),
                        ))
                    }
                }
                state.device.certify_app_key(&qualifying_data)
            })
            .await?;

        Ok(AppKeyCertificate {
            certify_info: output.certify_info,
            signature: output.signature,
            challenge_nonce: nonce.to_string(),
            ak_certificate,
            ek_certificate,
        })
    }

    pub fn set_ek_certificate(&self, cert: EndorsementCertificate) -> IdentityResult<()> {
        let mut creds = self
            .credentials
            .write()
            .map_err(|_| IdentityError::InvalidState("credential store poisoned".into()))?;
        creds.ek_certificate = Some(cert);
        Ok(())
    }

    /// Install the enrollment-issued AK certificate after checking it names
    /// the AK and EK resident in this TPM.
    pub async fn install_ak_certificate(&self, cert: AttestationKeyCertificate) -> IdentityResult<()> {
        let ak_public = self.ak_public().await?;
        if ak_public != cert.ak_public {
            return Err(IdentityError::Tpm(TpmError::UnknownKey(
                "AK certificate does not match the resident AK".into(),
            )));
        }
        let ek_public = self.ek_public().await?;
        if name_of(&ek_public) != cert.ek_name {
            return Err(IdentityError::Tpm(TpmError::UnknownKey(
                "AK certificate names a different EK".into(),
            )));
        }
        self.install_credentials_unchecked(cert)
    }

    fn install_credentials_unchecked(&self, cert: AttestationKeyCertificate) -> IdentityResult<()> {
        let mut creds = self
            .credentials
            .write()
            .map_err(|_| IdentityError::InvalidState("credential store poisoned".into()))?;
        info!(node_uuid = %cert.node_uuid, serial = cert.serial, "AK certificate installed");
        creds.ak_certificate = Some(cert);
        Ok(())
    }

    /// True once both EK and AK certificates are present.
    pub fn is_enrolled(&self) -> bool {
        self.credentials
            .read()
            .map(|c| c.ek_certificate.is_some() && c.ak_certificate.is_some())
            .unwrap_or(false)
    }
}

#[cfg(feature = "hardware-tpm")]
fn hardware_device(config: &TpmConfig) -> IdentityResult<Box<dyn TpmDevice>> {
    let device = crate::hardware::HardwareTpm::open(config.ak_persistent_handle)?;
    Ok(Box::new(device))
}

#[cfg(not(feature = "hardware-tpm"))]
fn hardware_device(_config: &TpmConfig) -> IdentityResult<Box<dyn TpmDevice>> {
    Err(IdentityError::Config(
        "tpm.device = \"hardware\" requires the hardware-tpm feature".into(),
    ))
}
