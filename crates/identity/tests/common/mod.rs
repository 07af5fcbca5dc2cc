//! Shared fixtures: software TPMs enrolled under test authorities.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aegis_identity::device::CertifyOutput;
use aegis_identity::facts::FactProvider;
use aegis_identity::structures::QuoteBlob;
use aegis_identity::{
    AttestationBuilder, AttestationVerifier, CallPolicy, CertificateAuthority,
    CertificationService, KeyHierarchyManager, LocalCertificationClient, NodeRegistry,
    NonceRegistry, PcrValue, SoftwareTpm, TpmDevice, TpmError, TrustAnchors, VerifierPolicy,
};

pub const SELECTION: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];

pub fn test_policy() -> CallPolicy {
    CallPolicy {
        timeout: Duration::from_secs(5),
        attempts: 3,
        initial_backoff: Duration::from_millis(10),
    }
}

/// Route test logs through the harness; `RUST_LOG` overrides the default.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("aegis_identity=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Manufacturer and enrollment authorities plus the anchors trusting them.
pub struct Authorities {
    manufacturer: CertificateAuthority,
    enrollment: CertificateAuthority,
    pub anchors: TrustAnchors,
}

pub struct Node {
    pub uuid: String,
    pub keys: KeyHierarchyManager,
    pub baseline: Vec<PcrValue>,
}

impl Authorities {
    pub fn new() -> Self {
        init_tracing();
        let manufacturer = CertificateAuthority::generate("test-manufacturer");
        let enrollment = CertificateAuthority::generate("test-enrollment");
        let anchors = TrustAnchors::new(
            vec![manufacturer.verifying_key()],
            vec![enrollment.verifying_key()],
        );
        Self {
            manufacturer,
            enrollment,
            anchors,
        }
    }

    /// Measure a software TPM, endorse its EK, enroll its AK, and register
    /// the node with its current PCRs as baseline.
    pub async fn enroll(
        &mut self,
        registry: &NodeRegistry,
        uuid: &str,
        wrap: impl FnOnce(SoftwareTpm) -> Box<dyn TpmDevice>,
    ) -> Node {
        let mut tpm = SoftwareTpm::new();
        tpm.extend(0, b"firmware").unwrap();
        tpm.extend(4, b"bootloader").unwrap();
        tpm.extend(7, b"secure-boot-policy").unwrap();
        let baseline = tpm.read_pcrs(&SELECTION).unwrap();

        let ek_public = tpm.ek_public().unwrap();
        let ak_public = tpm.load_or_create_ak().unwrap();
        let ek_cert = self.manufacturer.issue_endorsement(ek_public).unwrap();
        let ak_cert = self
            .enrollment
            .enroll_attestation_key(&ek_cert, ak_public, uuid, &self.anchors)
            .unwrap();

        let keys = KeyHierarchyManager::spawn(wrap(tpm), test_policy()).unwrap();
        keys.set_ek_certificate(ek_cert).unwrap();
        keys.install_ak_certificate(ak_cert).await.unwrap();
        registry.enroll(uuid, Some(baseline.clone()), None).unwrap();

        Node {
            uuid: uuid.to_string(),
            keys,
            baseline,
        }
    }

    pub async fn enroll_software(&mut self, registry: &NodeRegistry, uuid: &str) -> Node {
        self.enroll(registry, uuid, |tpm| -> Box<dyn TpmDevice> { Box::new(tpm) })
            .await
    }
}

pub fn verifier(anchors: &TrustAnchors, registry: &NodeRegistry) -> AttestationVerifier {
    verifier_with(anchors, registry, true)
}

pub fn verifier_with(
    anchors: &TrustAnchors,
    registry: &NodeRegistry,
    require_baseline: bool,
) -> AttestationVerifier {
    AttestationVerifier::new(
        anchors.clone(),
        NonceRegistry::new(Duration::from_secs(300)),
        registry.clone(),
        FactProvider::new(registry.clone(), Duration::from_millis(200)),
        VerifierPolicy {
            pcr_selection: SELECTION.to_vec(),
            require_baseline,
        },
    )
}

pub fn builder(node: &Node) -> AttestationBuilder {
    let service = Arc::new(CertificationService::new(node.keys.clone(), &node.uuid, 0));
    AttestationBuilder::new(
        node.keys.clone(),
        Arc::new(LocalCertificationClient::new(service)),
        SELECTION.to_vec(),
        &node.uuid,
    )
}

/// How a [`FlakyTpm`] misbehaves on quote while `failing` is set.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Unavailable,
    Panic,
}

/// Software TPM whose quote command can be broken at runtime.
pub struct FlakyTpm {
    inner: SoftwareTpm,
    failing: Arc<AtomicBool>,
    fault: Fault,
}

impl FlakyTpm {
    pub fn wrap(fault: Fault, failing: Arc<AtomicBool>) -> impl FnOnce(SoftwareTpm) -> Box<dyn TpmDevice> {
        move |inner| -> Box<dyn TpmDevice> {
            Box::new(FlakyTpm {
                inner,
                failing,
                fault,
            })
        }
    }
}

impl TpmDevice for FlakyTpm {
    fn describe(&self) -> String {
        "flaky-software-tpm".to_string()
    }

    fn ek_public(&mut self) -> Result<Vec<u8>, TpmError> {
        self.inner.ek_public()
    }

    fn load_or_create_ak(&mut self) -> Result<Vec<u8>, TpmError> {
        self.inner.load_or_create_ak()
    }

    fn create_app_key(&mut self) -> Result<Vec<u8>, TpmError> {
        self.inner.create_app_key()
    }

    fn flush_app_key(&mut self) -> Result<(), TpmError> {
        self.inner.flush_app_key()
    }

    fn certify_app_key(&mut self, qualifying_data: &[u8]) -> Result<CertifyOutput, TpmError> {
        self.inner.certify_app_key(qualifying_data)
    }

    fn quote(&mut self, qualifying_data: &[u8], pcr_selection: &[u8]) -> Result<QuoteBlob, TpmError> {
        if self.failing.load(Ordering::SeqCst) {
            match self.fault {
                Fault::Unavailable => {
                    return Err(TpmError::DeviceUnavailable("/dev/tpmrm0 vanished".into()))
                }
                Fault::Panic => panic!("TSS context corrupted"),
            }
        }
        self.inner.quote(qualifying_data, pcr_selection)
    }
}
