//! Public Key Infrastructure for the EK → AK → AppKey hierarchy.
//!
//! The upper two tiers are signed by Ed25519 authorities: manufacturers sign
//! Endorsement Key certificates, the enrollment authority signs Attestation
//! Key certificates. The bottom tier is CA-free: an [`AppKeyCertificate`] is
//! just a TPM2_Certify statement signed by the AK, bundled with the two
//! upper certificates so a verifier holding only the roots can walk the
//! chain. Certification edges only point downwards.

use std::collections::HashMap;
use std::path::Path;

use ed25519_dalek::{Signature as RootSignature, SigningKey, VerifyingKey};
use signature::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{IdentityError, IdentityResult, VerificationError};
use crate::structures::{name_of, Attest, Attested, EccPublic, EcdsaSignature};

const EK_CERT_DOMAIN: &[u8] = b"aegis/ek-certificate/v1";
const AK_CERT_DOMAIN: &[u8] = b"aegis/ak-certificate/v1";

const ATTR_FIXED_TPM: u32 = 1 << 1;
const ATTR_RESTRICTED: u32 = 1 << 16;
const ATTR_SIGN: u32 = 1 << 18;

/// Manufacturer statement over an Endorsement Key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndorsementCertificate {
    pub serial: u64,
    pub manufacturer: String,
    /// Marshalled `TPMT_PUBLIC` of the EK.
    #[serde(with = "hex::serde")]
    pub ek_public: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}

/// Enrollment statement binding an AK to an EK and a node UUID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttestationKeyCertificate {
    pub serial: u64,
    pub issuer: String,
    /// Marshalled `TPMT_PUBLIC` of the AK.
    #[serde(with = "hex::serde")]
    pub ak_public: Vec<u8>,
    /// TPM name of the EK the AK was created under.
    #[serde(with = "hex::serde")]
    pub ek_name: Vec<u8>,
    pub node_uuid: String,
    /// Unix millis.
    pub issued_at: u64,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}

/// Delegated certificate: the AK vouching for an Application Key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppKeyCertificate {
    /// Marshalled `TPMS_ATTEST` from TPM2_Certify.
    #[serde(with = "hex::serde")]
    pub certify_info: Vec<u8>,
    /// Marshalled `TPMT_SIGNATURE` by the AK over `certify_info`.
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
    pub challenge_nonce: String,
    pub ak_certificate: AttestationKeyCertificate,
    pub ek_certificate: EndorsementCertificate,
}

impl AppKeyCertificate {
    pub fn to_bytes(&self) -> IdentityResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> IdentityResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// `SHA-256(SHA-256(app_key_public) || nonce)`: binds a certification to
/// both the key and the caller's challenge.
pub fn certify_qualifying_data(app_key_public: &[u8], nonce: &str) -> Vec<u8> {
    let key_hash = Sha256::digest(app_key_public);
    let mut hasher = Sha256::new();
    hasher.update(key_hash);
    hasher.update(nonce.as_bytes());
    hasher.finalize().to_vec()
}

/// `SHA-256(nonce)`, used as quote extra data.
pub fn quote_qualifying_data(nonce: &str) -> Vec<u8> {
    Sha256::digest(nonce.as_bytes()).to_vec()
}

fn signed_bytes(domain: &[u8], fields: &[&[u8]]) -> Vec<u8> {
    let mut out = domain.to_vec();
    for field in fields {
        out.extend_from_slice(&(field.len() as u32).to_be_bytes());
        out.extend_from_slice(field);
    }
    out
}

impl EndorsementCertificate {
    fn tbs(&self) -> Vec<u8> {
        signed_bytes(
            EK_CERT_DOMAIN,
            &[
                &self.serial.to_be_bytes(),
                self.manufacturer.as_bytes(),
                &self.ek_public,
            ],
        )
    }
}

impl AttestationKeyCertificate {
    fn tbs(&self) -> Vec<u8> {
        signed_bytes(
            AK_CERT_DOMAIN,
            &[
                &self.serial.to_be_bytes(),
                self.issuer.as_bytes(),
                &self.ak_public,
                &self.ek_name,
                self.node_uuid.as_bytes(),
                &self.issued_at.to_be_bytes(),
            ],
        )
    }
}

/// On-disk trust anchor bundle: hex Ed25519 public keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustAnchorBundle {
    pub ek_roots: Vec<String>,
    pub ak_roots: Vec<String>,
}

/// Configured roots of trust for chain validation.
#[derive(Debug, Clone, Default)]
pub struct TrustAnchors {
    ek_roots: Vec<VerifyingKey>,
    ak_roots: Vec<VerifyingKey>,
}

impl TrustAnchors {
    pub fn new(ek_roots: Vec<VerifyingKey>, ak_roots: Vec<VerifyingKey>) -> Self {
        Self { ek_roots, ak_roots }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> IdentityResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let bundle: TrustAnchorBundle = serde_json::from_str(&content)?;
        Self::from_bundle(&bundle)
    }

    pub fn from_bundle(bundle: &TrustAnchorBundle) -> IdentityResult<Self> {
        let anchors = Self {
            ek_roots: parse_roots(&bundle.ek_roots)?,
            ak_roots: parse_roots(&bundle.ak_roots)?,
        };
        if anchors.ek_roots.is_empty() || anchors.ak_roots.is_empty() {
            return Err(IdentityError::Config(
                "trust anchor bundle needs at least one EK root and one AK root".into(),
            ));
        }
        info!(
            ek_roots = anchors.ek_roots.len(),
            ak_roots = anchors.ak_roots.len(),
            "Trust anchors loaded"
        );
        Ok(anchors)
    }

    pub fn to_bundle(&self) -> TrustAnchorBundle {
        TrustAnchorBundle {
            ek_roots: self.ek_roots.iter().map(|k| hex::encode(k.as_bytes())).collect(),
            ak_roots: self.ak_roots.iter().map(|k| hex::encode(k.as_bytes())).collect(),
        }
    }

    pub fn add_ek_root(&mut self, key: VerifyingKey) {
        self.ek_roots.push(key);
    }

    pub fn add_ak_root(&mut self, key: VerifyingKey) {
        self.ak_roots.push(key);
    }

    fn verify_any(roots: &[VerifyingKey], message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = RootSignature::from_slice(signature) else {
            return false;
        };
        roots
            .iter()
            .any(|root| root.verify_strict(message, &signature).is_ok())
    }

    pub fn verify_endorsement(&self, cert: &EndorsementCertificate) -> Result<(), VerificationError> {
        if Self::verify_any(&self.ek_roots, &cert.tbs(), &cert.signature) {
            Ok(())
        } else {
            Err(VerificationError::ChainInvalid(format!(
                "EK certificate {} not signed by a trusted manufacturer",
                cert.serial
            )))
        }
    }

    pub fn verify_attestation_key(
        &self,
        cert: &AttestationKeyCertificate,
        ek_cert: &EndorsementCertificate,
    ) -> Result<(), VerificationError> {
        if !Self::verify_any(&self.ak_roots, &cert.tbs(), &cert.signature) {
            return Err(VerificationError::ChainInvalid(format!(
                "AK certificate {} not signed by a trusted enrollment authority",
                cert.serial
            )));
        }
        if cert.ek_name != name_of(&ek_cert.ek_public) {
            return Err(VerificationError::ChainInvalid(
                "AK certificate names a different EK".into(),
            ));
        }
        Ok(())
    }
}

fn parse_roots(hex_keys: &[String]) -> IdentityResult<Vec<VerifyingKey>> {
    hex_keys
        .iter()
        .map(|encoded| {
            let bytes = hex::decode(encoded)
                .map_err(|e| IdentityError::Config(format!("trust anchor hex: {e}")))?;
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| IdentityError::Config("trust anchor must be 32 bytes".into()))?;
            VerifyingKey::from_bytes(&arr)
                .map_err(|e| IdentityError::Config(format!("trust anchor key: {e}")))
        })
        .collect()
}

fn require_attributes(public: &EccPublic, required: u32, what: &str) -> Result<(), VerificationError> {
    if public.object_attributes & required != required {
        return Err(VerificationError::ChainInvalid(format!(
            "{what} attributes 0x{:08x} missing 0x{required:08x}",
            public.object_attributes
        )));
    }
    Ok(())
}

/// Outcome of a successful chain walk.
#[derive(Debug, Clone)]
pub struct ValidatedChain {
    pub node_uuid: String,
    pub ak_name: Vec<u8>,
    pub app_key: p256::ecdsa::VerifyingKey,
}

/// Validate EK → AK → AppKey for `app_key_public` under `nonce`.
pub fn validate_chain(
    certificate: &[u8],
    app_key_public: &[u8],
    nonce: &str,
    anchors: &TrustAnchors,
) -> Result<ValidatedChain, VerificationError> {
    let chain_err = |msg: String| VerificationError::ChainInvalid(msg);

    if certificate.is_empty() {
        return Err(chain_err("empty certificate".into()));
    }
    let cert = AppKeyCertificate::from_bytes(certificate)
        .map_err(|e| chain_err(format!("certificate decode: {e}")))?;
    // Only the canonical encoding is accepted.
    let canonical = cert
        .to_bytes()
        .map_err(|e| chain_err(format!("certificate encode: {e}")))?;
    if canonical != certificate {
        return Err(chain_err("certificate is not canonically encoded".into()));
    }

    anchors.verify_endorsement(&cert.ek_certificate)?;
    anchors.verify_attestation_key(&cert.ak_certificate, &cert.ek_certificate)?;

    let ak_public = EccPublic::unmarshal(&cert.ak_certificate.ak_public)
        .map_err(|e| chain_err(format!("AK public: {e}")))?;
    require_attributes(&ak_public, ATTR_FIXED_TPM | ATTR_RESTRICTED | ATTR_SIGN, "AK")?;
    let ak_key = ak_public
        .verifying_key()
        .map_err(|e| chain_err(format!("AK key: {e}")))?;

    let signature = EcdsaSignature::unmarshal(&cert.signature)
        .and_then(|sig| sig.to_p256())
        .map_err(|e| chain_err(format!("certify signature: {e}")))?;
    ak_key
        .verify(&cert.certify_info, &signature)
        .map_err(|_| chain_err("certify signature does not verify under AK".into()))?;

    let attest =
        Attest::unmarshal(&cert.certify_info).map_err(|e| chain_err(format!("certify info: {e}")))?;
    let Attested::Certify { name, .. } = &attest.attested else {
        return Err(chain_err("attestation is not a certification".into()));
    };
    if *name != name_of(app_key_public) {
        return Err(chain_err("certified name does not match App Key".into()));
    }
    if cert.challenge_nonce != nonce
        || attest.extra_data != certify_qualifying_data(app_key_public, nonce)
    {
        return Err(chain_err("certification not bound to this nonce".into()));
    }

    let app_public =
        EccPublic::unmarshal(app_key_public).map_err(|e| chain_err(format!("App Key: {e}")))?;
    require_attributes(&app_public, ATTR_FIXED_TPM | ATTR_SIGN, "App Key")?;
    let app_key = app_public
        .verifying_key()
        .map_err(|e| chain_err(format!("App Key: {e}")))?;

    debug!(node_uuid = %cert.ak_certificate.node_uuid, "certificate chain validated");
    Ok(ValidatedChain {
        node_uuid: cert.ak_certificate.node_uuid.clone(),
        ak_name: name_of(&cert.ak_certificate.ak_public),
        app_key,
    })
}

/// Ed25519 authority issuing EK (manufacturer) or AK (enrollment) certificates.
pub struct CertificateAuthority {
    ca_id: String,
    signing_key: SigningKey,
    /// Issued AK certificates indexed by serial.
    issued: HashMap<u64, AttestationKeyCertificate>,
    next_serial: u64,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_id", &self.ca_id)
            .field("issued", &self.issued.len())
            .finish()
    }
}

impl CertificateAuthority {
    /// Create an authority with a fresh random key.
    pub fn generate(ca_id: impl Into<String>) -> Self {
        let secret: [u8; 32] = rand::random();
        Self::from_secret(ca_id, &secret)
    }

    pub fn from_secret(ca_id: impl Into<String>, secret: &[u8; 32]) -> Self {
        Self {
            ca_id: ca_id.into(),
            signing_key: SigningKey::from_bytes(secret),
            issued: HashMap::new(),
            next_serial: 1,
        }
    }

    pub fn ca_id(&self) -> &str {
        &self.ca_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    fn take_serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    /// Manufacturer role: sign an EK public area.
    pub fn issue_endorsement(&mut self, ek_public: Vec<u8>) -> IdentityResult<EndorsementCertificate> {
        EccPublic::unmarshal(&ek_public)
            .map_err(|e| IdentityError::CertificateAuthority(format!("EK public: {e}")))?;
        let mut cert = EndorsementCertificate {
            serial: self.take_serial(),
            manufacturer: self.ca_id.clone(),
            ek_public,
            signature: Vec::new(),
        };
        cert.signature = self.signing_key.sign(&cert.tbs()).to_bytes().to_vec();
        Ok(cert)
    }

    /// Enrollment role: certify an AK created under an endorsed EK.
    ///
    /// The EK certificate is checked against `anchors` first; an AK is only
    /// ever certified beneath an already-trusted EK.
    pub fn enroll_attestation_key(
        &mut self,
        ek_cert: &EndorsementCertificate,
        ak_public: Vec<u8>,
        node_uuid: impl Into<String>,
        anchors: &TrustAnchors,
    ) -> IdentityResult<AttestationKeyCertificate> {
        anchors.verify_endorsement(ek_cert)?;
        let parsed = EccPublic::unmarshal(&ak_public)
            .map_err(|e| IdentityError::CertificateAuthority(format!("AK public: {e}")))?;
        require_attributes(&parsed, ATTR_FIXED_TPM | ATTR_RESTRICTED | ATTR_SIGN, "AK")
            .map_err(|e| IdentityError::CertificateAuthority(e.to_string()))?;

        let mut cert = AttestationKeyCertificate {
            serial: self.take_serial(),
            issuer: self.ca_id.clone(),
            ak_public,
            ek_name: name_of(&ek_cert.ek_public),
            node_uuid: node_uuid.into(),
            issued_at: current_timestamp(),
            signature: Vec::new(),
        };
        cert.signature = self.signing_key.sign(&cert.tbs()).to_bytes().to_vec();
        self.issued.insert(cert.serial, cert.clone());
        info!(
            ca = %self.ca_id,
            serial = cert.serial,
            node_uuid = %cert.node_uuid,
            "Attestation Key enrolled"
        );
        Ok(cert)
    }

    pub fn get_certificate(&self, serial: u64) -> Option<&AttestationKeyCertificate> {
        self.issued.get(&serial)
    }

    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }
}

fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
