//! TPM device abstraction.
//!
//! A [`TpmDevice`] is the raw command surface of one chip. It is owned by a
//! single worker thread inside [`crate::tpm::KeyHierarchyManager`] and is
//! never shared, so implementations take `&mut self` and may block.
//!
//! [`SoftwareTpm`] is an in-process simulation with a real P-256 key
//! hierarchy and a SHA-256 PCR bank. It produces byte-identical structures
//! to a hardware TPM for everything the verifier inspects.

use std::time::Instant;

use p256::ecdsa::{Signature, SigningKey};
use signature::Signer;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use aegis_core::config::PCR_COUNT;

use crate::error::TpmError;
use crate::structures::{
    name_of, pcr_digest, Attest, Attested, ClockInfo, EccPublic, EcdsaSignature, QuoteBlob,
    SymmetricDef, APP_KEY_ATTRIBUTES, ATTESTATION_KEY_ATTRIBUTES, TPM_ALG_SHA256,
};
use crate::tpm::PcrValue;

/// fixedTPM | fixedParent | sensitiveDataOrigin | adminWithPolicy | restricted | decrypt
const ENDORSEMENT_KEY_ATTRIBUTES: u32 = 0x0003_00b2;
const TPM_ALG_AES: u16 = 0x0006;
const TPM_ALG_CFB: u16 = 0x0043;
const SOFTWARE_FIRMWARE_VERSION: u64 = 0x0001_0000_0000_0001;

/// Output of TPM2_Certify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertifyOutput {
    /// Marshalled `TPMS_ATTEST` (certify).
    pub certify_info: Vec<u8>,
    /// Marshalled `TPMT_SIGNATURE` by the Attestation Key.
    pub signature: Vec<u8>,
}

/// Command surface of a TPM. All key blobs crossing this boundary are
/// marshalled `TPMT_PUBLIC`; private material never leaves the device.
pub trait TpmDevice: Send {
    /// Human-readable device description for logs.
    fn describe(&self) -> String;

    /// Public area of the Endorsement Key.
    fn ek_public(&mut self) -> Result<Vec<u8>, TpmError>;

    /// Load the enrolled Attestation Key, creating it under the EK on first use.
    fn load_or_create_ak(&mut self) -> Result<Vec<u8>, TpmError>;

    /// Create a fresh Application Key, replacing any loaded one.
    fn create_app_key(&mut self) -> Result<Vec<u8>, TpmError>;

    /// Unload the current Application Key.
    fn flush_app_key(&mut self) -> Result<(), TpmError>;

    /// TPM2_Certify the loaded Application Key with the Attestation Key.
    fn certify_app_key(&mut self, qualifying_data: &[u8]) -> Result<CertifyOutput, TpmError>;

    /// TPM2_Quote over the SHA-256 bank, signed by the Application Key, plus
    /// the PCR values the digest covers.
    fn quote(&mut self, qualifying_data: &[u8], pcr_selection: &[u8])
        -> Result<QuoteBlob, TpmError>;
}

struct SoftKey {
    signing_key: SigningKey,
    public: Vec<u8>,
    name: Vec<u8>,
}

impl SoftKey {
    fn generate(attributes: u32) -> Result<Self, TpmError> {
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        let public = EccPublic::signing_key(signing_key.verifying_key(), attributes)
            .marshal()
            .map_err(|e| TpmError::MalformedResponse(e.to_string()))?;
        let name = name_of(&public);
        Ok(Self {
            signing_key,
            public,
            name,
        })
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, TpmError> {
        let signature: Signature = self.signing_key.sign(message);
        EcdsaSignature::from_p256(&signature)
            .marshal()
            .map_err(|e| TpmError::MalformedResponse(e.to_string()))
    }
}

/// Simulated TPM with an EK, an on-demand AK, one Application Key slot and
/// a 24-register SHA-256 PCR bank.
pub struct SoftwareTpm {
    ek_public: Vec<u8>,
    ak: Option<SoftKey>,
    app_key: Option<SoftKey>,
    pcrs: [[u8; 32]; PCR_COUNT as usize],
    started: Instant,
    reset_count: u32,
}

impl SoftwareTpm {
    pub fn new() -> Self {
        let ek_key = SigningKey::random(&mut rand::thread_rng());
        let mut ek = EccPublic::signing_key(ek_key.verifying_key(), ENDORSEMENT_KEY_ATTRIBUTES);
        ek.scheme_hash = None;
        ek.symmetric = Some(SymmetricDef {
            algorithm: TPM_ALG_AES,
            key_bits: 128,
            mode: TPM_ALG_CFB,
        });
        ek.auth_policy = vec![0u8; 32];
        let ek_public = ek.marshal().unwrap_or_default();
        info!("STATUS: SoftwareTpm :: simulated root of trust :: ACTIVE");
        Self {
            ek_public,
            ak: None,
            app_key: None,
            pcrs: [[0u8; 32]; PCR_COUNT as usize],
            started: Instant::now(),
            reset_count: 0,
        }
    }

    /// PCR extend: `pcr = SHA-256(pcr || SHA-256(measurement))`.
    pub fn extend(&mut self, index: u8, measurement: &[u8]) -> Result<(), TpmError> {
        let slot = self
            .pcrs
            .get_mut(index as usize)
            .ok_or_else(|| TpmError::UnknownKey(format!("PCR {index}")))?;
        let digest = Sha256::digest(measurement);
        let mut hasher = Sha256::new();
        hasher.update(*slot);
        hasher.update(digest);
        *slot = hasher.finalize().into();
        debug!(pcr = index, "PCR extended");
        Ok(())
    }

    /// Current values of the requested PCRs in ascending index order.
    pub fn read_pcrs(&self, selection: &[u8]) -> Result<Vec<PcrValue>, TpmError> {
        let mut indices = selection.to_vec();
        indices.sort_unstable();
        indices.dedup();
        indices
            .into_iter()
            .map(|index| {
                self.pcrs
                    .get(index as usize)
                    .map(|value| PcrValue {
                        index,
                        value: value.to_vec(),
                    })
                    .ok_or_else(|| TpmError::MalformedResponse(format!("PCR {index} out of range")))
            })
            .collect()
    }

    fn clock_info(&self) -> ClockInfo {
        ClockInfo {
            clock: self.started.elapsed().as_millis() as u64,
            reset_count: self.reset_count,
            restart_count: 0,
            safe: true,
        }
    }
}

impl Default for SoftwareTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl TpmDevice for SoftwareTpm {
    fn describe(&self) -> String {
        "software-tpm".to_string()
    }

    fn ek_public(&mut self) -> Result<Vec<u8>, TpmError> {
        if self.ek_public.is_empty() {
            return Err(TpmError::MalformedResponse("EK public area missing".into()));
        }
        Ok(self.ek_public.clone())
    }

    fn load_or_create_ak(&mut self) -> Result<Vec<u8>, TpmError> {
        if let Some(ak) = &self.ak {
            return Ok(ak.public.clone());
        }
        let ak = SoftKey::generate(ATTESTATION_KEY_ATTRIBUTES)?;
        let public = ak.public.clone();
        self.ak = Some(ak);
        info!("Attestation Key created under EK");
        Ok(public)
    }

    fn create_app_key(&mut self) -> Result<Vec<u8>, TpmError> {
        let key = SoftKey::generate(APP_KEY_ATTRIBUTES)?;
        let public = key.public.clone();
        self.app_key = Some(key);
        Ok(public)
    }

    fn flush_app_key(&mut self) -> Result<(), TpmError> {
        self.app_key = None;
        Ok(())
    }

    fn certify_app_key(&mut self, qualifying_data: &[u8]) -> Result<CertifyOutput, TpmError> {
        let ak = self.ak.as_ref().ok_or(TpmError::AkNotReady)?;
        let app_key = self
            .app_key
            .as_ref()
            .ok_or_else(|| TpmError::UnknownKey("no application key loaded".into()))?;

        let attest = Attest {
            qualified_signer: ak.name.clone(),
            extra_data: qualifying_data.to_vec(),
            clock_info: self.clock_info(),
            firmware_version: SOFTWARE_FIRMWARE_VERSION,
            attested: Attested::Certify {
                name: app_key.name.clone(),
                qualified_name: app_key.name.clone(),
            },
        }
        .marshal()
        .map_err(|e| TpmError::MalformedResponse(e.to_string()))?;

        let signature = ak.sign(&attest)?;
        Ok(CertifyOutput {
            certify_info: attest,
            signature,
        })
    }

    fn quote(
        &mut self,
        qualifying_data: &[u8],
        pcr_selection: &[u8],
    ) -> Result<QuoteBlob, TpmError> {
        let app_key = self
            .app_key
            .as_ref()
            .ok_or_else(|| TpmError::UnknownKey("no application key loaded".into()))?;
        let pcr_values = self.read_pcrs(pcr_selection)?;
        let digest = pcr_digest(&pcr_values);

        let attest = Attest {
            qualified_signer: app_key.name.clone(),
            extra_data: qualifying_data.to_vec(),
            clock_info: self.clock_info(),
            firmware_version: SOFTWARE_FIRMWARE_VERSION,
            attested: Attested::Quote {
                pcr_selection: pcr_values.iter().map(|pcr| pcr.index).collect(),
                pcr_digest: digest.to_vec(),
            },
        }
        .marshal()
        .map_err(|e| TpmError::MalformedResponse(e.to_string()))?;

        let signature = app_key.sign(&attest)?;
        debug!(hash_alg = TPM_ALG_SHA256, pcrs = pcr_values.len(), "quote generated");
        Ok(QuoteBlob {
            attest,
            signature,
            pcr_values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signature::Verifier;

    #[test]
    fn test_ak_is_stable_across_loads() {
        let mut tpm = SoftwareTpm::new();
        let first = tpm.load_or_create_ak().unwrap();
        let second = tpm.load_or_create_ak().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_ek_public_parses_as_storage_key() {
        let mut tpm = SoftwareTpm::new();
        let ek = EccPublic::unmarshal(&tpm.ek_public().unwrap()).unwrap();
        assert_eq!(ek.object_attributes, ENDORSEMENT_KEY_ATTRIBUTES);
        assert!(ek.symmetric.is_some());
        assert!(ek.scheme_hash.is_none());
    }

    #[test]
    fn test_certify_requires_ak() {
        let mut tpm = SoftwareTpm::new();
        tpm.create_app_key().unwrap();
        assert_eq!(tpm.certify_app_key(&[0u8; 32]), Err(TpmError::AkNotReady));
    }

    #[test]
    fn test_extend_changes_only_target_pcr() {
        let mut tpm = SoftwareTpm::new();
        let before = tpm.read_pcrs(&[0, 1]).unwrap();
        tpm.extend(1, b"kernel").unwrap();
        let after = tpm.read_pcrs(&[0, 1]).unwrap();
        assert_eq!(before[0], after[0]);
        assert_ne!(before[1], after[1]);
        assert!(tpm.extend(24, b"x").is_err());
    }

    #[test]
    fn test_quote_signed_by_app_key() {
        let mut tpm = SoftwareTpm::new();
        let app_public = tpm.create_app_key().unwrap();
        let blob = tpm.quote(&[9u8; 32], &[7, 0, 3]).unwrap();

        let indices: Vec<u8> = blob.pcr_values.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![0, 3, 7]);

        let key = EccPublic::unmarshal(&app_public)
            .unwrap()
            .verifying_key()
            .unwrap();
        let sig = EcdsaSignature::unmarshal(&blob.signature)
            .unwrap()
            .to_p256()
            .unwrap();
        assert!(key.verify(&blob.attest, &sig).is_ok());

        let attest = Attest::unmarshal(&blob.attest).unwrap();
        assert_eq!(attest.extra_data, vec![9u8; 32]);
    }

    #[test]
    fn test_quote_without_app_key_fails() {
        let mut tpm = SoftwareTpm::new();
        assert!(matches!(
            tpm.quote(&[0u8; 32], &[0]),
            Err(TpmError::UnknownKey(_))
        ));
    }
}
