//! Attestation verifier.
//!
//! Turns a [`SovereignAttestation`] into a trust decision. Checks run in a
//! fixed order and the first failure is terminal:
//!
//! 1. Nonce: must equal the expected challenge and be unseen
//!    ([`VerificationError::ReplayDetected`])
//! 2. Chain: EK → AK → App Key against the trust anchors
//!    ([`VerificationError::ChainInvalid`])
//! 3. Quote: App Key signature, nonce binding, PCR digest
//!    ([`VerificationError::QuoteInvalid`]), then policy coverage and the
//!    enrolled baseline ([`VerificationError::MeasurementMismatch`])
//! 4. Claims from the [`FactProvider`]
//!
//! Every outcome gets an `audit_id`, a log line carrying the nonce and the
//! blake3 hashes of the certificate and quote, and an entry in a bounded
//! in-memory audit trail.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use signature::Verifier;
use tracing::{info, warn};
use uuid::Uuid;

use aegis_core::config::VerifierConfig;

use crate::attestation::{SovereignAttestation, VerificationResult};
use crate::error::{IdentityError, IdentityResult, VerificationError};
use crate::facts::{FactProvider, HostIntegrity, HttpLocationVerifier};
use crate::pki::{quote_qualifying_data, validate_chain, TrustAnchors};
use crate::registry::{current_timestamp, NodeRegistry};
use crate::replay_protection::NonceRegistry;
use crate::structures::{pcr_digest, Attest, Attested, EcdsaSignature, QuoteBlob};
use crate::tpm::PcrValue;

/// Most recent audit records kept in memory.
const MAX_AUDIT_RECORDS: usize = 1000;

/// Measurement policy applied to every quote.
#[derive(Debug, Clone)]
pub struct VerifierPolicy {
    /// PCRs every quote must cover.
    pub pcr_selection: Vec<u8>,
    /// Reject nodes without an enrolled baseline instead of reporting
    /// `baseline_unavailable`.
    pub require_baseline: bool,
}

impl VerifierPolicy {
    pub fn from_config(config: &VerifierConfig) -> Self {
        Self {
            pcr_selection: config.pcr_selection.clone(),
            require_baseline: config.require_baseline,
        }
    }
}

impl Default for VerifierPolicy {
    fn default() -> Self {
        Self::from_config(&VerifierConfig::default())
    }
}

/// Everything needed to reconstruct one decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_id: String,
    pub node_uuid: String,
    pub nonce: String,
    /// blake3 of the certificate bytes, hex
    pub certificate_hash: String,
    /// blake3 of the quote bytes, hex
    pub quote_hash: String,
    pub verified: bool,
    pub rejection: Option<VerificationError>,
    /// Unix millis
    pub timestamp: u64,
}

#[derive(Clone)]
pub struct AttestationVerifier {
    anchors: Arc<TrustAnchors>,
    nonces: NonceRegistry,
    registry: NodeRegistry,
    facts: FactProvider,
    policy: VerifierPolicy,
    audit: Arc<RwLock<VecDeque<AuditRecord>>>,
}

impl std::fmt::Debug for AttestationVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationVerifier")
            .field("policy", &self.policy)
            .field("tracked_nonces", &self.nonces.tracked())
            .finish()
    }
}

impl AttestationVerifier {
    pub fn new(
        anchors: TrustAnchors,
        nonces: NonceRegistry,
        registry: NodeRegistry,
        facts: FactProvider,
        policy: VerifierPolicy,
    ) -> Self {
        Self {
            anchors: Arc::new(anchors),
            nonces,
            registry,
            facts,
            policy,
            audit: Arc::new(RwLock::new(VecDeque::with_capacity(MAX_AUDIT_RECORDS))),
        }
    }

    /// Build from `[verifier]` configuration. The trust anchor bundle is
    /// mandatory.
    pub fn from_config(config: &VerifierConfig, registry: NodeRegistry) -> IdentityResult<Self> {
        let path = config.trust_anchor_path.as_ref().ok_or_else(|| {
            IdentityError::Config("verifier.trust_anchor_path is required".into())
        })?;
        let anchors = TrustAnchors::load(path)?;

        let mut facts = FactProvider::new(registry.clone(), config.location_timeout());
        if let Some(url) = &config.location_service_url {
            let client = HttpLocationVerifier::new(url, config.location_timeout())?;
            facts = facts.with_location_verifier(Arc::new(client));
        }

        Ok(Self::new(
            anchors,
            NonceRegistry::new(config.nonce_ttl()),
            registry,
            facts,
            VerifierPolicy::from_config(config),
        ))
    }

    /// Issue a fresh challenge for the next round.
    pub fn issue_nonce(&self) -> Result<String, VerificationError> {
        self.nonces.issue()
    }

    pub fn nonces(&self) -> &NonceRegistry {
        &self.nonces
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Verify against the configured trust anchors.
    pub async fn verify(
        &self,
        attestation: &SovereignAttestation,
        expected_nonce: &str,
    ) -> VerificationResult {
        let anchors = Arc::clone(&self.anchors);
        self.verify_with_anchors(attestation, expected_nonce, &anchors)
            .await
    }

    pub async fn verify_with_anchors(
        &self,
        attestation: &SovereignAttestation,
        expected_nonce: &str,
        anchors: &TrustAnchors,
    ) -> VerificationResult {
        let audit_id = Uuid::new_v4().to_string();

        match self.check(attestation, expected_nonce, anchors) {
            Ok(integrity) => {
                let claims = self
                    .facts
                    .claims_for(&attestation.node_uuid, integrity)
                    .await;
                self.record(&audit_id, attestation, expected_nonce, None);
                VerificationResult::accepted(audit_id, claims)
            }
            Err(reason) => {
                self.record(&audit_id, attestation, expected_nonce, Some(reason.clone()));
                VerificationResult::rejected(audit_id, reason)
            }
        }
    }

    fn check(
        &self,
        attestation: &SovereignAttestation,
        expected_nonce: &str,
        anchors: &TrustAnchors,
    ) -> Result<HostIntegrity, VerificationError> {
        if expected_nonce.is_empty() {
            return Err(VerificationError::ReplayDetected("empty nonce".into()));
        }
        // The expected nonce is burned even when the payload carries another.
        let consumed = self.nonces.consume(expected_nonce);
        if attestation.challenge_nonce != expected_nonce {
            return Err(VerificationError::ReplayDetected(
                "payload nonce does not match the issued challenge".into(),
            ));
        }
        consumed?;

        let chain = validate_chain(
            &attestation.app_key_certificate,
            &attestation.app_key_public,
            expected_nonce,
            anchors,
        )?;
        if chain.node_uuid != attestation.node_uuid {
            return Err(VerificationError::ChainInvalid(format!(
                "payload node {} does not match AK certificate node {}",
                attestation.node_uuid, chain.node_uuid
            )));
        }

        let pcr_values = verify_quote(&attestation.quote, &chain.app_key, expected_nonce)?;
        self.check_measurements(&attestation.node_uuid, &pcr_values)
    }

    fn check_measurements(
        &self,
        node_uuid: &str,
        quoted: &[PcrValue],
    ) -> Result<HostIntegrity, VerificationError> {
        let covered: BTreeSet<u8> = quoted.iter().map(|pcr| pcr.index).collect();
        if let Some(missing) = self
            .policy
            .pcr_selection
            .iter()
            .find(|index| !covered.contains(*index))
        {
            return Err(VerificationError::MeasurementMismatch(format!(
                "quote does not cover PCR {missing}"
            )));
        }

        let Some(baseline) = self.registry.baseline(node_uuid) else {
            if self.policy.require_baseline {
                return Err(VerificationError::MeasurementMismatch(format!(
                    "no baseline enrolled for node {node_uuid}"
                )));
            }
            return Ok(HostIntegrity::BaselineUnavailable);
        };

        for expected in &baseline {
            match quoted.iter().find(|pcr| pcr.index == expected.index) {
                Some(actual) if actual.value == expected.value => {}
                Some(_) => {
                    return Err(VerificationError::MeasurementMismatch(format!(
                        "PCR {} differs from baseline",
                        expected.index
                    )))
                }
                None => {
                    return Err(VerificationError::MeasurementMismatch(format!(
                        "baseline PCR {} not quoted",
                        expected.index
                    )))
                }
            }
        }
        Ok(HostIntegrity::Passed)
    }

    fn record(
        &self,
        audit_id: &str,
        attestation: &SovereignAttestation,
        nonce: &str,
        rejection: Option<VerificationError>,
    ) {
        let certificate_hash = blake3::hash(&attestation.app_key_certificate)
            .to_hex()
            .to_string();
        let quote_hash = blake3::hash(&attestation.quote).to_hex().to_string();

        match &rejection {
            None => info!(
                audit_id,
                node_uuid = %attestation.node_uuid,
                nonce,
                certificate_hash = %certificate_hash,
                quote_hash = %quote_hash,
                "attestation verified"
            ),
            Some(reason) => warn!(
                audit_id,
                node_uuid = %attestation.node_uuid,
                nonce,
                certificate_hash = %certificate_hash,
                quote_hash = %quote_hash,
                reason = reason.code(),
                detail = %reason,
                "attestation rejected"
            ),
        }

        let record = AuditRecord {
            audit_id: audit_id.to_string(),
            node_uuid: attestation.node_uuid.clone(),
            nonce: nonce.to_string(),
            certificate_hash,
            quote_hash,
            verified: rejection.is_none(),
            rejection,
            timestamp: current_timestamp(),
        };
        if let Ok(mut audit) = self.audit.write() {
            if audit.len() >= MAX_AUDIT_RECORDS {
                audit.pop_front();
            }
            audit.push_back(record);
        }
    }

    pub fn audit_record(&self, audit_id: &str) -> Option<AuditRecord> {
        self.audit
            .read()
            .ok()?
            .iter()
            .rev()
            .find(|record| record.audit_id == audit_id)
            .cloned()
    }

    pub fn audit_len(&self) -> usize {
        self.audit.read().map(|audit| audit.len()).unwrap_or(0)
    }
}

/// Check a marshalled quote blob against the App Key and nonce. Returns the
/// quoted PCR values once the digest is proven to cover exactly them.
pub fn verify_quote(
    quote: &[u8],
    app_key: &p256::ecdsa::VerifyingKey,
    nonce: &str,
) -> Result<Vec<PcrValue>, VerificationError> {
    let invalid = |msg: String| VerificationError::QuoteInvalid(msg);

    if quote.is_empty() {
        return Err(invalid("empty quote".into()));
    }
    let blob = QuoteBlob::unmarshal(quote).map_err(|e| invalid(format!("quote blob: {e}")))?;
    let signature = EcdsaSignature::unmarshal(&blob.signature)
        .and_then(|sig| sig.to_p256())
        .map_err(|e| invalid(format!("quote signature: {e}")))?;
    app_key
        .verify(&blob.attest, &signature)
        .map_err(|_| invalid("quote signature does not verify under App Key".into()))?;

    let attest = Attest::unmarshal(&blob.attest).map_err(|e| invalid(format!("attest: {e}")))?;
    let Attested::Quote {
        pcr_selection,
        pcr_digest: quoted_digest,
    } = &attest.attested
    else {
        return Err(invalid("attestation is not a quote".into()));
    };
    if attest.extra_data != quote_qualifying_data(nonce) {
        return Err(invalid("quote not bound to this nonce".into()));
    }

    let selected: BTreeSet<u8> = pcr_selection.iter().copied().collect();
    let supplied: BTreeSet<u8> = blob.pcr_values.iter().map(|pcr| pcr.index).collect();
    if supplied.len() != blob.pcr_values.len() || supplied != selected {
        return Err(invalid("PCR values do not match the quoted selection".into()));
    }
    if pcr_digest(&blob.pcr_values).as_slice() != quoted_digest.as_slice() {
        return Err(invalid("PCR values do not match the quoted digest".into()));
    }
    Ok(blob.pcr_values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SoftwareTpm, TpmDevice};
    use crate::pki::certify_qualifying_data;
    use crate::structures::EccPublic;

    fn quote_for(tpm: &mut SoftwareTpm, nonce: &str) -> (Vec<u8>, p256::ecdsa::VerifyingKey) {
        let public = tpm.create_app_key().unwrap();
        let key = EccPublic::unmarshal(&public).unwrap().verifying_key().unwrap();
        let blob = tpm
            .quote(&quote_qualifying_data(nonce), &[0, 1, 2, 3, 4, 5, 6, 7])
            .unwrap();
        (blob.marshal().unwrap(), key)
    }

    #[test]
    fn test_quote_verifies() {
        let mut tpm = SoftwareTpm::new();
        let (quote, key) = quote_for(&mut tpm, "n1");
        let values = verify_quote(&quote, &key, "n1").unwrap();
        assert_eq!(values.len(), 8);
    }

    #[test]
    fn test_quote_bound_to_nonce() {
        let mut tpm = SoftwareTpm::new();
        let (quote, key) = quote_for(&mut tpm, "n1");
        assert!(matches!(
            verify_quote(&quote, &key, "n2"),
            Err(VerificationError::QuoteInvalid(_))
        ));
    }

    #[test]
    fn test_substituted_pcr_value_rejected() {
        let mut tpm = SoftwareTpm::new();
        let (quote, key) = quote_for(&mut tpm, "n1");
        let mut blob = QuoteBlob::unmarshal(&quote).unwrap();
        blob.pcr_values[3].value = vec![0xaa; 32];
        let forged = blob.marshal().unwrap();
        assert!(matches!(
            verify_quote(&forged, &key, "n1"),
            Err(VerificationError::QuoteInvalid(_))
        ));
    }

    #[test]
    fn test_dropped_pcr_value_rejected() {
        let mut tpm = SoftwareTpm::new();
        let (quote, key) = quote_for(&mut tpm, "n1");
        let mut blob = QuoteBlob::unmarshal(&quote).unwrap();
        blob.pcr_values.pop();
        let forged = blob.marshal().unwrap();
        assert!(verify_quote(&forged, &key, "n1").is_err());
    }

    #[test]
    fn test_certify_attest_is_not_a_quote() {
        let mut tpm = SoftwareTpm::new();
        tpm.load_or_create_ak().unwrap();
        let public = tpm.create_app_key().unwrap();
        let output = tpm
            .certify_app_key(&certify_qualifying_data(&public, "n1"))
            .unwrap();
        // Signed by the AK, not the App Key, so the signature check fails first.
        let blob = QuoteBlob {
            attest: output.certify_info,
            signature: output.signature,
            pcr_values: vec![],
        };
        let key = EccPublic::unmarshal(&public).unwrap().verifying_key().unwrap();
        assert!(matches!(
            verify_quote(&blob.marshal().unwrap(), &key, "n1"),
            Err(VerificationError::QuoteInvalid(_))
        ));
    }

    #[test]
    fn test_empty_quote_rejected() {
        let mut tpm = SoftwareTpm::new();
        let (_, key) = quote_for(&mut tpm, "n1");
        assert!(matches!(
            verify_quote(&[], &key, "n1"),
            Err(VerificationError::QuoteInvalid(_))
        ));
    }
}
