//! Sovereign attestation wire types.
//!
//! A [`SovereignAttestation`] is built once per round by the node-side
//! builder and consumed once by the verifier. Byte fields are opaque TPM
//! structures, hex-encoded on the wire. A [`VerificationResult`] carries
//! claims only when `verified` is true.
//!
//! # Round Flow
//!
//! 1. Verifier issues a nonce
//! 2. Builder: App Key → delegated certification → quote → payload
//! 3. Verifier: nonce → chain → quote → claims
//! 4. Identity issuer embeds the claims, renewal repeats

use serde::{Deserialize, Serialize};

use crate::error::{IdentityResult, VerificationError};

/// All baseline and policy checks passed.
pub const HOST_INTEGRITY_PASSED: &str = "passed_all_checks";
/// Quote verified but no baseline is enrolled for the node.
pub const HOST_INTEGRITY_NO_BASELINE: &str = "baseline_unavailable";

/// Attestation payload sent from builder to verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SovereignAttestation {
    /// Marshalled quote blob; empty when the quote could not be produced.
    #[serde(with = "hex::serde")]
    pub quote: Vec<u8>,
    /// Marshalled `TPMT_PUBLIC` of the Application Key.
    #[serde(with = "hex::serde")]
    pub app_key_public: Vec<u8>,
    /// Delegated certificate; empty when certification failed.
    #[serde(with = "hex::serde")]
    pub app_key_certificate: Vec<u8>,
    pub challenge_nonce: String,
    pub node_uuid: String,
}

impl SovereignAttestation {
    pub fn to_json(&self) -> IdentityResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> IdentityResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// True when both the quote and the certificate are present.
    pub fn is_complete(&self) -> bool {
        !self.quote.is_empty() && !self.app_key_certificate.is_empty()
    }
}

/// Mobile-network location claim registered for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MobileSensorLocation {
    pub sensor_id: String,
    #[serde(default = "default_sensor_type")]
    pub sensor_type: String,
    #[serde(default)]
    pub sensor_imei: String,
    #[serde(default)]
    pub sensor_imsi: String,
    #[serde(default)]
    pub msisdn: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Radius in metres.
    pub accuracy: f64,
}

fn default_sensor_type() -> String {
    "mobile".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationStatus {
    /// Confirmed by the location-verification service.
    Verified,
    /// Service denied, failed or timed out.
    Unverified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeolocationClaim {
    pub status: LocationStatus,
    pub location: MobileSensorLocation,
}

impl GeolocationClaim {
    pub fn is_verified(&self) -> bool {
        self.status == LocationStatus::Verified
    }
}

/// Accelerator health snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceleratorMetrics {
    pub status: String,
    pub utilization_pct: f64,
    pub memory_mb: u64,
}

/// Claims attached to a passing verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestedClaims {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geolocation: Option<GeolocationClaim>,
    pub host_integrity_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accelerator_metrics: Option<AcceleratorMetrics>,
}

/// Verifier verdict handed to the identity issuer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verified: bool,
    pub claims: Option<AttestedClaims>,
    pub audit_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<VerificationError>,
}

impl VerificationResult {
    pub fn accepted(audit_id: String, claims: AttestedClaims) -> Self {
        Self {
            verified: true,
            claims: Some(claims),
            audit_id,
            rejection: None,
        }
    }

    pub fn rejected(audit_id: String, reason: VerificationError) -> Self {
        Self {
            verified: false,
            claims: None,
            audit_id,
            rejection: Some(reason),
        }
    }
}
