//! Sovereign attestation for hardware-bound workload identities.
//!
//! This crate binds workload identities to the TPM a workload runs on and,
//! optionally, to its location. A node proves possession of a session
//! Application Key certified by its Attestation Key, which is in turn
//! certified under the chip's Endorsement Key, and quotes its platform state
//! over a single-use nonce. The verifier turns that proof into a trust
//! decision with claims, and the renewal loop repeats it until the node
//! stops passing.
//!
//! # Core Concepts
//!
//! - **Key Hierarchy**: EK → AK → App Key, with certification edges only
//!   pointing downwards
//! - **Delegated Certification**: the AK vouching for a caller's App Key
//! - **Sovereign Attestation**: quote, App Key, certificate, nonce, node UUID
//! - **Fail-closed Renewal**: no revocation channel, unrenewed identities lapse
//!
//! # Security Model
//!
//! - Private key material never leaves the TPM
//! - All hardware access is serialized on one worker thread, and hardware
//!   faults become typed errors before reaching any caller
//! - Nonces are single-use
//! - Every verification outcome is audited, and claims are only produced
//!   for passing rounds

pub mod attestation;
pub mod builder;
pub mod certification;
pub mod device;
pub mod error;
pub mod facts;
#[cfg(feature = "hardware-tpm")]
pub mod hardware;
pub mod pki;
pub mod registry;
pub mod renewal;
pub mod replay_protection;
pub mod structures;
pub mod tpm;
pub mod verifier;

pub use attestation::{
    AcceleratorMetrics, AttestedClaims, GeolocationClaim, LocationStatus, MobileSensorLocation,
    SovereignAttestation, VerificationResult,
};
pub use builder::AttestationBuilder;
pub use certification::{
    CertificationClient, CertificationService, DelegatedCertificate, HttpCertificationClient,
    LocalCertificationClient, API_VERSION, CERTIFY_PATH,
};
pub use device::{SoftwareTpm, TpmDevice};
pub use error::{
    CertificationError, IdentityError, IdentityResult, StructureError, TpmError,
    VerificationError,
};
pub use facts::{AcceleratorTelemetry, FactProvider, HttpLocationVerifier, LocationVerifier};
pub use pki::{
    AppKeyCertificate, AttestationKeyCertificate, CertificateAuthority, EndorsementCertificate,
    TrustAnchorBundle, TrustAnchors,
};
pub use registry::{load_baseline, NodeRecord, NodeRegistry, NodeState};
pub use renewal::{
    AttestationRound, IdentityIssuer, LocalRound, LoggingIssuer, RenewalLoop, RenewalPolicy,
    RoundOutcome,
};
pub use replay_protection::NonceRegistry;
pub use tpm::{AppKeyHandle, CallPolicy, KeyHierarchyManager, PcrValue};
pub use verifier::{AttestationVerifier, AuditRecord, VerifierPolicy};
