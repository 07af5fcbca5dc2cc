//! Sovereign attestation builder.
//!
//! Runs in the workload-identity agent. Once a nonce has been received a
//! payload is always produced: a failed certification or quote leaves that
//! field empty and the verifier rejects the round. The quote is taken once,
//! here, before the payload leaves the node.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::attestation::SovereignAttestation;
use crate::certification::CertificationClient;
use crate::error::CertificationError;
use crate::tpm::KeyHierarchyManager;

pub struct AttestationBuilder {
    keys: KeyHierarchyManager,
    certifier: Arc<dyn CertificationClient>,
    pcr_selection: Vec<u8>,
    node_uuid: String,
}

impl std::fmt::Debug for AttestationBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationBuilder")
            .field("node_uuid", &self.node_uuid)
            .field("pcr_selection", &self.pcr_selection)
            .finish()
    }
}

impl AttestationBuilder {
    pub fn new(
        keys: KeyHierarchyManager,
        certifier: Arc<dyn CertificationClient>,
        pcr_selection: Vec<u8>,
        node_uuid: impl Into<String>,
    ) -> Self {
        Self {
            keys,
            certifier,
            pcr_selection,
            node_uuid: node_uuid.into(),
        }
    }

    pub fn node_uuid(&self) -> &str {
        &self.node_uuid
    }

    /// App Key → delegated certification → quote → payload.
    pub async fn build(&self, nonce: &str) -> SovereignAttestation {
        let app_key_public = match self.keys.ensure_app_key().await {
            Ok(handle) => handle.public,
            Err(e) => {
                error!(node_uuid = %self.node_uuid, error = %e, "App Key unavailable");
                Vec::new()
            }
        };

        let app_key_certificate = if app_key_public.is_empty() {
            Vec::new()
        } else {
            match self.certifier.certify(&app_key_public, nonce).await {
                Ok(cert) => {
                    if cert.node_uuid != self.node_uuid {
                        warn!(
                            expected = %self.node_uuid,
                            reported = %cert.node_uuid,
                            "certification service reports a different node"
                        );
                    }
                    cert.certificate
                }
                Err(CertificationError::AkNotReady) => {
                    warn!(node_uuid = %self.node_uuid, "AK not enrolled yet, sending without certificate");
                    Vec::new()
                }
                Err(e) => {
                    warn!(node_uuid = %self.node_uuid, error = %e, "delegated certification failed");
                    Vec::new()
                }
            }
        };

        let quote = if app_key_public.is_empty() {
            Vec::new()
        } else {
            match self.keys.sign_quote(nonce, &self.pcr_selection).await {
                Ok(quote) => quote,
                Err(e) => {
                    warn!(node_uuid = %self.node_uuid, error = %e, "quote failed, sending empty quote");
                    Vec::new()
                }
            }
        };

        let payload = SovereignAttestation {
            quote,
            app_key_public,
            app_key_certificate,
            challenge_nonce: nonce.to_string(),
            node_uuid: self.node_uuid.clone(),
        };
        info!(
            node_uuid = %self.node_uuid,
            complete = payload.is_complete(),
            "attestation payload built"
        );
        payload
    }
}
