//! Claims attached to a passing verification.
//!
//! The [`FactProvider`] only runs after the verifier has accepted a round and
//! has no way to reject it: a location service outage or missing telemetry
//! degrades the claims, never the verdict. Location is default-deny. A claim
//! the collaborator does not confirm within the timeout is reported as
//! [`LocationStatus::Unverified`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::attestation::{
    AcceleratorMetrics, AttestedClaims, GeolocationClaim, LocationStatus, MobileSensorLocation,
    HOST_INTEGRITY_NO_BASELINE, HOST_INTEGRITY_PASSED,
};
use crate::error::{IdentityError, IdentityResult};
use crate::registry::NodeRegistry;

/// External `VerifyLocation(claim) -> bool` collaborator.
#[async_trait]
pub trait LocationVerifier: Send + Sync {
    async fn verify_location(&self, claim: &MobileSensorLocation) -> IdentityResult<bool>;
}

/// Optional accelerator health source.
#[async_trait]
pub trait AcceleratorTelemetry: Send + Sync {
    async fn metrics(&self, node_uuid: &str) -> IdentityResult<AcceleratorMetrics>;
}

/// Outcome of the baseline comparison, as reported in claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostIntegrity {
    Passed,
    BaselineUnavailable,
}

impl HostIntegrity {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostIntegrity::Passed => HOST_INTEGRITY_PASSED,
            HostIntegrity::BaselineUnavailable => HOST_INTEGRITY_NO_BASELINE,
        }
    }
}

#[derive(Deserialize)]
struct VerifyLocationResponse {
    #[serde(default)]
    verification_result: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

/// Location collaborator reached over HTTP: `POST {base}/verify`.
#[derive(Debug, Clone)]
pub struct HttpLocationVerifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLocationVerifier {
    pub fn new(base_url: &str, timeout: Duration) -> IdentityResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IdentityError::Config(format!("location client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/verify", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl LocationVerifier for HttpLocationVerifier {
    async fn verify_location(&self, claim: &MobileSensorLocation) -> IdentityResult<bool> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(claim)
            .send()
            .await
            .map_err(|e| IdentityError::LocationUnverified(e.to_string()))?;

        let status = resp.status();
        let body: VerifyLocationResponse = resp
            .json()
            .await
            .map_err(|e| IdentityError::LocationUnverified(format!("response body: {e}")))?;

        if !status.is_success() {
            return Err(IdentityError::LocationUnverified(format!(
                "{}: {}",
                status,
                body.error.unwrap_or_default()
            )));
        }
        Ok(body.verification_result.unwrap_or(false))
    }
}

/// Builds [`AttestedClaims`] for accepted rounds.
#[derive(Clone)]
pub struct FactProvider {
    registry: NodeRegistry,
    location: Option<Arc<dyn LocationVerifier>>,
    accelerator: Option<Arc<dyn AcceleratorTelemetry>>,
    timeout: Duration,
}

impl std::fmt::Debug for FactProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactProvider")
            .field("location", &self.location.is_some())
            .field("accelerator", &self.accelerator.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl FactProvider {
    pub fn new(registry: NodeRegistry, timeout: Duration) -> Self {
        Self {
            registry,
            location: None,
            accelerator: None,
            timeout,
        }
    }

    pub fn with_location_verifier(mut self, verifier: Arc<dyn LocationVerifier>) -> Self {
        self.location = Some(verifier);
        self
    }

    pub fn with_accelerator_telemetry(mut self, telemetry: Arc<dyn AcceleratorTelemetry>) -> Self {
        self.accelerator = Some(telemetry);
        self
    }

    /// Claims for `node_uuid` after a passing verification. Host integrity
    /// is whatever the verifier's baseline comparison decided; it is never
    /// inferred here.
    pub async fn claims_for(&self, node_uuid: &str, integrity: HostIntegrity) -> AttestedClaims {
        let (geolocation, accelerator_metrics) =
            tokio::join!(self.geolocation(node_uuid), self.accelerator(node_uuid));
        AttestedClaims {
            geolocation,
            host_integrity_status: integrity.as_str().to_string(),
            accelerator_metrics,
        }
    }

    async fn geolocation(&self, node_uuid: &str) -> Option<GeolocationClaim> {
        let location = self.registry.location(node_uuid)?;
        let status = match &self.location {
            None => {
                debug!(node_uuid, "no location verifier configured");
                LocationStatus::Unverified
            }
            Some(verifier) => {
                match tokio::time::timeout(self.timeout, verifier.verify_location(&location)).await
                {
                    Ok(Ok(true)) => LocationStatus::Verified,
                    Ok(Ok(false)) => {
                        warn!(node_uuid, sensor_id = %location.sensor_id, "location denied");
                        LocationStatus::Unverified
                    }
                    Ok(Err(e)) => {
                        warn!(node_uuid, error = %e, "location verification failed");
                        LocationStatus::Unverified
                    }
                    Err(_) => {
                        warn!(
                            node_uuid,
                            timeout_ms = self.timeout.as_millis() as u64,
                            "location verification timed out"
                        );
                        LocationStatus::Unverified
                    }
                }
            }
        };
        Some(GeolocationClaim { status, location })
    }

    async fn accelerator(&self, node_uuid: &str) -> Option<AcceleratorMetrics> {
        let telemetry = self.accelerator.as_ref()?;
        match tokio::time::timeout(self.timeout, telemetry.metrics(node_uuid)).await {
            Ok(Ok(metrics)) => Some(metrics),
            Ok(Err(e)) => {
                warn!(node_uuid, error = %e, "accelerator telemetry unavailable");
                None
            }
            Err(_) => {
                warn!(node_uuid, "accelerator telemetry timed out");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::PcrValue;

    struct FixedVerifier(bool);

    #[async_trait]
    impl LocationVerifier for FixedVerifier {
        async fn verify_location(&self, _claim: &MobileSensorLocation) -> IdentityResult<bool> {
            Ok(self.0)
        }
    }

    struct HangingVerifier;

    #[async_trait]
    impl LocationVerifier for HangingVerifier {
        async fn verify_location(&self, _claim: &MobileSensorLocation) -> IdentityResult<bool> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(true)
        }
    }

    struct BrokenTelemetry;

    #[async_trait]
    impl AcceleratorTelemetry for BrokenTelemetry {
        async fn metrics(&self, _node_uuid: &str) -> IdentityResult<AcceleratorMetrics> {
            Err(IdentityError::InvalidState("nvidia-smi not found".into()))
        }
    }

    fn sensor() -> MobileSensorLocation {
        MobileSensorLocation {
            sensor_id: "12d1:1433".into(),
            sensor_type: "mobile".into(),
            sensor_imei: "356345043865103".into(),
            sensor_imsi: "214070610960475".into(),
            msisdn: "tel:+34696810912".into(),
            latitude: 40.33,
            longitude: -3.7707,
            accuracy: 7.0,
        }
    }

    fn registry_with_location() -> NodeRegistry {
        let registry = NodeRegistry::new();
        registry.enroll("node-1", None, Some(sensor())).unwrap();
        registry
    }

    #[tokio::test]
    async fn test_confirmed_location_is_verified() {
        let provider = FactProvider::new(registry_with_location(), Duration::from_secs(1))
            .with_location_verifier(Arc::new(FixedVerifier(true)));
        let claims = provider.claims_for("node-1", HostIntegrity::Passed).await;
        assert!(claims.geolocation.unwrap().is_verified());
        assert_eq!(claims.host_integrity_status, "passed_all_checks");
    }

    #[tokio::test]
    async fn test_location_timeout_is_unverified() {
        let provider = FactProvider::new(registry_with_location(), Duration::from_millis(20))
            .with_location_verifier(Arc::new(HangingVerifier));
        let claims = provider.claims_for("node-1", HostIntegrity::Passed).await;
        assert_eq!(claims.geolocation.unwrap().status, LocationStatus::Unverified);
    }

    #[tokio::test]
    async fn test_missing_verifier_is_unverified() {
        let provider = FactProvider::new(registry_with_location(), Duration::from_secs(1));
        let claims = provider
            .claims_for("node-1", HostIntegrity::BaselineUnavailable)
            .await;
        assert!(!claims.geolocation.unwrap().is_verified());
        assert_eq!(claims.host_integrity_status, "baseline_unavailable");
    }

    #[tokio::test]
    async fn test_telemetry_outage_drops_metrics() {
        let provider = FactProvider::new(NodeRegistry::new(), Duration::from_secs(1))
            .with_accelerator_telemetry(Arc::new(BrokenTelemetry));
        let claims = provider.claims_for("node-1", HostIntegrity::Passed).await;
        assert!(claims.accelerator_metrics.is_none());
        assert!(claims.geolocation.is_none());
    }

    #[tokio::test]
    async fn test_enrolled_baseline_alone_does_not_pass_integrity() {
        let registry = NodeRegistry::new();
        let baseline = vec![PcrValue {
            index: 0,
            value: vec![0; 32],
        }];
        registry.enroll("node-1", Some(baseline), None).unwrap();
        let provider = FactProvider::new(registry, Duration::from_secs(1));

        let claims = provider
            .claims_for("node-1", HostIntegrity::BaselineUnavailable)
            .await;
        assert_eq!(claims.host_integrity_status, "baseline_unavailable");
    }
}
