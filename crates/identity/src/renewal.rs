//! Fail-closed renewal loop.
//!
//! Every period the node is re-attested end to end with a fresh nonce. A
//! passing round renews the identity; a failing one only counts against the
//! node. After the configured number of consecutive failures the node is
//! expired and stays expired until re-enrolled, whatever the hardware does
//! afterwards. There is no revocation message. An identity that is not
//! renewed simply lapses.
//!
//! Rounds never overlap: each is bounded by one period and a late tick is
//! skipped rather than queued.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use aegis_core::config::RenewalConfig;

use crate::attestation::{AttestedClaims, VerificationResult};
use crate::builder::AttestationBuilder;
use crate::error::IdentityResult;
use crate::registry::{current_timestamp, NodeRegistry, NodeState};
use crate::verifier::AttestationVerifier;

/// One attestation round for a node: nonce, payload, verdict.
#[async_trait]
pub trait AttestationRound: Send + Sync {
    async fn run(&self, node_uuid: &str) -> VerificationResult;
}

/// External identity-issuance framework. Receives claims from passing
/// rounds only.
#[async_trait]
pub trait IdentityIssuer: Send + Sync {
    async fn issue(
        &self,
        node_uuid: &str,
        claims: &AttestedClaims,
        audit_id: &str,
        ttl: Duration,
    ) -> IdentityResult<()>;
}

/// Issuer that only records the decision in the log.
#[derive(Debug, Clone, Default)]
pub struct LoggingIssuer;

#[async_trait]
impl IdentityIssuer for LoggingIssuer {
    async fn issue(
        &self,
        node_uuid: &str,
        claims: &AttestedClaims,
        audit_id: &str,
        ttl: Duration,
    ) -> IdentityResult<()> {
        info!(
            node_uuid,
            audit_id,
            host_integrity = %claims.host_integrity_status,
            ttl_secs = ttl.as_secs(),
            "identity issued"
        );
        Ok(())
    }
}

/// Builder and verifier in one process.
#[derive(Debug)]
pub struct LocalRound {
    builder: AttestationBuilder,
    verifier: AttestationVerifier,
}

impl LocalRound {
    pub fn new(builder: AttestationBuilder, verifier: AttestationVerifier) -> Self {
        Self { builder, verifier }
    }
}

#[async_trait]
impl AttestationRound for LocalRound {
    async fn run(&self, _node_uuid: &str) -> VerificationResult {
        let nonce = match self.verifier.issue_nonce() {
            Ok(nonce) => nonce,
            Err(e) => return VerificationResult::rejected(Uuid::new_v4().to_string(), e),
        };
        let payload = self.builder.build(&nonce).await;
        self.verifier.verify(&payload, &nonce).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RenewalPolicy {
    pub period: Duration,
    pub identity_ttl: Duration,
    pub max_consecutive_failures: u32,
}

impl RenewalPolicy {
    pub fn from_config(config: &RenewalConfig) -> Self {
        Self {
            period: config.period(),
            identity_ttl: config.identity_ttl(),
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self::from_config(&RenewalConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Renewed { audit_id: String },
    Failed { audit_id: String, failures: u32 },
    TimedOut { failures: u32 },
    /// Threshold reached on this round.
    Expired,
    /// Node already expired; no round was run.
    Skipped,
}

pub struct RenewalLoop {
    node_uuid: String,
    round: Arc<dyn AttestationRound>,
    issuer: Arc<dyn IdentityIssuer>,
    registry: NodeRegistry,
    policy: RenewalPolicy,
}

impl std::fmt::Debug for RenewalLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalLoop")
            .field("node_uuid", &self.node_uuid)
            .field("policy", &self.policy)
            .finish()
    }
}

impl RenewalLoop {
    pub fn new(
        node_uuid: impl Into<String>,
        round: Arc<dyn AttestationRound>,
        issuer: Arc<dyn IdentityIssuer>,
        registry: NodeRegistry,
        policy: RenewalPolicy,
    ) -> Self {
        Self {
            node_uuid: node_uuid.into(),
            round,
            issuer,
            registry,
            policy,
        }
    }

    /// Run one renewal round.
    pub async fn run_once(&self) -> IdentityResult<RoundOutcome> {
        if self.registry.get(&self.node_uuid)?.is_expired() {
            debug!(node_uuid = %self.node_uuid, "node expired, awaiting re-enrollment");
            return Ok(RoundOutcome::Skipped);
        }

        let result =
            match tokio::time::timeout(self.policy.period, self.round.run(&self.node_uuid)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(node_uuid = %self.node_uuid, "attestation round exceeded its period");
                    let state = self
                        .registry
                        .record_failure(&self.node_uuid, self.policy.max_consecutive_failures)?;
                    return Ok(self.failure_outcome(state, None));
                }
            };

        if let (true, Some(claims)) = (result.verified, result.claims.as_ref()) {
            match self
                .issuer
                .issue(&self.node_uuid, claims, &result.audit_id, self.policy.identity_ttl)
                .await
            {
                Ok(()) => {
                    self.registry
                        .record_success(&self.node_uuid, self.policy.identity_ttl)?;
                    info!(node_uuid = %self.node_uuid, audit_id = %result.audit_id, "identity renewed");
                    return Ok(RoundOutcome::Renewed {
                        audit_id: result.audit_id,
                    });
                }
                Err(e) => {
                    error!(node_uuid = %self.node_uuid, error = %e, "identity issuance failed");
                }
            }
        }

        let state = self
            .registry
            .record_failure(&self.node_uuid, self.policy.max_consecutive_failures)?;
        Ok(self.failure_outcome(state, Some(result.audit_id)))
    }

    fn failure_outcome(&self, state: NodeState, audit_id: Option<String>) -> RoundOutcome {
        if matches!(state, NodeState::Expired { .. }) {
            warn!(node_uuid = %self.node_uuid, "renewal threshold reached, identity will not be renewed");
            return RoundOutcome::Expired;
        }
        let failures = self
            .registry
            .get(&self.node_uuid)
            .map(|record| record.consecutive_failures)
            .unwrap_or_default();
        match audit_id {
            Some(audit_id) => RoundOutcome::Failed { audit_id, failures },
            None => RoundOutcome::TimedOut { failures },
        }
    }

    /// Run rounds every period until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(self.policy.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        info!(
            node_uuid = %self.node_uuid,
            period_secs = self.policy.period.as_secs(),
            "STATUS: RenewalLoop :: ACTIVE"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.registry.expire_lapsed(current_timestamp()) {
                        error!(error = %e, "expiry sweep failed");
                    }
                }
            }
            // A round in flight is abandoned on shutdown.
            tokio::select! {
                _ = &mut shutdown => break,
                outcome = self.run_once() => match outcome {
                    Ok(outcome) => debug!(node_uuid = %self.node_uuid, ?outcome, "renewal round finished"),
                    Err(e) => error!(node_uuid = %self.node_uuid, error = %e, "renewal round failed"),
                },
            }
        }
        info!(node_uuid = %self.node_uuid, "renewal loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::HOST_INTEGRITY_PASSED;
    use crate::error::VerificationError;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Fails while `healthy` is false.
    struct ScriptedRound {
        healthy: AtomicBool,
        runs: AtomicU32,
    }

    impl ScriptedRound {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                runs: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl AttestationRound for ScriptedRound {
        async fn run(&self, _node_uuid: &str) -> VerificationResult {
            let n = self.runs.fetch_add(1, Ordering::SeqCst);
            let audit_id = format!("audit-{n}");
            if self.healthy.load(Ordering::SeqCst) {
                VerificationResult::accepted(
                    audit_id,
                    AttestedClaims {
                        geolocation: None,
                        host_integrity_status: HOST_INTEGRITY_PASSED.to_string(),
                        accelerator_metrics: None,
                    },
                )
            } else {
                VerificationResult::rejected(
                    audit_id,
                    VerificationError::QuoteInvalid("device unavailable".into()),
                )
            }
        }
    }

    struct SlowRound;

    #[async_trait]
    impl AttestationRound for SlowRound {
        async fn run(&self, _node_uuid: &str) -> VerificationResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            VerificationResult::rejected(String::new(), VerificationError::QuoteInvalid(String::new()))
        }
    }

    fn policy(threshold: u32) -> RenewalPolicy {
        RenewalPolicy {
            period: Duration::from_millis(200),
            identity_ttl: Duration::from_secs(300),
            max_consecutive_failures: threshold,
        }
    }

    fn registry() -> NodeRegistry {
        let registry = NodeRegistry::new();
        registry.enroll("node-1", None, None).unwrap();
        registry
    }

    #[tokio::test]
    async fn test_passing_round_renews() {
        let registry = registry();
        let renewal = RenewalLoop::new(
            "node-1",
            ScriptedRound::new(true),
            Arc::new(LoggingIssuer),
            registry.clone(),
            policy(3),
        );
        assert_eq!(
            renewal.run_once().await.unwrap(),
            RoundOutcome::Renewed {
                audit_id: "audit-0".into()
            }
        );
        assert!(matches!(
            registry.get("node-1").unwrap().state,
            NodeState::Active { .. }
        ));
    }

    #[tokio::test]
    async fn test_threshold_expires_and_recovery_does_not_renew() {
        let registry = registry();
        let round = ScriptedRound::new(false);
        let renewal = RenewalLoop::new(
            "node-1",
            round.clone(),
            Arc::new(LoggingIssuer),
            registry.clone(),
            policy(2),
        );

        assert!(matches!(
            renewal.run_once().await.unwrap(),
            RoundOutcome::Failed { failures: 1, .. }
        ));
        assert_eq!(renewal.run_once().await.unwrap(), RoundOutcome::Expired);

        round.healthy.store(true, Ordering::SeqCst);
        assert_eq!(renewal.run_once().await.unwrap(), RoundOutcome::Skipped);
        assert_eq!(round.runs.load(Ordering::SeqCst), 2);

        registry.reenroll("node-1").unwrap();
        assert!(matches!(
            renewal.run_once().await.unwrap(),
            RoundOutcome::Renewed { .. }
        ));
    }

    #[tokio::test]
    async fn test_round_bounded_by_period() {
        let registry = registry();
        let renewal = RenewalLoop::new(
            "node-1",
            Arc::new(SlowRound),
            Arc::new(LoggingIssuer),
            registry,
            policy(3),
        );
        assert_eq!(
            renewal.run_once().await.unwrap(),
            RoundOutcome::TimedOut { failures: 1 }
        );
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let registry = registry();
        let round = ScriptedRound::new(true);
        let renewal = RenewalLoop::new(
            "node-1",
            round.clone(),
            Arc::new(LoggingIssuer),
            registry,
            RenewalPolicy {
                period: Duration::from_millis(20),
                ..policy(3)
            },
        );
        renewal
            .run(tokio::time::sleep(Duration::from_millis(110)))
            .await;
        assert!(round.runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_round_in_flight() {
        let registry = registry();
        let renewal = RenewalLoop::new(
            "node-1",
            Arc::new(SlowRound),
            Arc::new(LoggingIssuer),
            registry.clone(),
            RenewalPolicy {
                period: Duration::from_secs(60),
                ..policy(3)
            },
        );

        tokio::time::timeout(
            Duration::from_secs(5),
            renewal.run(tokio::time::sleep(Duration::from_millis(50))),
        )
        .await
        .expect("loop kept running after shutdown");
        // The abandoned round is not counted against the node.
        assert_eq!(registry.get("node-1").unwrap().consecutive_failures, 0);
    }
}
