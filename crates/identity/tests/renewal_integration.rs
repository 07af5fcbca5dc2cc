//! Renewal against live key hierarchies.
//!
//! A node whose TPM starts failing must lapse after the configured number of
//! rounds and stay lapsed when the hardware comes back. A faulting node must
//! not disturb rounds for its neighbours.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aegis_identity::{
    load_baseline, LocalRound, LoggingIssuer, NodeRegistry, NodeState, RenewalLoop,
    RenewalPolicy, RoundOutcome, VerificationError,
};

use common::{builder, verifier, Authorities, Fault, FlakyTpm};

fn policy(max_consecutive_failures: u32) -> RenewalPolicy {
    RenewalPolicy {
        period: Duration::from_secs(10),
        identity_ttl: Duration::from_secs(60),
        max_consecutive_failures,
    }
}

#[tokio::test]
async fn test_failing_tpm_lapses_and_stays_lapsed() {
    let registry = NodeRegistry::new();
    let mut authorities = Authorities::new();
    let failing = Arc::new(AtomicBool::new(false));
    let node = authorities
        .enroll(
            &registry,
            "node-a",
            FlakyTpm::wrap(Fault::Unavailable, Arc::clone(&failing)),
        )
        .await;

    let round = LocalRound::new(builder(&node), verifier(&authorities.anchors, &registry));
    let renewal = RenewalLoop::new(
        "node-a",
        Arc::new(round),
        Arc::new(LoggingIssuer),
        registry.clone(),
        policy(2),
    );

    assert!(matches!(
        renewal.run_once().await.unwrap(),
        RoundOutcome::Renewed { .. }
    ));
    assert!(matches!(
        registry.get("node-a").unwrap().state,
        NodeState::Active { .. }
    ));

    failing.store(true, Ordering::SeqCst);
    match renewal.run_once().await.unwrap() {
        RoundOutcome::Failed { failures, .. } => assert_eq!(failures, 1),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(renewal.run_once().await.unwrap(), RoundOutcome::Expired);

    // Hardware recovers, but the identity is not renewed.
    failing.store(false, Ordering::SeqCst);
    assert_eq!(renewal.run_once().await.unwrap(), RoundOutcome::Skipped);
    assert!(registry.get("node-a").unwrap().is_expired());

    registry.reenroll("node-a").unwrap();
    assert!(matches!(
        renewal.run_once().await.unwrap(),
        RoundOutcome::Renewed { .. }
    ));
    assert_eq!(registry.get("node-a").unwrap().consecutive_failures, 0);
}

#[tokio::test]
async fn test_single_success_resets_failure_count() {
    let registry = NodeRegistry::new();
    let mut authorities = Authorities::new();
    let failing = Arc::new(AtomicBool::new(true));
    let node = authorities
        .enroll(
            &registry,
            "node-a",
            FlakyTpm::wrap(Fault::Unavailable, Arc::clone(&failing)),
        )
        .await;

    let round = LocalRound::new(builder(&node), verifier(&authorities.anchors, &registry));
    let renewal = RenewalLoop::new(
        "node-a",
        Arc::new(round),
        Arc::new(LoggingIssuer),
        registry.clone(),
        policy(3),
    );

    for expected in 1..=2 {
        match renewal.run_once().await.unwrap() {
            RoundOutcome::Failed { failures, .. } => assert_eq!(failures, expected),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    failing.store(false, Ordering::SeqCst);
    assert!(matches!(
        renewal.run_once().await.unwrap(),
        RoundOutcome::Renewed { .. }
    ));

    failing.store(true, Ordering::SeqCst);
    match renewal.run_once().await.unwrap() {
        RoundOutcome::Failed { failures, .. } => assert_eq!(failures, 1),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_panicking_node_does_not_affect_neighbour() {
    let registry = NodeRegistry::new();
    let mut authorities = Authorities::new();
    let failing = Arc::new(AtomicBool::new(true));
    let healthy = authorities.enroll_software(&registry, "node-a").await;
    let faulty = authorities
        .enroll(
            &registry,
            "node-b",
            FlakyTpm::wrap(Fault::Panic, Arc::clone(&failing)),
        )
        .await;
    let verifier = verifier(&authorities.anchors, &registry);

    let healthy_builder = builder(&healthy);
    let faulty_builder = builder(&faulty);
    let nonce_a = verifier.issue_nonce().unwrap();
    let nonce_b = verifier.issue_nonce().unwrap();

    let (result_a, result_b) = tokio::join!(
        async {
            let payload = healthy_builder.build(&nonce_a).await;
            verifier.verify(&payload, &nonce_a).await
        },
        async {
            let payload = faulty_builder.build(&nonce_b).await;
            verifier.verify(&payload, &nonce_b).await
        },
    );

    assert!(result_a.verified, "rejected: {:?}", result_a.rejection);
    assert!(!result_b.verified);
    assert!(matches!(
        result_b.rejection,
        Some(VerificationError::QuoteInvalid(_))
    ));

    // The panic was contained; the same worker still answers.
    failing.store(false, Ordering::SeqCst);
    let nonce = verifier.issue_nonce().unwrap();
    let payload = faulty_builder.build(&nonce).await;
    assert!(verifier.verify(&payload, &nonce).await.verified);
}

#[tokio::test]
async fn test_renewal_loop_stops_on_shutdown() {
    let registry = NodeRegistry::new();
    let mut authorities = Authorities::new();
    let node = authorities.enroll_software(&registry, "node-a").await;

    let round = LocalRound::new(builder(&node), verifier(&authorities.anchors, &registry));
    let renewal = RenewalLoop::new(
        "node-a",
        Arc::new(round),
        Arc::new(LoggingIssuer),
        registry.clone(),
        RenewalPolicy {
            period: Duration::from_millis(100),
            identity_ttl: Duration::from_secs(60),
            max_consecutive_failures: 3,
        },
    );

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(renewal.run(async {
        let _ = rx.await;
    }));

    tokio::time::sleep(Duration::from_millis(350)).await;
    tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(
        registry.get("node-a").unwrap().state,
        NodeState::Active { .. }
    ));
}

#[tokio::test]
async fn test_self_attestation_renews_with_baseline_from_file() {
    let enrolled = NodeRegistry::new();
    let mut authorities = Authorities::new();
    let node = authorities.enroll_software(&enrolled, "node-a").await;

    let path = std::env::temp_dir().join(format!("aegis-baseline-{}.json", uuid::Uuid::new_v4()));
    std::fs::write(&path, serde_json::to_vec(&node.baseline).unwrap()).unwrap();
    let baseline = load_baseline(&path);
    std::fs::remove_file(&path).unwrap();

    // Registry of the node's own verifier, seeded from the file.
    let registry = NodeRegistry::new();
    registry.enroll("node-a", Some(baseline.unwrap()), None).unwrap();
    let renewal = RenewalLoop::new(
        "node-a",
        Arc::new(LocalRound::new(builder(&node), verifier(&authorities.anchors, &registry))),
        Arc::new(LoggingIssuer),
        registry.clone(),
        policy(3),
    );
    assert!(matches!(
        renewal.run_once().await.unwrap(),
        RoundOutcome::Renewed { .. }
    ));

    // Without a baseline the same node can only fail.
    let bare = NodeRegistry::new();
    bare.enroll("node-a", None, None).unwrap();
    let renewal = RenewalLoop::new(
        "node-a",
        Arc::new(LocalRound::new(builder(&node), verifier(&authorities.anchors, &bare))),
        Arc::new(LoggingIssuer),
        bare.clone(),
        policy(3),
    );
    assert!(matches!(
        renewal.run_once().await.unwrap(),
        RoundOutcome::Failed { failures: 1, .. }
    ));
}
