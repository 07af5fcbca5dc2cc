use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use aegis_core::{logging, Config};
use aegis_identity::structures::name_of;
use aegis_identity::{
    certification, load_baseline, AttestationBuilder, AttestationVerifier, CertificationService,
    KeyHierarchyManager, LocalCertificationClient, LocalRound, LoggingIssuer, NodeRegistry,
    RenewalLoop, RenewalPolicy, API_VERSION,
};

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    certification_api: &'static str,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            certification_api: API_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let config = match parse_config_path(&args)? {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => {
            let mut config = Config::default_config();
            config.apply_env_overrides();
            config.validate()?;
            config
        }
    };
    logging::init_with(config.node.log_format);
    info!(
        node_uuid = %config.node.node_uuid,
        device = ?config.tpm.device,
        "aegis-node starting"
    );

    let keys = KeyHierarchyManager::from_config(&config.tpm).await?;
    let ak_public = keys.ak_public().await.context("loading Attestation Key")?;
    info!(ak_name = %hex::encode(name_of(&ak_public)), "Attestation Key resident");
    if !keys.is_enrolled() {
        warn!("AK certificate not installed; certification requests will report AKNotReady");
    }

    let service = Arc::new(CertificationService::new(
        keys.clone(),
        config.node.node_uuid.clone(),
        config.node.certify_rate_limit,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let renewal = if config.verifier.trust_anchor_path.is_some() {
        Some(tokio::spawn(
            self_attestation(&config, keys, Arc::clone(&service))?.run(wait_for(shutdown_rx.clone())),
        ))
    } else {
        info!("no trust anchors configured, self-attestation disabled");
        None
    };

    let listener = certification::bind(&config.node.listen_addr).await?;
    let server = tokio::spawn(certification::serve(
        listener,
        service,
        wait_for(shutdown_rx),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    server.await??;
    if let Some(renewal) = renewal {
        renewal.await?;
    }
    info!("aegis-node stopped");
    Ok(())
}

/// Renewal loop attesting this node against itself with the configured
/// verifier policy and the operator-supplied baseline.
fn self_attestation(
    config: &Config,
    keys: KeyHierarchyManager,
    service: Arc<CertificationService>,
) -> anyhow::Result<RenewalLoop> {
    let baseline = match &config.verifier.baseline_path {
        Some(path) => Some(
            load_baseline(path)
                .with_context(|| format!("loading baseline from {}", path.display()))?,
        ),
        None if config.verifier.require_baseline => {
            bail!("verifier.require_baseline is set but no verifier.baseline_path is configured")
        }
        None => {
            warn!("no baseline configured; self-attestation will report baseline_unavailable");
            None
        }
    };
    let registry = NodeRegistry::new();
    registry.enroll(config.node.node_uuid.clone(), baseline, None)?;
    let verifier = AttestationVerifier::from_config(&config.verifier, registry.clone())?;
    let builder = AttestationBuilder::new(
        keys,
        Arc::new(LocalCertificationClient::new(service)),
        config.verifier.pcr_selection.clone(),
        config.node.node_uuid.clone(),
    );
    Ok(RenewalLoop::new(
        config.node.node_uuid.clone(),
        Arc::new(LocalRound::new(builder, verifier)),
        Arc::new(LoggingIssuer),
        registry,
        RenewalPolicy::from_config(&config.renewal),
    ))
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn parse_config_path(args: &[String]) -> anyhow::Result<Option<PathBuf>> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(Some(PathBuf::from(path)));
            }
            bail!("--config was provided without a path");
        }
    }
    Ok(None)
}
