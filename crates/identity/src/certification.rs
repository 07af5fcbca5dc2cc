//! Delegated certification RPC.
//!
//! Runs on the node beside the TPM. A caller presents an Application Key
//! public blob and its challenge nonce; the service has the enrolled AK
//! certify the key and returns the certificate with the node UUID.
//!
//! # Security Properties
//!
//! - Loopback callers only: a certificate means "this key may speak for
//!   this node"
//! - Per-caller rate limit per minute
//! - Only the App Key resident in this TPM is certified
//! - Hardware runs on the key hierarchy worker; a device fault reaches a
//!   handler as an error value and never touches connection state

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::{CertificationError, IdentityError, IdentityResult, TpmError};
use crate::tpm::KeyHierarchyManager;

pub const API_VERSION: &str = "v2";
pub const CERTIFY_PATH: &str = "/v2/delegated_certification/certify_app_key";

const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertifyRequest {
    #[serde(default)]
    pub api_version: Option<String>,
    /// Hex-encoded `TPMT_PUBLIC`.
    #[serde(default)]
    pub app_key_public: Option<String>,
    #[serde(default)]
    pub challenge_nonce: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertifyResponse {
    pub result: String,
    /// Hex-encoded certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_key_certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CertifyResponse {
    fn success(cert: &DelegatedCertificate) -> Self {
        Self {
            result: "SUCCESS".to_string(),
            app_key_certificate: Some(hex::encode(&cert.certificate)),
            agent_uuid: Some(cert.node_uuid.clone()),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            result: "ERROR".to_string(),
            app_key_certificate: None,
            agent_uuid: None,
            error: Some(message.into()),
        }
    }
}

/// Certification outcome: serialized certificate plus the node's UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegatedCertificate {
    pub certificate: Vec<u8>,
    pub node_uuid: String,
}

/// `Certify(app_key_public, caller_nonce) -> (certificate, node_uuid)`.
#[async_trait]
pub trait CertificationClient: Send + Sync {
    async fn certify(
        &self,
        app_key_public: &[u8],
        nonce: &str,
    ) -> Result<DelegatedCertificate, CertificationError>;
}

/// Fixed one-minute window per caller address. A limit of 0 disables it.
#[derive(Debug)]
struct RateLimiter {
    per_minute: u32,
    windows: Mutex<HashMap<IpAddr, (Instant, u32)>>,
}

impl RateLimiter {
    fn new(per_minute: u32) -> Self {
        Self {
            per_minute,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn check(&self, caller: IpAddr) -> Result<(), CertificationError> {
        if self.per_minute == 0 {
            return Ok(());
        }
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| CertificationError::Transport("rate limiter poisoned".into()))?;
        let now = Instant::now();
        windows.retain(|_, (start, _)| now.duration_since(*start) < RATE_WINDOW);

        let (_, count) = windows.entry(caller).or_insert((now, 0));
        if *count >= self.per_minute {
            return Err(CertificationError::RateLimited);
        }
        *count += 1;
        Ok(())
    }
}

/// Node-side certification service.
#[derive(Debug)]
pub struct CertificationService {
    keys: KeyHierarchyManager,
    node_uuid: String,
    limiter: RateLimiter,
}

impl CertificationService {
    pub fn new(keys: KeyHierarchyManager, node_uuid: impl Into<String>, rate_limit: u32) -> Self {
        Self {
            keys,
            node_uuid: node_uuid.into(),
            limiter: RateLimiter::new(rate_limit),
        }
    }

    pub fn node_uuid(&self) -> &str {
        &self.node_uuid
    }

    pub async fn certify(
        &self,
        caller: IpAddr,
        app_key_public: &[u8],
        nonce: &str,
    ) -> Result<DelegatedCertificate, CertificationError> {
        if !caller.is_loopback() {
            return Err(CertificationError::NotLocal(caller.to_string()));
        }
        self.limiter.check(caller)?;
        if app_key_public.is_empty() {
            return Err(CertificationError::BadRequest("app_key_public is empty".into()));
        }
        if nonce.is_empty() {
            return Err(CertificationError::BadRequest("challenge_nonce is empty".into()));
        }

        let cert = self.keys.certify(app_key_public, nonce).await?;
        let certificate = cert.to_bytes().map_err(|e| {
            CertificationError::Device(TpmError::MalformedResponse(e.to_string()))
        })?;
        info!(
            node_uuid = %self.node_uuid,
            ak_serial = cert.ak_certificate.serial,
            "App Key certified"
        );
        Ok(DelegatedCertificate {
            certificate,
            node_uuid: self.node_uuid.clone(),
        })
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(
                CERTIFY_PATH,
                post(certify_app_key).fallback(unsupported_request),
            )
            .fallback(unsupported_request)
            .with_state(self)
    }
}

fn status_for(err: &CertificationError) -> StatusCode {
    match err {
        CertificationError::NotLocal(_) => StatusCode::FORBIDDEN,
        CertificationError::BadRequest(_) => StatusCode::BAD_REQUEST,
        CertificationError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        CertificationError::AkNotReady => StatusCode::SERVICE_UNAVAILABLE,
        CertificationError::Device(_) | CertificationError::Transport(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn certify_app_key(
    State(service): State<Arc<CertificationService>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Result<Json<CertifyRequest>, JsonRejection>,
) -> (StatusCode, Json<CertifyResponse>) {
    match handle_certify(&service, peer.ip(), body).await {
        Ok(cert) => (StatusCode::OK, Json(CertifyResponse::success(&cert))),
        Err(err) => {
            let status = status_for(&err);
            warn!(peer = %peer, status = status.as_u16(), error = %err, "certification refused");
            (status, Json(CertifyResponse::error(err.to_string())))
        }
    }
}

async fn handle_certify(
    service: &CertificationService,
    peer: IpAddr,
    body: Result<Json<CertifyRequest>, JsonRejection>,
) -> Result<DelegatedCertificate, CertificationError> {
    // Locality is checked before the body is looked at.
    if !peer.is_loopback() {
        return Err(CertificationError::NotLocal(peer.to_string()));
    }
    let Json(request) = body.map_err(|e| CertificationError::BadRequest(e.body_text()))?;

    if let Some(version) = &request.api_version {
        if version != API_VERSION {
            return Err(CertificationError::BadRequest(format!(
                "unsupported api_version {version}"
            )));
        }
    }
    let app_key_hex = request
        .app_key_public
        .ok_or_else(|| CertificationError::BadRequest("missing app_key_public".into()))?;
    let nonce = request
        .challenge_nonce
        .ok_or_else(|| CertificationError::BadRequest("missing challenge_nonce".into()))?;
    let app_key_public = hex::decode(app_key_hex)
        .map_err(|e| CertificationError::BadRequest(format!("app_key_public: {e}")))?;

    debug!(peer = %peer, "certify_app_key request");
    service.certify(peer, &app_key_public, &nonce).await
}

async fn unsupported_request(method: Method) -> Response {
    if method == Method::POST {
        let message = format!("URI not supported, only {CERTIFY_PATH} is supported for POST");
        warn!("{}", message);
        (StatusCode::BAD_REQUEST, Json(CertifyResponse::error(message))).into_response()
    } else {
        let message = format!("method {method} is not supported by the certification interface");
        warn!("{}", message);
        (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, "POST")],
            Json(CertifyResponse::error(message)),
        )
            .into_response()
    }
}

/// Bind the certification listener. Only loopback addresses are accepted.
pub async fn bind(addr: &str) -> IdentityResult<TcpListener> {
    let parsed: SocketAddr = addr
        .parse()
        .map_err(|e| IdentityError::Config(format!("listen_addr {addr}: {e}")))?;
    if !parsed.ip().is_loopback() {
        return Err(IdentityError::Config(format!(
            "listen_addr {addr} is not a loopback address"
        )));
    }
    Ok(TcpListener::bind(parsed).await?)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    service: Arc<CertificationService>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> IdentityResult<()> {
    let local = listener.local_addr()?;
    info!(addr = %local, "STATUS: CertificationService :: listening :: ACTIVE");
    let app = service.router();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    info!("certification service stopped");
    Ok(())
}

/// Calls the node-local service over HTTP.
#[derive(Debug, Clone)]
pub struct HttpCertificationClient {
    client: reqwest::Client,
    url: String,
}

impl HttpCertificationClient {
    pub fn new(base_url: &str, timeout: Duration) -> IdentityResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IdentityError::Config(format!("certification client: {e}")))?;
        Ok(Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), CERTIFY_PATH),
        })
    }
}

#[async_trait]
impl CertificationClient for HttpCertificationClient {
    async fn certify(
        &self,
        app_key_public: &[u8],
        nonce: &str,
    ) -> Result<DelegatedCertificate, CertificationError> {
        let request = CertifyRequest {
            api_version: Some(API_VERSION.to_string()),
            app_key_public: Some(hex::encode(app_key_public)),
            challenge_nonce: Some(nonce.to_string()),
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| CertificationError::Transport(e.to_string()))?;
        let status = resp.status();
        let body: CertifyResponse = resp
            .json()
            .await
            .map_err(|e| CertificationError::Transport(format!("response body: {e}")))?;
        let detail = body.error.clone().unwrap_or_default();

        match status {
            reqwest::StatusCode::OK => {}
            reqwest::StatusCode::SERVICE_UNAVAILABLE => return Err(CertificationError::AkNotReady),
            reqwest::StatusCode::FORBIDDEN => return Err(CertificationError::NotLocal(detail)),
            reqwest::StatusCode::TOO_MANY_REQUESTS => return Err(CertificationError::RateLimited),
            reqwest::StatusCode::BAD_REQUEST => return Err(CertificationError::BadRequest(detail)),
            other => {
                return Err(CertificationError::Transport(format!("{other}: {detail}")))
            }
        }

        let certificate = body
            .app_key_certificate
            .ok_or_else(|| CertificationError::Transport("response missing certificate".into()))
            .and_then(|encoded| {
                hex::decode(encoded)
                    .map_err(|e| CertificationError::Transport(format!("certificate hex: {e}")))
            })?;
        Ok(DelegatedCertificate {
            certificate,
            node_uuid: body.agent_uuid.unwrap_or_default(),
        })
    }
}

/// In-process client for a builder running inside the node daemon.
#[derive(Debug, Clone)]
pub struct LocalCertificationClient {
    service: Arc<CertificationService>,
}

impl LocalCertificationClient {
    pub fn new(service: Arc<CertificationService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl CertificationClient for LocalCertificationClient {
    async fn certify(
        &self,
        app_key_public: &[u8],
        nonce: &str,
    ) -> Result<DelegatedCertificate, CertificationError> {
        self.service
            .certify(IpAddr::V4(Ipv4Addr::LOCALHOST), app_key_public, nonce)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SoftwareTpm;
    use crate::tpm::CallPolicy;

    fn service(rate_limit: u32) -> CertificationService {
        let keys =
            KeyHierarchyManager::spawn(Box::new(SoftwareTpm::new()), CallPolicy::default()).unwrap();
        CertificationService::new(keys, "node-1", rate_limit)
    }

    #[tokio::test]
    async fn test_remote_caller_rejected() {
        let service = service(0);
        let caller: IpAddr = "10.0.0.5".parse().unwrap();
        let err = service.certify(caller, &[1, 2, 3], "n1").await.unwrap_err();
        assert!(matches!(err, CertificationError::NotLocal(_)));
        assert_eq!(status_for(&err), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unenrolled_node_reports_ak_not_ready() {
        let service = service(0);
        let handle = service.keys.ensure_app_key().await.unwrap();
        let err = service
            .certify(IpAddr::V4(Ipv4Addr::LOCALHOST), &handle.public, "n1")
            .await
            .unwrap_err();
        assert_eq!(err, CertificationError::AkNotReady);
        assert_eq!(status_for(&err), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_rate_limit_per_caller() {
        let service = service(2);
        let local = IpAddr::V4(Ipv4Addr::LOCALHOST);
        for _ in 0..2 {
            let err = service.certify(local, &[], "n1").await.unwrap_err();
            assert!(matches!(err, CertificationError::BadRequest(_)));
        }
        let err = service.certify(local, &[], "n1").await.unwrap_err();
        assert_eq!(err, CertificationError::RateLimited);

        let other: IpAddr = "::1".parse().unwrap();
        assert!(matches!(
            service.certify(other, &[], "n1").await,
            Err(CertificationError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_router_refuses_remote_peer_before_parsing() {
        use axum::body::Body;
        use axum::extract::connect_info::MockConnectInfo;
        use axum::http::Request;
        use tower::ServiceExt;

        let remote: SocketAddr = "192.168.1.20:40000".parse().unwrap();
        let app = Arc::new(service(0))
            .router()
            .layer(MockConnectInfo(remote));
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(CERTIFY_PATH)
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_bind_refuses_non_loopback() {
        assert!(matches!(
            bind("0.0.0.0:0").await,
            Err(IdentityError::Config(_))
        ));
        let listener = bind("127.0.0.1:0").await.unwrap();
        assert!(listener.local_addr().unwrap().ip().is_loopback());
    }
}
