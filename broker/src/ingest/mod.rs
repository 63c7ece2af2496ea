//! HTTP ingest server
//!
//! Accepts CloudEvents over HTTP (binary and structured binding modes) at
//! `POST /` and hands them to the registered producer, which is the backend's
//! `produce` bound by the orchestrator. Also exposes the health endpoints
//! and the Prometheus scrape target.
//!
//! Responses: 204 when the backend took the event, 502 when it refused
//! (NACK), 400 for requests that do not carry a valid CloudEvent, 401 when
//! ingest credentials are configured and missing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use virta_core::Event;

use crate::config::{BrokerConfig, ConfigCallback, IngestConfig};
use crate::error::Result;
use crate::http_binding;
use crate::metrics::Metrics;
use crate::status::{IngestState, IngestStatus, StatusManager};

/// Bound on draining in-flight requests at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives each ingested CloudEvent; an error maps to a NACK response.
pub type CloudEventHandler =
    Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Overall liveness check backing the health endpoints.
pub type ProbeHandler =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

struct Shared {
    handler: RwLock<Option<CloudEventHandler>>,
    probe: RwLock<Option<ProbeHandler>>,
    credentials: RwLock<Option<IngestConfig>>,
    status: StatusManager,
}

pub struct IngestServer {
    port: u16,
    shared: Arc<Shared>,
}

impl IngestServer {
    pub fn new(port: u16, status: StatusManager) -> Self {
        Self {
            port,
            shared: Arc::new(Shared {
                handler: RwLock::new(None),
                probe: RwLock::new(None),
                credentials: RwLock::new(None),
                status,
            }),
        }
    }

    /// Register the producer for received events.
    pub fn register_cloudevent_handler(&self, handler: CloudEventHandler) {
        *self.shared.handler.write() = Some(handler);
    }

    /// Register the probe backing `/healthz`.
    pub fn register_probe_handler(&self, probe: ProbeHandler) {
        *self.shared.probe.write() = Some(probe);
    }

    /// Pick up ingest credentials from a configuration snapshot.
    pub fn update_from_config(&self, config: &BrokerConfig) {
        let credentials = config
            .ingest
            .clone()
            .filter(|ingest| !ingest.user.is_empty());
        let enabled = credentials.is_some();
        *self.shared.credentials.write() = credentials;
        debug!(auth = enabled, "ingest configuration updated");
    }

    /// Adapter for the config sources.
    pub fn config_callback(self: &Arc<Self>) -> ConfigCallback {
        let server = self.clone();
        Arc::new(move |config: &BrokerConfig| server.update_from_config(config))
    }

    /// Serve until the token is cancelled, then drain in-flight requests
    /// bounded by [`SHUTDOWN_TIMEOUT`].
    pub async fn start(&self, ctx: CancellationToken) -> Result<()> {
        if let Err(e) = Metrics::init() {
            warn!(error = %e, "metrics registration failed");
        }

        let app = Router::new()
            .route("/", post(ingest_handler))
            .route("/healthz", get(health_handler))
            .route("/_ah/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.shared.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(port = self.port, "ingest server listening");

        self.shared
            .status
            .update_ingest_status(IngestStatus::new(IngestState::Running));

        let graceful = axum::serve(listener, app)
            .with_graceful_shutdown(ctx.clone().cancelled_owned());
        let server = tokio::spawn(async move { graceful.await });

        ctx.cancelled().await;
        info!("exiting ingest server");
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, server).await {
            Ok(joined) => {
                if let Ok(Err(e)) = joined {
                    error!(error = %e, "ingest server error");
                }
            }
            Err(_) => warn!(timeout_s = SHUTDOWN_TIMEOUT.as_secs(),
                "ingest server drain timed out"),
        }

        self.shared
            .status
            .update_ingest_status(IngestStatus::new(IngestState::Closed));
        Ok(())
    }
}

async fn ingest_handler(
    State(shared): State<Arc<Shared>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(response) = check_authorization(&shared, &headers) {
        return response;
    }

    let event = match http_binding::event_from_http(&headers, &body) {
        Ok(event) => event,
        Err(e) => {
            if let Some(metrics) = Metrics::get() {
                metrics.ingest_malformed.inc();
            }
            debug!(error = %e, "rejecting request without a valid CloudEvent");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let Some(handler) = shared.handler.read().clone() else {
        error!("CloudEvent lost due to no handler configured");
        return StatusCode::BAD_GATEWAY.into_response();
    };

    debug!(id = %event.id, source = %event.source, ty = %event.ty, "received CloudEvent");
    match handler(event).await {
        Ok(()) => {
            if let Some(metrics) = Metrics::get() {
                metrics.ingest_received.inc();
            }
            let mut status = IngestStatus::new(IngestState::Running);
            status.last_ingested = Some(chrono::Utc::now());
            shared.status.update_ingest_status(status);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            if let Some(metrics) = Metrics::get() {
                metrics.ingest_nacked.inc();
            }
            error!(error = %e, "could not produce CloudEvent to broker");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

/// Enforce HTTP Basic credentials when the configuration carries them.
fn check_authorization(shared: &Shared, headers: &HeaderMap) -> Option<Response> {
    let credentials = shared.credentials.read().clone()?;

    let expected = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", credentials.user, credentials.password));
    let authorized = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .map(|value| value == expected)
        .unwrap_or(false);

    if authorized {
        None
    } else {
        Some(
            (
                StatusCode::UNAUTHORIZED,
                [(http::header::WWW_AUTHENTICATE, "Basic realm=\"ingest\"")],
            )
                .into_response(),
        )
    }
}

async fn health_handler(State(shared): State<Arc<Shared>>) -> Response {
    let probe = shared.probe.read().clone();
    let result = match probe {
        Some(probe) => probe().await,
        None => Ok(()),
    };

    match result {
        Ok(()) => Json(serde_json::json!({"ok": "true"})).into_response(),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"ok": "false", "error": error})),
        )
            .into_response(),
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        crate::metrics::gather(),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::status::StatusManagerConfig;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn server(port: u16) -> Arc<IngestServer> {
        Arc::new(IngestServer::new(
            port,
            StatusManager::new(StatusManagerConfig::default()),
        ))
    }

    fn counting_handler() -> (CloudEventHandler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        let handler: CloudEventHandler = Arc::new(move |_event| {
            let inner = inner.clone();
            async move {
                inner.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        });
        (handler, count)
    }

    async fn start_on_free_port(server: Arc<IngestServer>, ctx: CancellationToken) -> u16 {
        // Bind to discover a free port, then hand it to the server.
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let started = Arc::new(IngestServer {
            port,
            shared: server.shared.clone(),
        });
        tokio::spawn(async move { started.start(ctx).await });

        // Wait until the port answers.
        for _ in 0..100 {
            if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        port
    }

    #[tokio::test]
    async fn accepts_structured_event_and_acks() {
        let server = server(0);
        let (handler, count) = counting_handler();
        server.register_cloudevent_handler(handler);

        let ctx = CancellationToken::new();
        let port = start_on_free_port(server, ctx.clone()).await;

        let body = Event::new("e1", "/test", "test.type").to_json().unwrap();
        let response = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/"))
            .header("content-type", http_binding::STRUCTURED_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        ctx.cancel();
    }

    #[tokio::test]
    async fn malformed_request_is_a_bad_request() {
        let server = server(0);
        let (handler, count) = counting_handler();
        server.register_cloudevent_handler(handler);

        let ctx = CancellationToken::new();
        let port = start_on_free_port(server, ctx.clone()).await;

        let response = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/"))
            .body("not a cloudevent")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        ctx.cancel();
    }

    #[tokio::test]
    async fn producer_error_maps_to_nack() {
        let server = server(0);
        let handler: CloudEventHandler = Arc::new(|_event| {
            async { Err(crate::error::BrokerError::Closing) }.boxed()
        });
        server.register_cloudevent_handler(handler);

        let ctx = CancellationToken::new();
        let port = start_on_free_port(server, ctx.clone()).await;

        let body = Event::new("e1", "/test", "test.type").to_json().unwrap();
        let response = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/"))
            .header("content-type", http_binding::STRUCTURED_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
        ctx.cancel();
    }

    #[tokio::test]
    async fn health_endpoints_reflect_the_probe() {
        let server = server(0);
        server.register_probe_handler(Arc::new(|| async { Ok(()) }.boxed()));

        let ctx = CancellationToken::new();
        let port = start_on_free_port(server.clone(), ctx.clone()).await;

        for path in ["healthz", "_ah/health"] {
            let response = reqwest::get(format!("http://127.0.0.1:{port}/{path}"))
                .await
                .unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::OK);
            assert_eq!(response.text().await.unwrap(), r#"{"ok":"true"}"#);
        }

        server.register_probe_handler(Arc::new(|| {
            async { Err("backend down".to_string()) }.boxed()
        }));
        let response = reqwest::get(format!("http://127.0.0.1:{port}/healthz"))
            .await
            .unwrap();
        assert_eq!(
            response.status(),
            reqwest::StatusCode::INTERNAL_SERVER_ERROR
        );
        assert!(response.text().await.unwrap().contains("backend down"));
        ctx.cancel();
    }

    #[tokio::test]
    async fn configured_credentials_are_enforced() {
        let server = server(0);
        let (handler, _) = counting_handler();
        server.register_cloudevent_handler(handler);
        server.update_from_config(&crate::config::parse(
            "ingest:\n  user: admin\n  password: secret\ntriggers: {}\n",
        ).unwrap());

        let ctx = CancellationToken::new();
        let port = start_on_free_port(server, ctx.clone()).await;

        let body = Event::new("e1", "/test", "test.type").to_json().unwrap();
        let url = format!("http://127.0.0.1:{port}/");
        let client = reqwest::Client::new();

        let denied = client
            .post(&url)
            .header("content-type", http_binding::STRUCTURED_CONTENT_TYPE)
            .body(body.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);

        let allowed = client
            .post(&url)
            .basic_auth("admin", Some("secret"))
            .header("content-type", http_binding::STRUCTURED_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(allowed.status(), reqwest::StatusCode::NO_CONTENT);
        ctx.cancel();
    }
}
