//! HTTP surface of the realtime server.
//!
//! Two routes:
//!
//! - `GET /ws` - WebSocket handshake. Authenticates the optional `token`
//!   query parameter *before* upgrading; a rejected credential means the
//!   connection is never established.
//! - `GET /health` - liveness and basic counters. No authentication.
//!
//! All routes share [`AppState`], which carries the configuration and the
//! wired realtime components.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::ws::rejection::WebSocketUpgradeRejection,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::auth::{authenticate, AuthError};
use crate::config::Config;
use crate::connection;
use crate::data_service::CredentialVerifier;
use crate::registry::RoomRegistry;
use crate::router::EventRouter;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Event router driving every connection.
    pub router: Arc<EventRouter>,

    /// Credential verifier used at handshake.
    pub verifier: Arc<dyn CredentialVerifier>,

    /// Room membership registry (for health counters).
    pub registry: Arc<RoomRegistry>,

    /// Number of currently open WebSocket connections.
    pub active_connections: Arc<AtomicUsize>,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state over wired components.
    #[must_use]
    pub fn new(
        config: Config,
        router: Arc<EventRouter>,
        verifier: Arc<dyn CredentialVerifier>,
        registry: Arc<RoomRegistry>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            router,
            verifier,
            registry,
            active_connections: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field(
                "active_connections",
                &self.active_connections.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    let cors = match state.config.frontend_origin.parse::<HeaderValue>() {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_credentials(true),
        Err(_) => {
            warn!(
                origin = %state.config.frontend_origin,
                "Invalid frontend origin, disabling CORS allowance"
            );
            CorsLayer::new()
        }
    };

    Router::new()
        .route("/ws", get(get_ws))
        .route("/health", get(get_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Error Response Types
// ============================================================================

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

// ============================================================================
// GET /ws - WebSocket handshake
// ============================================================================

/// Query parameters for the WebSocket handshake.
#[derive(Debug, Deserialize)]
pub struct WsQueryParams {
    /// Optional agent API key. Absent means anonymous observer.
    pub token: Option<String>,
}

/// GET /ws - authenticate, then upgrade.
///
/// # Responses
///
/// - `101 Switching Protocols` - upgrade successful
/// - `400 Bad Request` - not a WebSocket upgrade request
/// - `401 Unauthorized` - malformed token, unknown or inactive agent
/// - `503 Service Unavailable` - credential verifier unreachable
async fn get_ws(
    State(state): State<AppState>,
    Query(params): Query<WsQueryParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match authenticate(params.token.as_deref(), state.verifier.as_ref()).await {
        Ok(identity) => identity,
        Err(err) => {
            let (status, message, code) = match &err {
                AuthError::InvalidTokenFormat => {
                    (StatusCode::UNAUTHORIZED, "invalid token format", "invalid_token")
                }
                AuthError::UnknownCredential => {
                    (StatusCode::UNAUTHORIZED, "unauthorized", "unknown_credential")
                }
                AuthError::InactiveAgent => {
                    (StatusCode::UNAUTHORIZED, "agent is inactive", "inactive_agent")
                }
                AuthError::ServiceUnavailable(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "credential verifier unavailable",
                    "service_unavailable",
                ),
            };
            if err.is_unavailable() {
                warn!(error = %err, "Handshake failed: verifier unavailable");
            } else {
                debug!(code, "Handshake rejected");
            }
            return (
                status,
                Json(ErrorResponse::new(message).with_code(code)),
            )
                .into_response();
        }
    };

    let Ok(ws) = ws else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("websocket upgrade required").with_code("upgrade_required")),
        )
            .into_response();
    };

    info!(role = ?identity.role, agent_id = ?identity.agent_id(), "WebSocket client connecting");

    let router = Arc::clone(&state.router);
    let gauge = Arc::clone(&state.active_connections);
    ws.on_upgrade(move |socket| connection::run(socket, identity, router, gauge))
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for the health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of open WebSocket connections on this instance.
    pub connections: usize,

    /// Number of rooms with local members.
    pub rooms: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - liveness and counters. No authentication required.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.active_connections.load(Ordering::Relaxed),
        rooms: state.registry.room_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::data_service::{DataServiceError, RoomDirectory};
    use crate::fanout::RoomBroadcaster;
    use crate::router::RouterConfig;
    use crate::store::{CoordinationStore, MemoryStore};
    use crate::types::{AgentRecord, RoomRecord};

    struct FakeVerifier {
        agents: HashMap<String, AgentRecord>,
    }

    #[async_trait]
    impl CredentialVerifier for FakeVerifier {
        async fn agent_by_api_key(
            &self,
            api_key: &str,
        ) -> Result<Option<AgentRecord>, DataServiceError> {
            Ok(self.agents.get(api_key).cloned())
        }
    }

    struct EmptyDirectory;

    #[async_trait]
    impl RoomDirectory for EmptyDirectory {
        async fn room_by_id(
            &self,
            _room_id: Uuid,
        ) -> Result<Option<RoomRecord>, DataServiceError> {
            Ok(None)
        }
    }

    fn test_config() -> Config {
        Config {
            data_service_url: "http://data:4000".to_string(),
            data_service_key: "svc-key".to_string(),
            redis_url: None,
            frontend_origin: "http://localhost:5173".to_string(),
            turn_window: Duration::from_secs(10),
            vote_ttl: Duration::from_secs(86_400),
            port: 8080,
        }
    }

    fn test_state(agents: HashMap<String, AgentRecord>) -> AppState {
        let registry = Arc::new(RoomRegistry::new());
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let broadcaster = Arc::new(RoomBroadcaster::new(
            Arc::clone(&registry),
            Arc::clone(&store),
        ));
        let router = Arc::new(EventRouter::new(
            Arc::clone(&registry),
            broadcaster,
            store,
            Arc::new(EmptyDirectory),
            RouterConfig::default(),
        ));

        AppState::new(
            test_config(),
            router,
            Arc::new(FakeVerifier { agents }),
            registry,
        )
    }

    fn valid_key() -> String {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;
        format!("moltarena_sk_{}", URL_SAFE_NO_PAD.encode([9u8; 32]))
    }

    // ========================================================================
    // Health endpoint tests
    // ========================================================================

    #[tokio::test]
    async fn health_returns_ok_status() {
        let app = create_router(test_state(HashMap::new()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();

        assert_eq!(health.status, "ok");
        assert_eq!(health.connections, 0);
        assert_eq!(health.rooms, 0);
    }

    #[tokio::test]
    async fn health_serializes_camel_case() {
        let app = create_router(test_state(HashMap::new()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(raw.get("uptimeSeconds").is_some());
    }

    // ========================================================================
    // Handshake authentication tests
    // ========================================================================

    #[tokio::test]
    async fn malformed_token_is_rejected_before_upgrade() {
        let app = create_router(test_state(HashMap::new()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ws?token=garbage")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(error["code"], "invalid_token");
    }

    #[tokio::test]
    async fn unknown_credential_is_rejected() {
        let app = create_router(test_state(HashMap::new()));
        let key = valid_key();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/ws?token={key}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(error["code"], "unknown_credential");
    }

    #[tokio::test]
    async fn inactive_agent_is_rejected() {
        let key = valid_key();
        let mut agents = HashMap::new();
        agents.insert(
            key.clone(),
            AgentRecord {
                id: Uuid::new_v4(),
                display_name: "dormant".to_string(),
                is_active: false,
            },
        );
        let app = create_router(test_state(agents));

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/ws?token={key}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(error["code"], "inactive_agent");
    }

    #[tokio::test]
    async fn anonymous_request_passes_auth_but_needs_upgrade() {
        // No token: authentication succeeds (observer), and the request
        // fails only because it is not a WebSocket upgrade.
        let app = create_router(test_state(HashMap::new()));

        let response = app
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(error["code"], "upgrade_required");
    }

    // ========================================================================
    // AppState tests
    // ========================================================================

    #[test]
    fn app_state_debug_impl_hides_config() {
        let state = test_state(HashMap::new());
        let debug_str = format!("{state:?}");
        assert!(debug_str.contains("AppState"));
        assert!(!debug_str.contains("svc-key"));
    }
}
