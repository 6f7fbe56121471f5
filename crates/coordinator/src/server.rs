//! Coordinator facade: HTTP API and the WebSocket event channel.
//!
//! Thin request router translating transport events into Trust Manager and
//! Aggregator calls, fanning verification events out through the fabric, and
//! mapping component errors onto the fixed wire error codes.

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use threatnet_core::{
    ClientProfile, Ioc, IocFilter, IocId, IocPayload, IocStatus, IocType, ThreatLevel, TrustEvent,
    TrustScore,
};
use threatnet_engine::ConsensusPolicy;

use crate::aggregator::{ExpireError, IntelAggregator, SubmitError};
use crate::config::Config;
use crate::fabric::{Fabric, InboundEvent, OutboundEvent, Session};
use crate::now_ts;
use crate::outcome;
use crate::storage::Storage;
use crate::tasks;
use crate::trust::TrustManager;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    /// Loaded configuration.
    pub config: Arc<Config>,
    /// Storage handle.
    pub storage: Storage,
    /// Trust Manager.
    pub trust: Arc<TrustManager>,
    /// Intelligence Aggregator.
    pub aggregator: Arc<IntelAggregator>,
    /// Distribution fabric.
    pub fabric: Arc<Fabric>,
}

/// Build the full component stack from configuration.
///
/// Connects to the store, runs migrations, wires the aggregator→trust
/// outcome queue, and spawns its consumer task.
pub async fn build_state(config: Config) -> Result<AppState> {
    let storage = Storage::new(
        &config.database.url,
        Some(config.database.max_connections),
        Some(config.database.min_connections),
    )
    .await?;
    storage.run_migrations().await?;

    let trust = Arc::new(TrustManager::new(storage.clone(), config.trust.clone()));

    let (outcome_tx, outcome_rx) = outcome::channel();
    outcome::spawn_consumer(trust.clone(), outcome_rx);

    let policy = ConsensusPolicy::new(
        config.consensus.threshold,
        config.consensus.trust_avg,
        config.consensus.critical_trust_bypass,
    )
    .map_err(|e| anyhow::anyhow!(e))
    .context("Invalid consensus configuration")?;

    let aggregator = Arc::new(IntelAggregator::new(
        storage.clone(),
        trust.clone(),
        policy,
        config.intel.clone(),
        outcome_tx,
    ));

    let fabric = Arc::new(Fabric::new(config.fabric.outbound_queue_size as usize));

    Ok(AppState {
        config: Arc::new(config),
        storage,
        trust,
        aggregator,
        fabric,
    })
}

/// Build the router for the given state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/clients", get(get_clients))
        .route("/iocs", get(list_iocs))
        .route("/iocs/{id}", get(get_ioc))
        .route("/iocs/{id}/expire", post(post_expire))
        .route("/report_threat", post(post_report))
        .route("/sync_intel", get(get_sync_intel))
        .route("/trust_scores", get(list_trust_scores))
        .route("/trust_scores/{client_id}", get(get_trust_score))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the coordinator with the given configuration until shutdown.
pub async fn run_with_config(config: Config) -> Result<()> {
    let state = build_state(config).await?;
    let background = tasks::spawn_periodic_tasks(&state);

    let addr: SocketAddr = format!("{}:{}", state.config.server.host, state.config.server.port)
        .parse()
        .context("Invalid listen address")?;

    let storage = state.storage.clone();
    let app = router(state);

    info!("ThreatNet coordinator listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for task in background {
        task.abort();
    }
    storage.close().await;
    info!("ThreatNet coordinator shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", err);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {}", err);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

// ── Wire error codes ────────────────────────────────────────────────────────

const ERROR_CODE_BAD_REQUEST: &str = "bad_request";
const ERROR_CODE_NOT_FOUND: &str = "not_found";
const ERROR_CODE_TIMEOUT: &str = "timeout";
const ERROR_CODE_CONFLICT: &str = "conflict";
const ERROR_CODE_INTERNAL: &str = "internal";

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorInfo,
}

#[derive(Serialize)]
struct ErrorInfo {
    code: &'static str,
    message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorInfo {
                code,
                message: message.into(),
            },
        }),
    )
}

fn bad_request(msg: impl Into<String>) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, ERROR_CODE_BAD_REQUEST, msg)
}

fn not_found(msg: impl Into<String>) -> ApiError {
    api_error(StatusCode::NOT_FOUND, ERROR_CODE_NOT_FOUND, msg)
}

fn timeout_error() -> ApiError {
    api_error(
        StatusCode::GATEWAY_TIMEOUT,
        ERROR_CODE_TIMEOUT,
        "Handler deadline exceeded; retry the request",
    )
}

fn conflict(msg: impl Into<String>) -> ApiError {
    api_error(StatusCode::CONFLICT, ERROR_CODE_CONFLICT, msg)
}

fn internal_error<E: std::fmt::Display>(err: E) -> ApiError {
    api_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        ERROR_CODE_INTERNAL,
        format!("Internal error: {}", err),
    )
}

// ── HTTP handlers ───────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    state.storage.health_check().await.map_err(internal_error)?;
    Ok(Json(HealthResponse { ok: true }))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    total_clients: u64,
    online_clients: u64,
    total_iocs: u64,
    verified_iocs: u64,
    pending_iocs: u64,
    expired_iocs: u64,
    average_trust: f64,
}

async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let stats = state.storage.stats().await.map_err(internal_error)?;

    Ok(Json(StatusResponse {
        total_clients: stats.total_clients,
        online_clients: state.fabric.online_count() as u64,
        total_iocs: stats.total_iocs,
        verified_iocs: stats.verified_iocs,
        pending_iocs: stats.pending_iocs,
        expired_iocs: stats.expired_iocs,
        average_trust: stats.average_trust,
    }))
}

#[derive(Debug, Serialize)]
struct ClientView {
    client_id: String,
    hostname: String,
    version: String,
    online: bool,
    trust: f64,
    reports_total: u64,
    reports_accepted: u64,
    reports_rejected: u64,
    last_heartbeat_at: Option<i64>,
}

async fn get_clients(State(state): State<AppState>) -> Result<Json<Vec<ClientView>>, ApiError> {
    let scores = state.trust.snapshot().await.map_err(internal_error)?;
    let profiles: std::collections::HashMap<String, (ClientProfile, bool)> = state
        .fabric
        .profiles()
        .into_iter()
        .map(|(profile, online)| (profile.client_id.clone(), (profile, online)))
        .collect();

    let clients = scores
        .into_iter()
        .map(|score| {
            let (hostname, version, online) = match profiles.get(&score.client_id) {
                Some((profile, online)) => {
                    (profile.hostname.clone(), profile.version.clone(), *online)
                }
                None => (String::new(), String::new(), false),
            };
            ClientView {
                client_id: score.client_id,
                hostname,
                version,
                online,
                trust: score.value,
                reports_total: score.reports_total,
                reports_accepted: score.reports_accepted,
                reports_rejected: score.reports_rejected,
                last_heartbeat_at: score.last_heartbeat_at,
            }
        })
        .collect();

    Ok(Json(clients))
}

#[derive(Debug, Deserialize)]
struct IocListQuery {
    status: Option<String>,
    #[serde(alias = "type")]
    ioc_type: Option<String>,
    threat_level: Option<String>,
    since: Option<i64>,
}

async fn list_iocs(
    State(state): State<AppState>,
    Query(query): Query<IocListQuery>,
) -> Result<Json<Vec<Ioc>>, ApiError> {
    let mut filter = IocFilter {
        since: query.since,
        ..Default::default()
    };

    if let Some(status) = query.status.as_deref() {
        filter.status = Some(
            status
                .parse::<IocStatus>()
                .map_err(|e| bad_request(e.to_string()))?,
        );
    }
    if let Some(ioc_type) = query.ioc_type.as_deref() {
        filter.ioc_type = Some(
            ioc_type
                .parse::<IocType>()
                .map_err(|e| bad_request(e.to_string()))?,
        );
    }
    if let Some(level) = query.threat_level.as_deref() {
        filter.threat_level = Some(
            level
                .parse::<ThreatLevel>()
                .map_err(|e| bad_request(e.to_string()))?,
        );
    }

    let iocs = state
        .aggregator
        .query(&filter)
        .await
        .map_err(internal_error)?;
    Ok(Json(iocs))
}

async fn get_ioc(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Ioc>, ApiError> {
    let ioc = state
        .aggregator
        .get(&IocId::new(id))
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Unknown IOC id"))?;
    Ok(Json(ioc))
}

async fn post_expire(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Ioc>, ApiError> {
    let ioc = state
        .aggregator
        .expire(&IocId::new(id), now_ts())
        .await
        .map_err(|e| match e {
            ExpireError::NotFound => not_found("Unknown IOC id"),
            ExpireError::AlreadyExpired => conflict("IOC is already expired"),
            ExpireError::Internal(err) => internal_error(err),
        })?;
    Ok(Json(ioc))
}

#[derive(Debug, Deserialize)]
struct ReportRequest {
    client_id: String,
    ioc: IocPayload,
}

#[derive(Debug, Serialize)]
struct ReportResponse {
    ioc_id: IocId,
    status: IocStatus,
    newly_verified: bool,
}

async fn post_report(
    State(state): State<AppState>,
    Json(request): Json<ReportRequest>,
) -> Result<Json<ReportResponse>, ApiError> {
    let deadline = state.config.fabric.handler_timeout();
    let result = tokio::time::timeout(
        deadline,
        state.aggregator.submit(&request.client_id, &request.ioc),
    )
    .await
    .map_err(|_| timeout_error())?
    .map_err(|e| match e {
        SubmitError::Invalid(err) => bad_request(err.to_string()),
        SubmitError::Internal(err) => internal_error(err),
    })?;

    if result.newly_verified {
        broadcast_verified(&state, &result.ioc_id).await;
    }

    Ok(Json(ReportResponse {
        ioc_id: result.ioc_id,
        status: result.status,
        newly_verified: result.newly_verified,
    }))
}

#[derive(Debug, Deserialize)]
struct SyncIntelQuery {
    client_id: String,
    #[serde(default)]
    cursor: i64,
}

#[derive(Debug, Serialize)]
struct SyncIntelResponse {
    iocs: Vec<Ioc>,
    cursor: i64,
}

async fn get_sync_intel(
    State(state): State<AppState>,
    Query(query): Query<SyncIntelQuery>,
) -> Result<Json<SyncIntelResponse>, ApiError> {
    if query.client_id.trim().is_empty() {
        return Err(bad_request("client_id is required"));
    }

    let (iocs, cursor) = state
        .aggregator
        .pull_since(query.cursor)
        .await
        .map_err(internal_error)?;
    state.fabric.set_cursor(&query.client_id, cursor);

    Ok(Json(SyncIntelResponse { iocs, cursor }))
}

async fn list_trust_scores(
    State(state): State<AppState>,
) -> Result<Json<Vec<TrustScore>>, ApiError> {
    let scores = state.trust.snapshot().await.map_err(internal_error)?;
    Ok(Json(scores))
}

#[derive(Debug, Serialize)]
struct TrustDetailResponse {
    score: TrustScore,
    history: Vec<TrustEvent>,
}

async fn get_trust_score(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<Json<TrustDetailResponse>, ApiError> {
    if client_id.trim().is_empty() {
        return Err(bad_request("client_id is required"));
    }

    let score = state
        .trust
        .get(&client_id)
        .await
        .map_err(internal_error)?;
    let history = state
        .trust
        .history(&client_id, 50)
        .await
        .map_err(internal_error)?;

    Ok(Json(TrustDetailResponse { score, history }))
}

/// Fetch a freshly verified IOC and fan it out to every subscriber.
async fn broadcast_verified(state: &AppState, ioc_id: &IocId) {
    match state.aggregator.get(ioc_id).await {
        Ok(Some(ioc)) => {
            info!(ioc_id = %ioc_id, "broadcasting verified IOC");
            state.fabric.broadcast(&OutboundEvent::IocVerified { ioc });
        }
        Ok(None) => warn!(ioc_id = %ioc_id, "verified IOC vanished before broadcast"),
        Err(e) => error!(ioc_id = %ioc_id, "failed to load verified IOC for broadcast: {:#}", e),
    }
}

// ── WebSocket event channel ─────────────────────────────────────────────────

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

enum Incoming {
    Frame(Option<Result<Message, axum::Error>>),
    Deliver(Option<OutboundEvent>),
}

async fn handle_socket(state: AppState, mut socket: WebSocket) {
    let mut session: Option<Arc<Session>> = None;

    loop {
        let incoming = match session {
            Some(ref live) => {
                tokio::select! {
                    msg = socket.recv() => Incoming::Frame(msg),
                    event = live.queue.pop() => Incoming::Deliver(event),
                }
            }
            None => Incoming::Frame(socket.recv().await),
        };

        match incoming {
            Incoming::Deliver(Some(event)) => {
                let frame = match serde_json::to_string(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("failed to encode outbound event: {}", e);
                        continue;
                    }
                };
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            // Queue closed: overflow, replacement, or forced disconnect.
            Incoming::Deliver(None) => break,
            Incoming::Frame(None) | Incoming::Frame(Some(Err(_))) => break,
            Incoming::Frame(Some(Ok(message))) => match message {
                Message::Text(text) => {
                    if !handle_frame(&state, &mut session, &mut socket, text.as_str()).await {
                        break;
                    }
                }
                Message::Close(_) => break,
                // Pings are answered by the transport; binary frames are not
                // part of the protocol.
                _ => {}
            },
        }
    }

    if let Some(session) = session {
        state.fabric.disconnect(&session);
        // A replaced session must not announce its successor as offline.
        if !state.fabric.is_online(&session.client_id) {
            let trust = state
                .trust
                .get(&session.client_id)
                .await
                .map(|score| score.value)
                .unwrap_or_default();
            state.fabric.broadcast(&OutboundEvent::ClientStatus {
                client_id: session.client_id.clone(),
                online: false,
                trust,
            });
            info!(client_id = %session.client_id, "client disconnected");
        }
    }
}

/// Handle one inbound frame. Returns false when the connection should close.
async fn handle_frame(
    state: &AppState,
    session: &mut Option<Arc<Session>>,
    socket: &mut WebSocket,
    text: &str,
) -> bool {
    let event: InboundEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            let nack = OutboundEvent::ReportNack {
                reason: format!("bad_request: {}", e),
            };
            return reply(session, socket, nack).await;
        }
    };

    match event {
        InboundEvent::Register {
            client_id,
            hostname,
            version,
        } => {
            if client_id.trim().is_empty() {
                let nack = OutboundEvent::ReportNack {
                    reason: "bad_request: client_id is required".to_string(),
                };
                return reply(session, socket, nack).await;
            }

            let now = now_ts();
            let trust = match state.trust.get_at(&client_id, now).await {
                Ok(score) => score.value,
                Err(e) => {
                    error!(client_id, "registration failed: {:#}", e);
                    return false;
                }
            };
            if let Err(e) = state.trust.register_heartbeat(&client_id, now).await {
                warn!(client_id, "heartbeat write failed on register: {:#}", e);
            }

            let new_session = state.fabric.register(ClientProfile {
                client_id: client_id.clone(),
                hostname,
                version,
            });
            info!(client_id, "client registered");

            new_session.queue.push(OutboundEvent::Registered {
                client_id: client_id.clone(),
                trust,
            });

            // Initial snapshot: resume from the stored cursor when known,
            // otherwise the most recent verified intel.
            let snapshot = match state.fabric.cursor(&client_id) {
                Some(cursor) => state.aggregator.pull_since(cursor).await,
                None => state.aggregator.recent_verified().await,
            };
            match snapshot {
                Ok((iocs, cursor)) => {
                    state.fabric.set_cursor(&client_id, cursor);
                    new_session
                        .queue
                        .push(OutboundEvent::SyncResponse { iocs, cursor });
                }
                Err(e) => error!(client_id, "initial snapshot failed: {:#}", e),
            }

            *session = Some(new_session);

            state.fabric.broadcast(&OutboundEvent::ClientStatus {
                client_id,
                online: true,
                trust,
            });
            true
        }

        InboundEvent::Heartbeat { client_id, at } => {
            let at = at.unwrap_or_else(now_ts);
            if let Err(e) = state.trust.register_heartbeat(&client_id, at).await {
                warn!(client_id, "heartbeat write failed: {:#}", e);
            }
            true
        }

        InboundEvent::ReportThreat { client_id, ioc } => {
            let deadline = state.config.fabric.handler_timeout();
            let submitted =
                tokio::time::timeout(deadline, state.aggregator.submit(&client_id, &ioc)).await;

            let response = match submitted {
                Err(_) => OutboundEvent::ReportNack {
                    reason: "timeout".to_string(),
                },
                Ok(Err(SubmitError::Invalid(e))) => OutboundEvent::ReportNack {
                    reason: format!("bad_request: {}", e),
                },
                Ok(Err(SubmitError::Internal(e))) => {
                    error!(client_id, "submit failed: {:#}", e);
                    OutboundEvent::ReportNack {
                        reason: "internal".to_string(),
                    }
                }
                Ok(Ok(result)) => {
                    // Fan the verification out before acknowledging the
                    // sender; per-session FIFO keeps that order on the wire.
                    if result.newly_verified {
                        broadcast_verified(state, &result.ioc_id).await;
                    }
                    OutboundEvent::ReportAck {
                        ioc_id: result.ioc_id,
                        status: result.status,
                    }
                }
            };
            reply(session, socket, response).await
        }

        InboundEvent::SyncRequest { client_id, cursor } => {
            match state.aggregator.pull_since(cursor).await {
                Ok((iocs, cursor)) => {
                    state.fabric.set_cursor(&client_id, cursor);
                    reply(session, socket, OutboundEvent::SyncResponse { iocs, cursor }).await
                }
                Err(e) => {
                    error!(client_id, "sync failed: {:#}", e);
                    let nack = OutboundEvent::ReportNack {
                        reason: "internal".to_string(),
                    };
                    reply(session, socket, nack).await
                }
            }
        }
    }
}

/// Deliver a reply to the sender: through the session queue once registered
/// (preserving FIFO with broadcasts), directly on the socket before that.
async fn reply(
    session: &Option<Arc<Session>>,
    socket: &mut WebSocket,
    event: OutboundEvent,
) -> bool {
    match session {
        Some(live) => {
            live.queue.push(event);
            !live.queue.is_closed()
        }
        None => {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("failed to encode reply: {}", e);
                    return true;
                }
            };
            socket.send(Message::Text(frame.into())).await.is_ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::NamedTempFile;
    use tower::ServiceExt;

    async fn setup_app() -> (AppState, Router, NamedTempFile) {
        let temp_db = NamedTempFile::new().unwrap();
        let mut config = Config::default();
        config.database.url = format!("sqlite://{}", temp_db.path().display());

        let state = build_state(config).await.unwrap();
        let app = router(state.clone());
        (state, app, temp_db)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn report_body(client_id: &str, ioc_type: &str, value: &str, level: &str) -> Body {
        Body::from(
            serde_json::json!({
                "client_id": client_id,
                "ioc": {
                    "ioc_type": ioc_type,
                    "value": value,
                    "threat_level": level,
                }
            })
            .to_string(),
        )
    }

    fn post(uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_state, app, _tmp) = setup_app().await;

        let response = app.oneshot(get_req("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["ok"], true);
    }

    #[tokio::test]
    async fn test_report_then_fetch() {
        let (_state, app, _tmp) = setup_app().await;

        let response = app
            .clone()
            .oneshot(post(
                "/report_threat",
                report_body("agent-1", "domain", "Bad.Example.COM", "high"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "pending");
        assert_eq!(json["newly_verified"], false);
        let ioc_id = json["ioc_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(get_req(&format!("/iocs/{}", ioc_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["value"], "bad.example.com");
        assert_eq!(json["report_count"], 1);
    }

    #[tokio::test]
    async fn test_unknown_ioc_404() {
        let (_state, app, _tmp) = setup_app().await;

        let response = app.oneshot(get_req("/iocs/no-such-id")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn test_malformed_report_is_bad_request() {
        let (_state, app, _tmp) = setup_app().await;

        let response = app
            .oneshot(post(
                "/report_threat",
                report_body("agent-1", "carrier_pigeon", "coo", "high"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_ioc_filter_validation() {
        let (_state, app, _tmp) = setup_app().await;

        let response = app
            .clone()
            .oneshot(get_req("/iocs?status=floating"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.oneshot(get_req("/iocs?status=pending")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_expire_conflict_on_repeat() {
        let (_state, app, _tmp) = setup_app().await;

        let response = app
            .clone()
            .oneshot(post(
                "/report_threat",
                report_body("agent-1", "ip_address", "10.0.0.1", "low"),
            ))
            .await
            .unwrap();
        let json = body_json(response).await;
        let ioc_id = json["ioc_id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(post(&format!("/iocs/{}/expire", ioc_id), Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(post(&format!("/iocs/{}/expire", ioc_id), Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "conflict");
    }

    #[tokio::test]
    async fn test_status_counts() {
        let (_state, app, _tmp) = setup_app().await;

        app.clone()
            .oneshot(post(
                "/report_threat",
                report_body("agent-1", "domain", "one.example.com", "low"),
            ))
            .await
            .unwrap();
        app.clone()
            .oneshot(post(
                "/report_threat",
                report_body("agent-2", "domain", "two.example.com", "low"),
            ))
            .await
            .unwrap();

        let response = app.oneshot(get_req("/status")).await.unwrap();
        let json = body_json(response).await;
        assert_eq!(json["total_iocs"], 2);
        assert_eq!(json["pending_iocs"], 2);
        assert_eq!(json["verified_iocs"], 0);
        assert_eq!(json["total_clients"], 2);
        assert_eq!(json["online_clients"], 0);
    }

    #[tokio::test]
    async fn test_sync_intel_requires_client_id() {
        let (_state, app, _tmp) = setup_app().await;

        let response = app
            .clone()
            .oneshot(get_req("/sync_intel?client_id=&cursor=0"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(get_req("/sync_intel?client_id=agent-1&cursor=0"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["iocs"].as_array().unwrap().len(), 0);
        assert_eq!(json["cursor"], 0);
    }

    #[tokio::test]
    async fn test_trust_score_detail_creates_unknown_client() {
        let (_state, app, _tmp) = setup_app().await;

        let response = app
            .oneshot(get_req("/trust_scores/new-agent"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["score"]["value"], 0.5);
    }
}
