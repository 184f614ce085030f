/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Context as _;
use axum::{
    body::Bytes,
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::{from_fn, from_fn_with_state, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use deadpool::managed::QueueMode;
use futures_util::{SinkExt, StreamExt};
use rendezvous_protocol::{validate_client_id, validate_session_id, Envelope, ErrorBody, PostAck};
use serde::Deserialize;
use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, info_span, warn};

mod clock;
mod election;
mod history;
mod hub;
mod lifecycle;
mod rate_limit;
mod registry;
mod session;
mod store;

use clock::SystemClock;
use hub::{HubConfig, SessionHub};
use rate_limit::{client_ip, RateLimiter};
use registry::{ConnId, Outbound};
use session::{SessionError, SessionHandle, SessionSettings};
use store::{build_store, DbDriver, StoreConfig};

static REQ_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> String {
    let id = REQ_ID.fetch_add(1, Ordering::Relaxed);
    format!("req-{id}")
}

#[derive(Clone)]
struct AppState {
    cfg: Arc<RelayConfig>,
    hub: SessionHub,
    limiter: Arc<RateLimiter>,
}

#[derive(Debug, Clone)]
struct RelayConfig {
    bind: SocketAddr,
    trust_proxy_headers: bool,
    max_body_bytes: usize,
    cors_origin: String,
    outbound_queue: usize,
    rate_limit_post_per_min: u32,
    rate_limit_poll_per_min: u32,
    rate_limit_connect_per_min: u32,
    noisy_backoff_base_secs: u64,
    noisy_backoff_max_secs: u64,
    session: SessionSettings,
    hub: HubConfig,
    store: StoreConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = load_config();
    let store = build_store(&cfg.store).await.context("open session store")?;
    let hub = SessionHub::new(
        cfg.session.clone(),
        Arc::from(store),
        Arc::new(SystemClock),
        cfg.hub.clone(),
    );
    let limiter = Arc::new(RateLimiter::new(cfg.noisy_backoff_base_secs, cfg.noisy_backoff_max_secs));
    let addr = cfg.bind;
    let state = AppState {
        cfg: Arc::new(cfg),
        hub: hub.clone(),
        limiter,
    };

    info!(
        driver = ?state.cfg.store.driver,
        max_history = state.cfg.session.max_history,
        join_approval = state.cfg.session.join_approval,
        presence = state.cfg.session.presence,
        "rendezvous_relay listening on http://{addr}"
    );
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    info!(sessions = hub.session_count().await, "rendezvous_relay stopping");
    hub.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("install ctrl-c handler failed: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn build_router(state: AppState) -> Router {
    let max_body = state.cfg.max_body_bytes;
    Router::new()
        .route("/ws", get(ws_connect).options(preflight))
        .route("/signal", get(signal_poll).post(signal_post).options(preflight))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(axum::extract::DefaultBodyLimit::max(max_body))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let request_id = req
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("req");
                info_span!(
                    "http",
                    method = %req.method(),
                    uri = %req.uri(),
                    request_id = %request_id
                )
            }),
        )
        .layer(from_fn_with_state(state.clone(), add_response_headers))
        .layer(from_fn(ensure_request_id))
        .with_state(state)
}

fn load_config() -> RelayConfig {
    let bind = std::env::var("RENDEZVOUS_BIND").unwrap_or_else(|_| "0.0.0.0:8788".to_string());
    let bind: SocketAddr = bind.parse().expect("RENDEZVOUS_BIND invalid");
    let trust_proxy_headers = env_flag("RENDEZVOUS_TRUST_PROXY_HEADERS");
    let max_body_bytes = std::env::var("RENDEZVOUS_MAX_BODY_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256 * 1024)
        .max(1024);
    let cors_origin = std::env::var("RENDEZVOUS_CORS_ORIGIN")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "*".to_string());
    let outbound_queue = std::env::var("RENDEZVOUS_OUTBOUND_QUEUE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(64)
        .clamp(1, 4096);
    let rate_limit_post_per_min = std::env::var("RENDEZVOUS_RATE_LIMIT_POST_PER_MIN")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(600);
    let rate_limit_poll_per_min = std::env::var("RENDEZVOUS_RATE_LIMIT_POLL_PER_MIN")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(1200);
    let rate_limit_connect_per_min = std::env::var("RENDEZVOUS_RATE_LIMIT_CONNECT_PER_MIN")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(120);
    let noisy_backoff_base_secs = std::env::var("RENDEZVOUS_NOISY_BACKOFF_BASE_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        .min(3600);
    let noisy_backoff_max_secs = std::env::var("RENDEZVOUS_NOISY_BACKOFF_MAX_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(600)
        .max(noisy_backoff_base_secs);

    let max_history = std::env::var("RENDEZVOUS_MAX_HISTORY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(1000)
        .clamp(1, 100_000);
    let host_stale_secs = std::env::var("RENDEZVOUS_HOST_STALE_SECS")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(45)
        .max(1);
    let resume_window_secs = std::env::var("RENDEZVOUS_RESUME_WINDOW_SECS")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(12 * 60)
        .max(1);
    let session = SessionSettings {
        max_history,
        host_stale_ms: host_stale_secs * 1000,
        resume_window_ms: resume_window_secs * 1000,
        join_approval: env_flag("RENDEZVOUS_JOIN_APPROVAL"),
        presence: env_flag("RENDEZVOUS_PRESENCE"),
    };

    let mailbox = std::env::var("RENDEZVOUS_MAILBOX")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256)
        .clamp(1, 65_536);
    let actor_idle_secs = std::env::var("RENDEZVOUS_ACTOR_IDLE_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(300)
        .max(1);
    let hub = HubConfig {
        mailbox,
        actor_idle: Duration::from_secs(actor_idle_secs),
    };

    let driver = std::env::var("RENDEZVOUS_DB_DRIVER")
        .ok()
        .and_then(|v| DbDriver::parse(&v))
        .unwrap_or(DbDriver::Sqlite);
    let path = PathBuf::from(std::env::var("RENDEZVOUS_DB").unwrap_or_else(|_| "rendezvous.db".to_string()));
    let db_url = std::env::var("RENDEZVOUS_DB_URL")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let db_synchronous = std::env::var("RENDEZVOUS_DB_SYNCHRONOUS")
        .ok()
        .map(|v| v.trim().to_ascii_uppercase())
        .filter(|v| matches!(v.as_str(), "OFF" | "NORMAL" | "FULL" | "EXTRA"))
        .unwrap_or_else(|| "NORMAL".to_string());
    let db_busy_timeout_ms = std::env::var("RENDEZVOUS_DB_BUSY_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5000)
        .min(60_000);
    let pg_pool_max_size = std::env::var("RENDEZVOUS_PG_POOL_MAX_SIZE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(16)
        .clamp(1, 256);
    let pg_pool_wait_ms = std::env::var("RENDEZVOUS_PG_POOL_WAIT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0);
    let pg_pool_queue_mode = std::env::var("RENDEZVOUS_PG_POOL_QUEUE_MODE")
        .ok()
        .map(|v| v.trim().to_ascii_lowercase())
        .and_then(|v| match v.as_str() {
            "lifo" => Some(QueueMode::Lifo),
            "fifo" => Some(QueueMode::Fifo),
            _ => None,
        })
        .unwrap_or(QueueMode::Fifo);
    let pg_init_retries = std::env::var("RENDEZVOUS_PG_INIT_RETRIES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(30)
        .clamp(1, 300);
    let pg_init_backoff_ms = std::env::var("RENDEZVOUS_PG_INIT_BACKOFF_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(500)
        .clamp(50, 30_000);
    let store = StoreConfig {
        driver,
        path,
        db_url,
        db_synchronous,
        db_busy_timeout_ms,
        pg_pool_max_size,
        pg_pool_wait_ms,
        pg_pool_queue_mode,
        pg_init_retries,
        pg_init_backoff_ms,
    };

    RelayConfig {
        bind,
        trust_proxy_headers,
        max_body_bytes,
        cors_origin,
        outbound_queue,
        rate_limit_post_per_min,
        rate_limit_poll_per_min,
        rate_limit_connect_per_min,
        noisy_backoff_base_secs,
        noisy_backoff_max_secs,
        session,
        hub,
        store,
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    session: Option<String>,
    client: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SignalQuery {
    session: Option<String>,
    client: Option<String>,
    since: Option<String>,
    snapshot: Option<String>,
}

fn bad_request(msg: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorBody::new(msg))).into_response()
}

fn rate_limited() -> Response {
    (StatusCode::TOO_MANY_REQUESTS, Json(ErrorBody::new("rate limited"))).into_response()
}

fn session_error_response(err: SessionError) -> Response {
    match err {
        SessionError::Input(e) => bad_request(e.to_string()),
        SessionError::AccessDenied => (StatusCode::FORBIDDEN, Json(ErrorBody::new("access denied"))).into_response(),
        SessionError::Storage(_) | SessionError::Shutdown => {
            (StatusCode::SERVICE_UNAVAILABLE, Json(ErrorBody::new("session unavailable"))).into_response()
        }
    }
}

async fn ws_connect(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(q): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let session = match validate_session_id(q.session.as_deref().unwrap_or_default()) {
        Ok(v) => v,
        Err(e) => return bad_request(e.to_string()),
    };
    let client_id = match validate_client_id(q.client.as_deref().unwrap_or_default()) {
        Ok(v) => v,
        Err(e) => return bad_request(e.to_string()),
    };
    let ip = client_ip(state.cfg.trust_proxy_headers, &peer, &headers);
    if !state.limiter.check(&ip, "connect", state.cfg.rate_limit_connect_per_min).await {
        warn!(%session, client = %client_id, %ip, "connect rejected: rate limited");
        return rate_limited();
    }

    // Registered before the upgrade completes: a client whose handshake
    // returned is already routable, and frames sent meanwhile wait in `rx`.
    let (tx, rx) = mpsc::channel::<Outbound>(state.cfg.outbound_queue);
    let attached = state
        .hub
        .call(&session, |handle| {
            let tx = tx.clone();
            let client_id = client_id.clone();
            async move { handle.connect(&client_id, tx).await.map(|conn| (handle, conn)) }
        })
        .await;
    drop(tx);
    let (handle, conn) = match attached {
        Ok(v) => v,
        Err(e) => {
            error!(%session, client = %client_id, "connect failed: {e}");
            return session_error_response(e);
        }
    };

    let failed_handle = handle.clone();
    ws.on_failed_upgrade(move |e| {
        debug!("websocket upgrade failed: {e}");
        tokio::spawn(async move { failed_handle.disconnect(conn).await });
    })
    .on_upgrade(move |socket| handle_socket(handle, conn, rx, session, client_id, socket))
}

async fn handle_socket(
    handle: SessionHandle,
    conn: ConnId,
    mut rx: mpsc::Receiver<Outbound>,
    session: String,
    client_id: String,
    socket: WebSocket,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_client = client_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(text) => {
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(reason) => {
                    debug!(client = %writer_client, reason, "closing socket");
                    let frame = CloseFrame {
                        code: close_code::NORMAL,
                        reason: reason.into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    let reader_handle = handle.clone();
    let reader_client = client_id.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let raw = match msg {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        debug!(client = %reader_client, "dropping non-utf8 binary frame");
                        continue;
                    }
                },
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if reader_handle.receive(conn, raw).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut writer => {}
        _ = &mut reader => {}
    }
    writer.abort();
    reader.abort();

    handle.disconnect(conn).await;
    info!(%session, client = %client_id, conn, "socket closed");
}

async fn signal_poll(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(q): Query<SignalQuery>,
) -> Response {
    let session = match validate_session_id(q.session.as_deref().unwrap_or_default()) {
        Ok(v) => v,
        Err(e) => return bad_request(e.to_string()),
    };
    let ip = client_ip(state.cfg.trust_proxy_headers, &peer, &headers);
    if !state.limiter.check(&ip, "poll", state.cfg.rate_limit_poll_per_min).await {
        return rate_limited();
    }
    let client_id = q.client.map(|c| c.trim().to_string()).unwrap_or_default();
    let since = q
        .since
        .as_deref()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let wants_snapshot = q
        .snapshot
        .as_deref()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));

    if wants_snapshot {
        let res = state
            .hub
            .call(&session, |h| {
                let client_id = client_id.clone();
                async move { h.read_snapshot(&client_id).await }
            })
            .await;
        return match res {
            Ok(snapshot) => Json(snapshot).into_response(),
            Err(e) => session_error_response(e),
        };
    }

    let res = state
        .hub
        .call(&session, |h| {
            let client_id = client_id.clone();
            async move { h.poll(since, &client_id).await }
        })
        .await;
    match res {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => session_error_response(e),
    }
}

async fn signal_post(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(q): Query<SignalQuery>,
    body: Bytes,
) -> Response {
    let ip = client_ip(state.cfg.trust_proxy_headers, &peer, &headers);
    if !state.limiter.check(&ip, "post", state.cfg.rate_limit_post_per_min).await {
        return rate_limited();
    }
    let raw = match std::str::from_utf8(&body) {
        Ok(v) => v,
        Err(_) => return bad_request("body is not utf-8"),
    };
    let mut envelope = match Envelope::parse(raw) {
        Ok(v) => v,
        Err(e) => return bad_request(e.to_string()),
    };
    if let Some(client) = q.client.as_deref() {
        match validate_client_id(client) {
            Ok(client) => envelope.default_from(&client),
            Err(e) => return bad_request(e.to_string()),
        }
    }
    if envelope.from_id().trim().is_empty() {
        return bad_request("missing sender");
    }

    let session = envelope.session.clone();
    let res = state
        .hub
        .call(&session, |h| {
            let envelope = envelope.clone();
            async move { h.post(envelope).await }
        })
        .await;
    match res {
        Ok(seq) => Json(PostAck { ok: true, seq }).into_response(),
        Err(e) => {
            if matches!(e, SessionError::Storage(_)) {
                error!(%session, "post failed: {e}");
            }
            session_error_response(e)
        }
    }
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<AppState>) -> Response {
    if let Err(e) = state.hub.store().health_check().await {
        warn!("readiness check failed: {e:#}");
        return (StatusCode::SERVICE_UNAVAILABLE, "storage not ready").into_response();
    }
    (StatusCode::OK, "ready").into_response()
}

async fn add_response_headers(
    State(state): State<AppState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(next_request_id);
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert(
        "X-Request-Id",
        HeaderValue::from_str(&request_id).unwrap_or_else(|_| HeaderValue::from_static("req")),
    );
    headers.insert(
        "Access-Control-Allow-Origin",
        HeaderValue::from_str(&state.cfg.cors_origin).unwrap_or_else(|_| HeaderValue::from_static("*")),
    );
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("content-type, x-request-id"),
    );
    headers.insert("Access-Control-Expose-Headers", HeaderValue::from_static("x-request-id"));
    headers.entry("X-Content-Type-Options").or_insert(HeaderValue::from_static("nosniff"));
    resp
}

async fn ensure_request_id(mut req: axum::http::Request<axum::body::Body>, next: Next) -> Response {
    let headers = req.headers_mut();
    if headers.get("x-request-id").is_none() {
        let request_id = next_request_id();
        headers.insert(
            "x-request-id",
            HeaderValue::from_str(&request_id).unwrap_or_else(|_| HeaderValue::from_static("req")),
        );
    }
    next.run(req).await
}
