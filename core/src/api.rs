/// Inbox REST API + SSE: HTTP server for a UI process
///
/// Endpoints:
///   GET    /api/status
///   GET    /api/conversations             ?q=<search>&filter=all|unread
///   GET    /api/unread
///   POST   /api/refresh
///   POST   /api/foreground
///   POST   /api/conversations/:id/read
///   DELETE /api/conversations/:id
///   PUT    /api/session                   body: {"id":"...","display_name":"..."}
///   DELETE /api/session
///   GET    /events                        SSE stream of SyncEvent JSON
///
/// SSE frames are named by what changed: `identity`, `conversations`,
/// `unread`, `channel`, or `error.<kind>` (e.g. `error.snapshot_fetch`).
///
/// Demo-only, served when backed by the in-memory remote:
///   POST   /api/dev/messages              body: {"conversation_id":"...","sender_id":"...","body":"..."}
///   PUT    /api/dev/profiles/:id          body: {"display_name":"...","avatar_ref":"..."}
use crate::engine::EngineHandle;
use crate::error::{ErrorKind, Result, SyncError};
use crate::memory::{MemoryRemote, Profile};
use crate::types::{Identity, SyncEvent};
use crate::view_model::{ConversationListViewModel, Filter};
use futures_util::stream::{unfold, StreamExt};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

// ─── Type alias ──────────────────────────────────────────────────────────────

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, Infallible>;
type Resp = Response<BoxBody>;

/// What the request handlers need
#[derive(Clone)]
pub struct ApiState {
    pub engine: EngineHandle,
    /// Present when running against the in-memory remote
    pub dev: Option<Arc<MemoryRemote>>,
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn cors_headers(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, PUT, DELETE, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type")
}

fn json_resp(status: StatusCode, body: Vec<u8>) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(bytes::Bytes::from(body)).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

fn json_ok(value: serde_json::Value) -> Resp {
    json_resp(StatusCode::OK, serde_json::to_vec(&value).unwrap_or_default())
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_resp(
        status,
        serde_json::to_vec(&serde_json::json!({ "error": msg })).unwrap_or_default(),
    )
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Mutation | ErrorKind::SnapshotFetch | ErrorKind::ChannelConnection => {
            StatusCode::BAD_GATEWAY
        }
        ErrorKind::IdentityResolution => StatusCode::UNAUTHORIZED,
        ErrorKind::Config | ErrorKind::Io | ErrorKind::Serialization => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn sync_err(e: &SyncError) -> Resp {
    json_resp(
        status_for(e.kind()),
        serde_json::to_vec(&serde_json::json!({
            "error": e.to_string(),
            "kind": e.kind(),
        }))
        .unwrap_or_default(),
    )
}

fn sse_event_name(event: &SyncEvent) -> String {
    match event {
        SyncEvent::IdentityChanged { .. } => "identity".to_string(),
        SyncEvent::ConversationsChanged { .. } => "conversations".to_string(),
        SyncEvent::UnreadChanged { .. } => "unread".to_string(),
        SyncEvent::ChannelChanged { .. } => "channel".to_string(),
        SyncEvent::Error { kind, .. } => format!("error.{}", kind.as_str()),
    }
}

fn sse_frame(event: &SyncEvent) -> bytes::Bytes {
    let json = serde_json::to_string(event).unwrap_or_default();
    bytes::Bytes::from(format!("event: {}\ndata: {}\n\n", sse_event_name(event), json))
}

fn sse_resp(rx: tokio::sync::broadcast::Receiver<SyncEvent>) -> Resp {
    // Comment frame first so the client sees the stream open
    let initial = bytes::Bytes::from(": connected\n\n");
    let first = futures_util::stream::once(async move {
        Ok::<Frame<bytes::Bytes>, Infallible>(Frame::data(initial))
    });

    let events = unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let frame = Frame::data(sse_frame(&event));
                    return Some((Ok::<_, Infallible>(frame), rx));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("SSE client lagged {} events", n);
                    continue;
                }
                Err(_) => return None,
            }
        }
    });

    let stream = first.chain(events);
    cors_headers(Response::builder())
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream; charset=utf-8")
        .header("Cache-Control", "no-cache")
        .header("X-Accel-Buffering", "no")
        .body(BodyExt::boxed(StreamBody::new(stream)))
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

// ─── Entry point ─────────────────────────────────────────────────────────────

pub async fn start_api(state: ApiState, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(SyncError::Io)?;
    info!("Inbox API started on http://{}", addr);
    serve(listener, state).await;
    Ok(())
}

/// Accept loop over an already bound listener
pub async fn serve(listener: TcpListener, state: ApiState) {
    let state = Arc::new(state);
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let io = TokioIo::new(stream);
                let state = state.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle(req, state).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        // SSE clients hang up mid-stream
                        if !e.is_incomplete_message() {
                            error!("Inbox API connection error: {:?}", e);
                        }
                    }
                });
            }
            Err(e) => error!("Inbox API accept error: {}", e),
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

async fn handle(req: Request<hyper::body::Incoming>, state: Arc<ApiState>) -> Resp {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    if method == Method::OPTIONS {
        return cors_headers(Response::builder())
            .status(StatusCode::NO_CONTENT)
            .body(Full::new(bytes::Bytes::new()).boxed())
            .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()));
    }

    match (method.clone(), path.as_str()) {
        (Method::GET, "/api/status") => get_status(&state).await,
        (Method::GET, "/api/conversations") => get_conversations(&query, &state),
        (Method::GET, "/api/unread") => get_unread(&state),
        (Method::POST, "/api/refresh") => accepted(state.engine.refresh_now()),
        (Method::POST, "/api/foreground") => accepted(state.engine.foregrounded()),
        (Method::PUT, "/api/session") => put_session(req, &state).await,
        (Method::DELETE, "/api/session") => delete_session(&state).await,
        (Method::GET, "/events") => sse_resp(state.engine.subscribe_to_events()),
        (Method::POST, "/api/dev/messages") => post_dev_message(req, &state).await,
        _ => {
            if let Some(rest) = path.strip_prefix("/api/conversations/") {
                if method == Method::POST {
                    if let Some(id) = rest.strip_suffix("/read") {
                        return accepted(state.engine.mark_read(decode(id)));
                    }
                }
                if method == Method::DELETE && !rest.contains('/') {
                    return delete_conversation(&decode(rest), &state).await;
                }
            }
            if method == Method::PUT {
                if let Some(id) = path.strip_prefix("/api/dev/profiles/") {
                    let id = decode(id);
                    return put_dev_profile(req, &id, &state).await;
                }
            }
            json_err(StatusCode::NOT_FOUND, "not found")
        }
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn get_status(state: &ApiState) -> Resp {
    match state.engine.status().await {
        Ok(status) => json_ok(serde_json::json!({
            "status": status,
            "settled": status.is_settled(),
        })),
        Err(e) => sync_err(&e),
    }
}

fn get_conversations(query: &str, state: &ApiState) -> Resp {
    let filter = match Filter::parse(&query_param(query, "filter").unwrap_or_default()) {
        Some(filter) => filter,
        None => return json_err(StatusCode::BAD_REQUEST, "filter must be all or unread"),
    };
    let mut vm = ConversationListViewModel::new();
    vm.set_query(query_param(query, "q").unwrap_or_default());
    vm.set_filter(filter);

    let set = state.engine.conversations();
    let unread = state.engine.unread();
    let rows = vm.rows(&set, &unread);
    json_ok(serde_json::json!({
        "revision": set.revision(),
        "unread_count": ConversationListViewModel::unread_count(&set, &unread),
        "conversations": rows,
    }))
}

fn get_unread(state: &ApiState) -> Resp {
    let unread = state.engine.unread();
    let ids: Vec<_> = unread.iter().collect();
    json_ok(serde_json::json!({ "unread": ids }))
}

fn accepted(result: Result<()>) -> Resp {
    match result {
        Ok(()) => json_resp(
            StatusCode::ACCEPTED,
            serde_json::to_vec(&serde_json::json!({ "accepted": true })).unwrap_or_default(),
        ),
        Err(e) => sync_err(&e),
    }
}

async fn delete_conversation(id: &str, state: &ApiState) -> Resp {
    match state.engine.delete_conversation(id).await {
        Ok(()) => json_ok(serde_json::json!({ "deleted": id })),
        Err(e) => sync_err(&e),
    }
}

#[derive(Deserialize)]
struct SessionRequest {
    id: String,
    display_name: Option<String>,
}

async fn put_session(req: Request<hyper::body::Incoming>, state: &ApiState) -> Resp {
    let body = match read_body(req).await {
        Ok(b) => b,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)),
    };
    let r: SessionRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)),
    };
    if r.id.trim().is_empty() {
        return json_err(StatusCode::BAD_REQUEST, "id must not be empty");
    }
    let identity = Identity {
        id: r.id.into(),
        display_name: r.display_name,
    };
    if let Some(dev) = &state.dev {
        dev.set_session(Some(identity.clone())).await;
    }
    accepted(state.engine.set_identity(Some(identity)))
}

async fn delete_session(state: &ApiState) -> Resp {
    if let Some(dev) = &state.dev {
        dev.set_session(None).await;
    }
    accepted(state.engine.set_identity(None))
}

#[derive(Deserialize)]
struct DevMessageRequest {
    conversation_id: String,
    sender_id: String,
    body: String,
}

async fn post_dev_message(req: Request<hyper::body::Incoming>, state: &ApiState) -> Resp {
    let Some(dev) = &state.dev else {
        return json_err(StatusCode::NOT_FOUND, "not found");
    };
    let body = match read_body(req).await {
        Ok(b) => b,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)),
    };
    let r: DevMessageRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)),
    };
    match dev.post_message(r.conversation_id, r.sender_id, r.body).await {
        Ok(event) => json_ok(serde_json::json!({ "event": event })),
        Err(e) => json_err(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

async fn put_dev_profile(req: Request<hyper::body::Incoming>, id: &str, state: &ApiState) -> Resp {
    let Some(dev) = &state.dev else {
        return json_err(StatusCode::NOT_FOUND, "not found");
    };
    let body = match read_body(req).await {
        Ok(b) => b,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)),
    };
    let profile: Profile = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)),
    };
    let notified = dev.upsert_profile(id, profile).await;
    json_ok(serde_json::json!({ "notified_channels": notified }))
}

// ─── Utilities ────────────────────────────────────────────────────────────────

async fn read_body(req: Request<hyper::body::Incoming>) -> std::result::Result<bytes::Bytes, String> {
    req.collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| e.to_string())
}

fn decode(value: &str) -> String {
    urlencoding::decode(value)
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

fn query_param(query: &str, key: &str) -> Option<String> {
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            if k == key {
                return Some(decode(&v.replace('+', " ")));
            }
        }
    }
    None
}
