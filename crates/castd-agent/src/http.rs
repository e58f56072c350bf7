use std::path::{Component, Path as FsPath};

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use castd_process::ChannelId;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    Supervisor,
    config::NotReadyPolicy,
    error::SupervisorError,
    waiter::{self, WaitOutcome},
};

const DEFAULT_TAIL_LIMIT: usize = 200;
const MAX_TAIL_LIMIT: usize = 2000;

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

fn json_error(code: StatusCode, message: impl Into<String>) -> Response {
    (
        code,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
        .into_response()
}

fn content_type_for(name: &str) -> &'static str {
    match FsPath::new(name).extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        Some("m4s") => "video/iso.segment",
        Some("mp4") => "video/mp4",
        Some("vtt") => "text/vtt",
        _ => "application/octet-stream",
    }
}

/// A segment name must be a single plain path component.
fn is_plain_file_name(name: &str) -> bool {
    let mut comps = FsPath::new(name).components();
    matches!(
        (comps.next(), comps.next()),
        (Some(Component::Normal(_)), None)
    )
}

pub fn router(supervisor: Supervisor) -> Router {
    let prefix = supervisor.settings().url_prefix.trim_matches('/').to_string();
    Router::new()
        .route(&format!("/{prefix}/:file"), get(manifest))
        .route(&format!("/{prefix}/:channel/:segment"), get(segment))
        .route("/stats", get(stats))
        .route("/stats/history", get(stats_history))
        .route("/logs/recent", get(logs_recent))
        .route("/logs/ws", get(logs_ws))
        .route("/streams/:channel/stop", post(stop))
        .route("/healthz", get(healthz))
        .with_state(supervisor)
}

async fn not_ready(sup: &Supervisor) -> Response {
    if sup.settings().not_ready == NotReadyPolicy::Placeholder
        && let Some(path) = &sup.settings().placeholder_manifest
    {
        match tokio::fs::read(path).await {
            Ok(body) => {
                return (
                    StatusCode::OK,
                    [
                        (header::CONTENT_TYPE, content_type_for(&sup.settings().manifest_name)),
                        (header::CACHE_CONTROL, "no-cache"),
                    ],
                    body,
                )
                    .into_response();
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "placeholder manifest unreadable");
            }
        }
    }

    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::RETRY_AFTER, "2"), (header::CACHE_CONTROL, "no-cache")],
        "stream not ready",
    )
        .into_response()
}

async fn manifest(State(sup): State<Supervisor>, Path(file): Path<String>) -> Response {
    let ext = sup.settings().manifest_ext();
    let Some(raw) = file
        .strip_suffix(ext)
        .and_then(|s| s.strip_suffix('.'))
    else {
        return json_error(StatusCode::NOT_FOUND, "not found");
    };

    // Dropping the handler future (client gone) cancels the token.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    match waiter::wait_for_manifest(&sup, raw, &cancel).await {
        Ok(WaitOutcome::Ready(body)) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type_for(&file)),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            body,
        )
            .into_response(),
        Ok(WaitOutcome::NotReady) => not_ready(&sup).await,
        Ok(WaitOutcome::Cancelled) => StatusCode::NO_CONTENT.into_response(),
        Err(SupervisorError::InvalidIdentifier(id)) => {
            json_error(StatusCode::BAD_REQUEST, format!("invalid channel id: {id:?}"))
        }
        Err(err) => {
            tracing::warn!(error = %err, "manifest request failed");
            not_ready(&sup).await
        }
    }
}

async fn segment(
    State(sup): State<Supervisor>,
    Path((channel, segment)): Path<(String, String)>,
) -> Response {
    let Ok(channel) = ChannelId::parse(&channel) else {
        return json_error(StatusCode::BAD_REQUEST, "invalid channel id");
    };
    if !is_plain_file_name(&segment) {
        return json_error(StatusCode::BAD_REQUEST, "invalid segment name");
    }

    sup.registry().touch(&channel, Instant::now()).await;

    let path = sup.settings().work_dir(&channel).join(&segment);
    match tokio::fs::read(&path).await {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type_for(&segment))],
            body,
        )
            .into_response(),
        Err(_) => json_error(StatusCode::NOT_FOUND, "segment not found"),
    }
}

async fn stats(State(sup): State<Supervisor>) -> Response {
    Json(sup.stats_report().await).into_response()
}

async fn stats_history(State(sup): State<Supervisor>) -> Response {
    Json(sup.history().await).into_response()
}

#[derive(Debug, Deserialize)]
struct TailQuery {
    cursor: Option<u64>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TailResponse {
    lines: Vec<String>,
    next_cursor: u64,
}

async fn logs_recent(State(sup): State<Supervisor>, Query(q): Query<TailQuery>) -> Response {
    let limit = q
        .limit
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_TAIL_LIMIT)
        .min(MAX_TAIL_LIMIT);
    let (lines, next_cursor) = sup.logs().tail_after(q.cursor.unwrap_or(0), limit).await;
    Json(TailResponse { lines, next_cursor }).into_response()
}

async fn logs_ws(State(sup): State<Supervisor>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_logs(sup, socket))
}

async fn stream_logs(sup: Supervisor, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut sub = sup.logs().subscribe().await;

    loop {
        tokio::select! {
            line = sub.rx.recv() => {
                let Some(line) = line else { break };
                if sender.send(Message::Text(line)).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    sup.logs().unsubscribe(sub.id).await;
}

#[derive(Debug, Serialize)]
struct StopResponse {
    stopped: bool,
}

async fn stop(State(sup): State<Supervisor>, Path(channel): Path<String>) -> Response {
    let Ok(channel) = ChannelId::parse(&channel) else {
        return json_error(StatusCode::BAD_REQUEST, "invalid channel id");
    };
    let stopped = sup.stop_stream(&channel).await;
    Json(StopResponse { stopped }).into_response()
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    active: usize,
}

async fn healthz(State(sup): State<Supervisor>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: if sup.is_shutting_down() {
            "stopping"
        } else {
            "ok"
        },
        version: env!("CARGO_PKG_VERSION"),
        active: sup.active_count().await,
    })
}
