use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};

use triad_agents::supervisor::CancelHandle;
use triad_agents::JobController;
use triad_bridge::event_hub::EventHub;
use triad_bridge::protocol::{error_frame, ClientMessage};
use triad_core::types::{EventKind, JobId};

/// Shared state behind the subscription endpoint.
pub struct AppState {
    pub controller: JobController,
    pub subscriber_backlog: usize,
    /// Jobs currently live; each accepts exactly one observing client.
    active_jobs: Mutex<HashSet<String>>,
}

impl AppState {
    pub fn new(controller: JobController, subscriber_backlog: usize) -> Self {
        Self {
            controller,
            subscriber_backlog,
            active_jobs: Mutex::new(HashSet::new()),
        }
    }

    /// Claim a job id for a new subscription. Returns `false` when the job
    /// is already live.
    fn claim_job(&self, job_id: &str) -> bool {
        self.active_jobs
            .lock()
            .expect("active jobs lock poisoned")
            .insert(job_id.to_string())
    }

    fn release_job(&self, job_id: &str) {
        self.active_jobs
            .lock()
            .expect("active jobs lock poisoned")
            .remove(job_id);
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/ws/jobs/{job_id}", get(ws_handler))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// WebSocket GET /ws/jobs/{job_id} -- the per-job subscription stream.
async fn ws_handler(
    Path(job_id): Path<String>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state, job_id))
}

/// Drive one subscription: read the start message, launch the job, and
/// forward progress events until the terminal `complete` frame.
///
/// A client that disconnects mid-run stops receiving events; the job keeps
/// running to its terminal state and still tears its workspaces down.
async fn handle_session(socket: WebSocket, state: Arc<AppState>, raw_job_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // First frame after bind must be `start`.
    let start = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Start(start)) => break start,
                Ok(ClientMessage::Cancel) => {
                    let _ = ws_tx
                        .send(Message::Text(
                            error_frame("cancel before start; expected a start message").into(),
                        ))
                        .await;
                    return;
                }
                Err(e) => {
                    let _ = ws_tx
                        .send(Message::Text(
                            error_frame(&format!("malformed start message: {e}")).into(),
                        ))
                        .await;
                    return;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(Message::Binary(_))) => {
                let _ = ws_tx
                    .send(Message::Text(error_frame("expected a text frame").into()))
                    .await;
                return;
            }
            Some(Err(e)) => {
                warn!(error = %e, "websocket error before start");
                return;
            }
        }
    };

    if !state.claim_job(&raw_job_id) {
        let _ = ws_tx
            .send(Message::Text(
                error_frame("job already has a live subscription").into(),
            ))
            .await;
        return;
    }

    let job_id = JobId::new(raw_job_id.clone());
    info!(job_id = %job_id, "subscription bound, starting job");

    let hub = EventHub::with_backlog(job_id.clone(), state.subscriber_backlog);
    let rx = hub.subscribe();
    let cancel = CancelHandle::new();

    let job = {
        let state = Arc::clone(&state);
        let hub = hub.clone();
        let cancel = cancel.clone();
        let job_id = job_id.clone();
        tokio::spawn(async move {
            state
                .controller
                .execute(job_id, start.into_job_request(), hub, cancel)
                .await
        })
    };

    // Release the job slot once the job itself is done, whether or not the
    // client is still connected.
    {
        let state = Arc::clone(&state);
        let raw_job_id = raw_job_id.clone();
        tokio::spawn(async move {
            let _ = job.await;
            state.release_job(&raw_job_id);
        });
    }

    loop {
        tokio::select! {
            event = rx.recv_async() => match event {
                Ok(event) => {
                    let is_complete = event.kind == EventKind::Complete;
                    let json = serde_json::to_string(&event).unwrap_or_default();
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        info!(job_id = %job_id, "client gone; job continues unobserved");
                        break;
                    }
                    if is_complete {
                        break;
                    }
                }
                Err(_) => break,
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Cancel) => {
                            info!(job_id = %job_id, "cancel requested by client");
                            cancel.cancel();
                        }
                        Ok(ClientMessage::Start(_)) => {
                            let _ = ws_tx
                                .send(Message::Text(error_frame("job already started").into()))
                                .await;
                        }
                        Err(e) => warn!(job_id = %job_id, error = %e, "ignoring malformed frame"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(job_id = %job_id, "client disconnected; job continues");
                    break;
                }
                Some(Err(e)) => {
                    warn!(job_id = %job_id, error = %e, "websocket error; job continues");
                    break;
                }
                _ => {}
            },
        }
    }

    let _ = ws_tx.close().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
