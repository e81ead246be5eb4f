//! WebSocket endpoint for live job status observation.
//!
//! An observer connects per (tenant, job, stage). On connect the current
//! persisted status document is replayed so late joiners see the present
//! state, then every broadcast frame for the topic is forwarded. Clients
//! may send `ping` frames to keep idle connections alive.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::common::status::status_update_frame;
use crate::kernel::pipeline::message::StageType;
use crate::kernel::status_hub;
use crate::kernel::sync_kernel::SyncKernel;

pub fn router(kernel: Arc<SyncKernel>) -> Router {
    Router::new()
        .route("/ws/status/:tenant_id/:job_id/:stage", get(status_ws))
        .with_state(kernel)
}

async fn status_ws(
    ws: WebSocketUpgrade,
    Path((tenant_id, job_id, stage)): Path<(Uuid, Uuid, String)>,
    State(kernel): State<Arc<SyncKernel>>,
) -> impl IntoResponse {
    let Some(stage) = StageType::parse(&stage) else {
        return (StatusCode::BAD_REQUEST, format!("unknown stage {stage}")).into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, kernel, tenant_id, job_id, stage))
        .into_response()
}

async fn handle_socket(
    mut socket: WebSocket,
    kernel: Arc<SyncKernel>,
    tenant_id: Uuid,
    job_id: Uuid,
    stage: StageType,
) {
    let topic = status_hub::topic(tenant_id, job_id, stage);
    // Subscribe before the replay so no frame between the snapshot read
    // and the subscription is lost.
    let mut updates = kernel.hub.subscribe(&topic);

    // Replay the persisted document to the late joiner.
    match kernel.store.find(job_id, tenant_id).await {
        Ok(Some(job)) => {
            let frame = job
                .status_document()
                .map(|doc| status_update_frame(&doc, Utc::now()));
            match frame {
                Ok(frame) => {
                    if send_json(&mut socket, &frame).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!(job_id = %job_id, error = %e, "failed to build replay frame"),
            }
        }
        Ok(None) => {
            let _ = socket
                .send(Message::Close(None))
                .await;
            return;
        }
        Err(e) => warn!(job_id = %job_id, error = %e, "failed to load job for replay"),
    }

    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(frame) => {
                        if send_json(&mut socket, &frame).await.is_err() {
                            return;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        // Missed intermediate frames; the next one carries
                        // the full document, so nothing is inconsistent.
                        debug!(topic = %topic, missed, "status observer lagged");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Text(text))) if is_ping_frame(&text) => {
                        let pong = serde_json::json!({"type": "pong"}).to_string();
                        if socket.send(Message::Text(pong)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(topic = %topic, error = %e, "status observer socket error");
                        return;
                    }
                }
            }
        }
    }
}

async fn send_json(socket: &mut WebSocket, frame: &serde_json::Value) -> Result<(), axum::Error> {
    socket.send(Message::Text(frame.to_string())).await
}

fn is_ping_frame(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .map(|v| v["type"] == "ping")
        .unwrap_or(false)
}
