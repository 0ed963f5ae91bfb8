//! WebSocket delivery of watched queries.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use super::watch::{QueryEvent, RegisterError};
use crate::http::App;

/// A watcher connection lives at most this long.
pub const WATCHER_MAX_LIFE: Duration = Duration::from_secs(120);

/// Grace period for the client's close reply before hard-closing.
pub const CLOSE_WAIT: Duration = Duration::from_secs(1);

/// Close code sent when the requested id is already taken.
const CLOSE_WATCHER_EXISTS: u16 = 4000;

fn is_valid_watcher_id(id: &str) -> bool {
    (1..=8).contains(&id.len())
        && id
            .bytes()
            .all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c))
}

/// `GET /watch/{watcher}` upgraded to a WebSocket.
pub async fn handler(
    ws: WebSocketUpgrade,
    Path(watcher_id): Path<String>,
    State(app): State<Arc<App>>,
) -> HttpResponse {
    if !is_valid_watcher_id(&watcher_id) {
        return (StatusCode::BAD_REQUEST, "bad request\n").into_response();
    }
    ws.protocols(["full"])
        .max_message_size(512)
        .on_upgrade(move |socket| serve_watcher(socket, watcher_id, app))
}

async fn serve_watcher(mut socket: WebSocket, watcher_id: String, app: Arc<App>) {
    let full = socket
        .protocol()
        .and_then(|p| p.to_str().ok())
        .is_some_and(|p| p == "full");
    let rx = match app.watchers.register(&watcher_id, full) {
        Ok(rx) => rx,
        Err(err) => {
            debug!("refusing watcher '{watcher_id}': {err}");
            let (code, reason) = match err {
                RegisterError::Exists => (CLOSE_WATCHER_EXISTS, "watcher already exists"),
                RegisterError::AtCapacity(_) => (1011, ""),
            };
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    };
    run_watcher(socket, rx).await;
    app.watchers.unregister(&watcher_id);
}

async fn run_watcher(socket: WebSocket, mut rx: mpsc::Receiver<QueryEvent>) {
    let (mut sink, mut stream) = socket.split();
    let deadline = tokio::time::sleep(WATCHER_MAX_LIFE);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => {
                // lifetime over: normal closure, then give the client a
                // moment to reply before dropping the connection
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: 1000,
                        reason: "".into(),
                    })))
                    .await;
                let _ = tokio::time::timeout(CLOSE_WAIT, async {
                    while let Some(Ok(msg)) = stream.next().await {
                        if matches!(msg, Message::Close(_)) {
                            break;
                        }
                    }
                })
                .await;
                return;
            }
            event = rx.recv() => {
                let Some(event) = event else { return };
                let Ok(json) = serde_json::to_string(&event) else { continue };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    return;
                }
            }
            incoming = stream.next() => {
                // the read side only serves keepalive and close detection
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watcher_id_grammar() {
        assert!(is_valid_watcher_id("a"));
        assert!(is_valid_watcher_id("deadbeef"));
        assert!(is_valid_watcher_id("01234567"));
        assert!(!is_valid_watcher_id(""));
        assert!(!is_valid_watcher_id("deadbeef0"));
        assert!(!is_valid_watcher_id("DEADBEEF"));
        assert!(!is_valid_watcher_id("nothex"));
    }
}
