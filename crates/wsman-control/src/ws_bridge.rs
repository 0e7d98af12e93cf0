//! Relays a client WebSocket to an instance.
//!
//! The backend connection is opened before the client upgrade completes.
//! Frames the backend sends in that window are held in [`EarlyFrames`] and
//! delivered first, in arrival order, once the client side is attached.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{self, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::{
    self, client::IntoClientRequest, protocol::CloseFrame as BackendCloseFrame,
    protocol::frame::coding::CloseCode,
};
use tracing::Instrument;

use crate::security::json_error;

enum EarlyState {
    Buffering(VecDeque<ws::Message>),
    Attached(mpsc::UnboundedSender<ws::Message>),
    /// Backend gone before the client attached.
    Finished(VecDeque<ws::Message>),
    Closed,
}

/// Backend-to-client frames, buffered until the client attaches.
pub struct EarlyFrames {
    state: Mutex<EarlyState>,
}

impl Default for EarlyFrames {
    fn default() -> Self {
        Self::new()
    }
}

impl EarlyFrames {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EarlyState::Buffering(VecDeque::new())),
        }
    }

    /// Queues or forwards a frame. `false` once nobody will read it anymore.
    pub fn push(&self, msg: ws::Message) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *state {
            EarlyState::Buffering(buffer) => {
                buffer.push_back(msg);
                true
            }
            EarlyState::Attached(tx) => tx.send(msg).is_ok(),
            EarlyState::Finished(_) | EarlyState::Closed => false,
        }
    }

    /// Switches to direct delivery. Buffered frames come out of the returned
    /// receiver first. The receiver ends after [`Self::close`].
    pub fn attach(&self) -> mpsc::UnboundedReceiver<ws::Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match std::mem::replace(&mut *state, EarlyState::Closed) {
            EarlyState::Buffering(buffer) => {
                for msg in buffer {
                    let _ = tx.send(msg);
                }
                *state = EarlyState::Attached(tx);
            }
            EarlyState::Finished(buffer) => {
                for msg in buffer {
                    let _ = tx.send(msg);
                }
            }
            EarlyState::Attached(previous) => {
                *state = EarlyState::Attached(previous);
            }
            EarlyState::Closed => {}
        }
        rx
    }

    /// No more frames will arrive. Already buffered frames stay deliverable.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let EarlyState::Buffering(buffer) = std::mem::replace(&mut *state, EarlyState::Closed) {
            *state = EarlyState::Finished(buffer);
        }
    }

    pub fn buffered(&self) -> usize {
        match &*self.state.lock().unwrap_or_else(|e| e.into_inner()) {
            EarlyState::Buffering(buffer) | EarlyState::Finished(buffer) => buffer.len(),
            _ => 0,
        }
    }
}

fn to_client(msg: tungstenite::Message) -> Option<ws::Message> {
    Some(match msg {
        tungstenite::Message::Text(text) => ws::Message::Text(text.as_str().to_owned()),
        tungstenite::Message::Binary(data) => ws::Message::Binary(data.to_vec()),
        tungstenite::Message::Close(frame) => ws::Message::Close(frame.map(|f| ws::CloseFrame {
            code: f.code.into(),
            reason: Cow::Owned(f.reason.as_str().to_owned()),
        })),
        tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) | tungstenite::Message::Frame(_) => {
            return None;
        }
    })
}

fn to_backend(msg: ws::Message) -> Option<tungstenite::Message> {
    Some(match msg {
        ws::Message::Text(text) => tungstenite::Message::Text(text.into()),
        ws::Message::Binary(data) => tungstenite::Message::Binary(data.into()),
        ws::Message::Close(frame) => tungstenite::Message::Close(frame.map(|f| BackendCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason.into_owned().into(),
        })),
        ws::Message::Ping(_) | ws::Message::Pong(_) => return None,
    })
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Where to connect and which client headers to pass along.
#[derive(Debug, Clone)]
pub struct BackendTarget {
    pub url: String,
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

/// Connects to `target` and, once that succeeds, accepts the client upgrade.
/// `on_client_message` runs for every frame the client sends.
pub async fn bridge(
    ws: WebSocketUpgrade,
    target: BackendTarget,
    on_client_message: impl Fn() + Send + Sync + 'static,
) -> Response {
    let mut request = match target.url.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => return json_error(StatusCode::BAD_GATEWAY, format!("invalid backend url: {e}")),
    };
    for (name, value) in target.headers {
        request.headers_mut().insert(name, value);
    }

    let (backend, response) = match tokio_tungstenite::connect_async(request).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(url = %target.url, error = %e, "backend websocket connect failed");
            return json_error(StatusCode::BAD_GATEWAY, "backend unavailable");
        }
    };
    let protocol = response
        .headers()
        .get(axum::http::header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let (backend_tx, mut backend_rx) = backend.split();
    let early = Arc::new(EarlyFrames::new());
    let reader = tokio::spawn({
        let early = early.clone();
        async move {
            while let Some(msg) = backend_rx.next().await {
                match msg {
                    Ok(msg) => {
                        let Some(msg) = to_client(msg) else { continue };
                        let closing = matches!(msg, ws::Message::Close(_));
                        if !early.push(msg) || closing {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "backend websocket read failed");
                        break;
                    }
                }
            }
            early.close();
        }
    });
    // Aborts the reader if the upgrade never completes.
    let guard = AbortOnDrop(reader.abort_handle());

    let ws = match protocol {
        Some(protocol) => ws.protocols([protocol]),
        None => ws,
    };
    let span = tracing::info_span!("ws_bridge", url = %target.url);
    ws.on_upgrade(move |socket| {
        async move {
            relay(socket, backend_tx, &early, on_client_message).await;
            drop(guard);
        }
        .instrument(span)
    })
    .into_response()
}

async fn relay<S>(
    socket: WebSocket,
    mut backend_tx: S,
    early: &EarlyFrames,
    on_client_message: impl Fn(),
) where
    S: Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let (mut client_tx, mut client_rx) = socket.split();
    let mut from_backend = early.attach();

    let client_to_backend = async {
        while let Some(msg) = client_rx.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!(error = %e, "client websocket read failed");
                    break;
                }
            };
            on_client_message();
            let closing = matches!(msg, ws::Message::Close(_));
            if let Some(msg) = to_backend(msg)
                && let Err(e) = backend_tx.send(msg).await
            {
                tracing::debug!(error = %e, "backend websocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    };
    let backend_to_client = async {
        while let Some(msg) = from_backend.recv().await {
            let closing = matches!(msg, ws::Message::Close(_));
            if let Err(e) = client_tx.send(msg).await {
                tracing::debug!(error = %e, "client websocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    };

    tokio::select! {
        _ = client_to_backend => {}
        _ = backend_to_client => {}
    }
    let _ = backend_tx.close().await;
    let _ = client_tx.close().await;
    tracing::debug!("websocket bridge closed");
}
