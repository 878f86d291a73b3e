//! WebSocket stream for one session
//!
//! Binary messages carry snapshots and frames in the wire format; JSON text
//! messages carry `session-exit`, `resync`, `pong` and `error` events. The
//! client sends JSON `input`, `resize`, `error` and `ping` messages.

use axum::{
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::codec::Encoder;
use tracing::{debug, info, warn};
use virtual_terminal::{FrameCodec, FrameError};

use crate::AppState;
use crate::broadcaster::{StreamEvent, Subscription};
use crate::input::InputRequest;
use crate::registry::SessionRegistry;
use crate::session::ExitReason;

/// Close code sent when the supervisor severs a subscription. Clients
/// should fetch a fresh snapshot by resubscribing.
pub const CLOSE_RESYNC: u16 = 4000;
const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Input {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        key: Option<String>,
    },
    Resize {
        cols: i64,
        rows: i64,
    },
    /// Transport trouble the client noticed on its side
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    SessionExit {
        exit_code: Option<i32>,
        reason: ExitReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
    Resync {
        reason: String,
    },
    Pong,
    Error {
        code: String,
        message: String,
    },
}

impl ServerEvent {
    fn to_message(&self) -> Message {
        // Serializing these variants cannot fail
        let json = serde_json::to_string(self).unwrap_or_default();
        Message::Text(json.into())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    client_id: Option<String>,
}

/// `GET /sessions/{id}/stream`
pub async fn stream_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let client_id = query.client_id.unwrap_or_default();
    let subscription = match state.registry.subscribe(&id, &client_id).await {
        Ok(sub) => sub,
        Err(e) => return e.into_response(),
    };
    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| handle_stream(socket, registry, subscription))
}

/// Turns stream events into WebSocket messages for one subscriber.
///
/// Frames at or below the last delivered snapshot are skipped, and a
/// `resync` notice is only emitted together with the snapshot it announces.
struct Outbound {
    codec: FrameCodec,
    last_seq: Option<u64>,
    pending_resync: Option<String>,
}

impl Outbound {
    fn new() -> Self {
        Self {
            codec: FrameCodec::new(),
            last_seq: None,
            pending_resync: None,
        }
    }

    /// Messages for one event, and whether the stream is finished.
    fn messages(&mut self, event: StreamEvent) -> Result<(Vec<Message>, bool), FrameError> {
        let mut out = Vec::new();
        match event {
            StreamEvent::Snapshot(snapshot) => {
                if self.last_seq.is_some_and(|seq| snapshot.seq < seq) {
                    self.pending_resync = None;
                    return Ok((out, false));
                }
                if let Some(reason) = self.pending_resync.take() {
                    out.push(ServerEvent::Resync { reason }.to_message());
                }
                let mut buf = BytesMut::new();
                self.codec.encode(&snapshot, &mut buf)?;
                self.last_seq = Some(snapshot.seq);
                out.push(Message::Binary(buf.freeze()));
            }
            StreamEvent::Frame(frame) => {
                if self.last_seq.is_some_and(|seq| frame.seq <= seq) {
                    return Ok((out, false));
                }
                let mut buf = BytesMut::new();
                self.codec.encode(&frame, &mut buf)?;
                self.last_seq = Some(frame.seq);
                out.push(Message::Binary(buf.freeze()));
            }
            StreamEvent::Resync => {
                self.pending_resync = Some("lagging".to_string());
            }
            StreamEvent::Exit(notice) => {
                out.push(
                    ServerEvent::SessionExit {
                        exit_code: notice.exit_code,
                        reason: notice.reason,
                        signal: notice.signal,
                    }
                    .to_message(),
                );
                out.push(close_message(CLOSE_NORMAL, "session exited"));
                return Ok((out, true));
            }
        }
        Ok((out, false))
    }
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

enum SendOutcome {
    Sent,
    TimedOut,
    Closed,
}

async fn send_with_timeout(
    sink: &mut SplitSink<WebSocket, Message>,
    message: Message,
    timeout: Duration,
) -> SendOutcome {
    match tokio::time::timeout(timeout, sink.send(message)).await {
        Ok(Ok(())) => SendOutcome::Sent,
        Ok(Err(_)) => SendOutcome::Closed,
        Err(_) => SendOutcome::TimedOut,
    }
}

async fn handle_stream(socket: WebSocket, registry: Arc<SessionRegistry>, subscription: Subscription) {
    let Subscription {
        id: sub_id,
        session_id,
        client_id,
        mut events,
        severed,
    } = subscription;
    info!(
        session_id = %session_id,
        sub_id,
        client_id = %client_id,
        "Stream opened"
    );

    let send_timeout = registry.config().stream.send_timeout;
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (control_tx, mut control_rx) = mpsc::channel::<ServerEvent>(32);

    let writer_registry = registry.clone();
    let writer_session = session_id.clone();
    let sender_task = async move {
        let mut outbound = Outbound::new();
        loop {
            let messages = tokio::select! {
                biased;
                _ = severed.cancelled() => {
                    let resync = ServerEvent::Resync { reason: "severed".to_string() };
                    let _ = send_with_timeout(&mut ws_sender, resync.to_message(), send_timeout).await;
                    let _ = send_with_timeout(
                        &mut ws_sender,
                        close_message(CLOSE_RESYNC, "resync"),
                        send_timeout,
                    )
                    .await;
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => match outbound.messages(event) {
                        Ok(batch) => batch,
                        Err(e) => {
                            warn!(session_id = %writer_session, sub_id, "Failed to encode stream message: {}", e);
                            continue;
                        }
                    },
                    None => {
                        // Session deleted
                        let _ = send_with_timeout(
                            &mut ws_sender,
                            close_message(CLOSE_NORMAL, "session closed"),
                            send_timeout,
                        )
                        .await;
                        break;
                    }
                },
                Some(control) = control_rx.recv() => (vec![control.to_message()], false),
            };

            let (messages, finished) = messages;
            let mut stalled = false;
            for message in messages {
                match send_with_timeout(&mut ws_sender, message, send_timeout).await {
                    SendOutcome::Sent => {}
                    SendOutcome::TimedOut => {
                        stalled = true;
                        break;
                    }
                    SendOutcome::Closed => return,
                }
            }

            if finished {
                break;
            }
            if stalled {
                warn!(session_id = %writer_session, sub_id, "Send timed out");
                writer_registry
                    .report_transport_error(&writer_session, sub_id)
                    .await;
                // The dropped message left a gap: resync from a fresh snapshot
                if let Ok(snapshot) = writer_registry.snapshot(&writer_session).await {
                    outbound.pending_resync = Some("send_timeout".to_string());
                    if let Ok((messages, _)) = outbound.messages(StreamEvent::Snapshot(snapshot)) {
                        for message in messages {
                            if let SendOutcome::Closed =
                                send_with_timeout(&mut ws_sender, message, send_timeout).await
                            {
                                return;
                            }
                        }
                    }
                }
            }
        }
    };

    let reader_registry = registry.clone();
    let reader_session = session_id.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let reply = match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(message) => {
                            handle_client_message(&reader_registry, &reader_session, sub_id, message)
                                .await
                        }
                        Err(e) => Some(ServerEvent::Error {
                            code: "invalid_message".to_string(),
                            message: e.to_string(),
                        }),
                    };
                    if let Some(reply) = reply {
                        if control_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(session_id = %reader_session, sub_id, "WebSocket receive error: {}", e);
                    reader_registry
                        .report_transport_error(&reader_session, sub_id)
                        .await;
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!(session_id = %session_id, sub_id, "Sender task ended"),
        _ = input_task => debug!(session_id = %session_id, sub_id, "Input task ended"),
    }

    registry.unsubscribe(&session_id, sub_id).await;
    info!(session_id = %session_id, sub_id, "Stream closed");
}

/// Apply one client message; returns the reply to send, if any.
async fn handle_client_message(
    registry: &SessionRegistry,
    session_id: &str,
    sub_id: u64,
    message: ClientMessage,
) -> Option<ServerEvent> {
    let result = match message {
        ClientMessage::Input { text, key } => {
            let request = match (text, key) {
                (Some(text), _) => InputRequest::text(text),
                (None, Some(key)) => InputRequest::key(key),
                (None, None) => {
                    return Some(ServerEvent::Error {
                        code: "invalid_message".to_string(),
                        message: "input needs text or key".to_string(),
                    });
                }
            };
            registry.send_input(session_id, &request).await.map(|_| ())
        }
        ClientMessage::Resize { cols, rows } => {
            registry.resize(session_id, cols, rows).await.map(|_| ())
        }
        ClientMessage::Error { message } => {
            warn!(
                session_id = %session_id,
                sub_id,
                "Client reported transport error: {}",
                message.as_deref().unwrap_or("unspecified")
            );
            registry.report_transport_error(session_id, sub_id).await;
            return None;
        }
        ClientMessage::Ping => return Some(ServerEvent::Pong),
    };

    result.err().map(|e| ServerEvent::Error {
        code: e.code().to_string(),
        message: e.to_string(),
    })
}
