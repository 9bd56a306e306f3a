//! WebSocket transport.
//!
//! Each upgraded socket is split into a reader task and a writer task.
//! The writer drains an unbounded queue so coordinator writes never block.
//! The reader forwards binary frames to the coordinator and waits while
//! the connection is paused.

use super::{close_codes, next_connection_id, Connection, ConnectionHandle, ConnectionId};
use crate::error::TransportError;
use crate::server::RelayState;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// Abnormal closure, reported when the peer vanished without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug)]
enum Outbound {
    Frame(Vec<u8>),
    Close(u16, String),
}

/// Coordinator-side handle to one WebSocket client.
#[derive(Debug)]
pub struct WsConnection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
    open: AtomicBool,
    paused: AtomicBool,
    resumed: Notify,
}

impl WsConnection {
    async fn wait_until_resumed(&self) {
        while self.paused.load(Ordering::Acquire) {
            self.resumed.notified().await;
        }
    }
}

impl Connection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn close(&self, code: u16, reason: &str) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.outbound.send(Outbound::Close(code, reason.to_string()));
        }
        // Wake a paused reader so it can observe the close
        self.resume();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.resumed.notify_one();
    }
}

/// Drive one upgraded socket until it closes.
///
/// Reports every binary message through [`RelayState::frame`] and the
/// end of the connection, exactly once, through [`RelayState::closed`].
pub async fn serve_socket(socket: WebSocket, state: RelayState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let conn = Arc::new(WsConnection {
        id: next_connection_id(),
        outbound: tx,
        open: AtomicBool::new(true),
        paused: AtomicBool::new(false),
        resumed: Notify::new(),
    });
    let conn_id = conn.id;
    tracing::debug!("WebSocket connection {} opened", conn_id);

    // Write task
    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let result = match out {
                Outbound::Frame(bytes) => sink.send(Message::Binary(bytes)).await,
                Outbound::Close(code, reason) => {
                    let frame = CloseFrame {
                        code,
                        reason: Cow::Owned(reason),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            };
            if let Err(e) = result {
                tracing::debug!("Write to connection {} failed: {}", conn_id, e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let handle: ConnectionHandle = conn.clone();
    let mut close = (ABNORMAL_CLOSURE, String::new());
    let mut closed_by_relay = false;

    // Read loop
    loop {
        conn.wait_until_resumed().await;
        if !conn.is_open() {
            closed_by_relay = true;
            close = (close_codes::NORMAL, "closed by relay".to_string());
            break;
        }

        let Some(next) = stream.next().await else {
            break;
        };
        match next {
            Ok(Message::Binary(bytes)) => {
                if !state.frame(handle.clone(), bytes) {
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                close = match frame {
                    Some(frame) => (frame.code, frame.reason.into_owned()),
                    None => (close_codes::NORMAL, String::new()),
                };
                break;
            }
            Ok(_) => {
                // Text, ping and pong carry no relay frames
            }
            Err(e) => {
                tracing::debug!("Read from connection {} failed: {}", conn_id, e);
                break;
            }
        }
    }

    conn.open.store(false, Ordering::Release);
    if closed_by_relay {
        // The close frame is queued; the writer stops after sending it
        let _ = writer.await;
    } else {
        writer.abort();
    }

    tracing::debug!("WebSocket connection {} closed ({})", conn_id, close.0);
    state.closed(conn_id, close.0, &close.1);
}
