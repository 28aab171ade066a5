//! One WebSocket connection: a reader, a writer, and an idempotent
//! teardown guard shared between them.
//!
//! The reader enforces a keepalive deadline that any inbound frame
//! refreshes; the writer drains a small outbound queue and pings on a
//! fixed cadence. Whichever half fails first runs [`teardown`], which
//! notifies the hub exactly once.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use glint_common::protocol::{self, Outgoing};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::hub::{ClientEvent, ClientMessage, HubMessage};

/// Per-operation write deadline.
pub const WRITE_WAIT: Duration = Duration::from_secs(2);
/// Read deadline; refreshed by any traffic from the peer.
pub const PONG_WAIT: Duration = Duration::from_secs(20);
/// Ping cadence; must undercut [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(5);

pub const CLOSE_NORMAL_CLOSURE: u16 = 1000;
pub const CLOSE_UNSUPPORTED_DATA: u16 = 1003;

/// Capacity of a client's outbound queue. Deliberately tiny; a consumer
/// that cannot keep up gets messages dropped, not buffered without bound.
pub const OUTBOX_CAPACITY: usize = 1;

/// What the writer half may be asked to put on the wire.
#[derive(Debug, Clone)]
pub enum WsWrite {
    Message(Outgoing),
    Close { code: u16, reason: String },
}

/// Identity of one connection as the hub sees it.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: Uuid,
    pub addr: IpAddr,
    pub authenticated_user: Option<String>,
    pub write: mpsc::Sender<WsWrite>,
}

/// Queue a message for a client, waiting at most [`WRITE_WAIT`].
///
/// A client that cannot drain its queue in time loses the message; the
/// hub must never stall on one slow consumer.
pub async fn send_or_drop(tx: &mpsc::Sender<WsWrite>, msg: WsWrite, id: Uuid) {
    match timeout(WRITE_WAIT, tx.send(msg)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => debug!(%id, "client outbox closed"),
        Err(_) => warn!(%id, "client too slow, dropping message"),
    }
}

/// Drive one accepted connection until either half ends.
pub async fn run(
    socket: WebSocket,
    info: ClientInfo,
    outbox: mpsc::Receiver<WsWrite>,
    hub: mpsc::Sender<HubMessage>,
) {
    let (sink, stream) = socket.split();
    let done = Arc::new(AtomicBool::new(false));
    let writer = tokio::spawn(write_loop(
        sink,
        outbox,
        info.clone(),
        hub.clone(),
        done.clone(),
    ));
    read_loop(stream, &info, &hub, &done).await;
    // The writer exits once it has flushed a close frame or every sender
    // of its queue is gone. Drop ours so teardown can complete.
    drop(info);
    let _ = writer.await;
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    info: &ClientInfo,
    hub: &mpsc::Sender<HubMessage>,
    done: &AtomicBool,
) {
    loop {
        let deadline = Instant::now() + PONG_WAIT;
        let frame = match timeout_at(deadline, stream.next()).await {
            Err(_) => {
                teardown(done, hub, info, CLOSE_NORMAL_CLOSURE, "keepalive timeout", true).await;
                return;
            }
            Ok(None) => {
                teardown(done, hub, info, CLOSE_NORMAL_CLOSURE, "connection closed", true).await;
                return;
            }
            Ok(Some(Err(err))) => {
                let reason = format!("read failed: {err}");
                teardown(done, hub, info, CLOSE_NORMAL_CLOSURE, &reason, true).await;
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => match protocol::decode(&text) {
                Ok(event) => {
                    let msg = HubMessage::Client(ClientMessage {
                        info: info.clone(),
                        skip_connected_check: false,
                        event: ClientEvent::Incoming(event),
                    });
                    if hub.send(msg).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    teardown(done, hub, info, CLOSE_UNSUPPORTED_DATA, &err.to_string(), true)
                        .await;
                    return;
                }
            },
            Message::Binary(_) => {
                teardown(
                    done,
                    hub,
                    info,
                    CLOSE_UNSUPPORTED_DATA,
                    "binary messages are not supported",
                    true,
                )
                .await;
                return;
            }
            Message::Close(frame) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                teardown(done, hub, info, CLOSE_NORMAL_CLOSURE, &reason, true).await;
                return;
            }
            // pings are answered by the transport; pongs refresh the
            // deadline by falling through to the next iteration
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbox: mpsc::Receiver<WsWrite>,
    info: ClientInfo,
    hub: mpsc::Sender<HubMessage>,
    done: Arc<AtomicBool>,
) {
    let mut ping = interval(PING_PERIOD);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            queued = outbox.recv() => match queued {
                Some(WsWrite::Message(msg)) => {
                    let text = match protocol::encode(&msg) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(id = %info.id, %err, "failed to encode outbound message");
                            continue;
                        }
                    };
                    if write(&mut sink, Message::Text(text)).await.is_err() {
                        teardown(&done, &hub, &info, CLOSE_NORMAL_CLOSURE, "write failed", false)
                            .await;
                        return;
                    }
                }
                Some(WsWrite::Close { code, reason }) => {
                    // a queued close means the hub already knows; make the
                    // reader's eventual teardown a graceful no-op
                    done.store(true, Ordering::SeqCst);
                    let frame = Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    }));
                    let _ = write(&mut sink, frame).await;
                    return;
                }
                None => return,
            },
            _ = ping.tick() => {
                if write(&mut sink, Message::Ping(Vec::new())).await.is_err() {
                    teardown(&done, &hub, &info, CLOSE_NORMAL_CLOSURE, "ping failed", false).await;
                    return;
                }
            }
        }
    }
}

async fn write(sink: &mut SplitSink<WebSocket, Message>, msg: Message) -> Result<(), ()> {
    match timeout(WRITE_WAIT, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) | Err(_) => Err(()),
    }
}

/// Tear the connection down exactly once.
///
/// The first caller enqueues an optional close frame for the writer and
/// reports the disconnect to the hub; later callers return immediately.
pub(crate) async fn teardown(
    done: &AtomicBool,
    hub: &mpsc::Sender<HubMessage>,
    info: &ClientInfo,
    code: u16,
    reason: &str,
    send_close: bool,
) {
    if done.swap(true, Ordering::SeqCst) {
        return;
    }
    debug!(id = %info.id, code, reason, "tearing down connection");
    if send_close {
        // best effort; a full queue means the writer is already on its
        // way out and every sender will be dropped shortly
        let _ = info.write.try_send(WsWrite::Close {
            code,
            reason: reason.to_owned(),
        });
    }
    let msg = HubMessage::Client(ClientMessage {
        info: info.clone(),
        skip_connected_check: false,
        event: ClientEvent::Disconnected {
            code,
            reason: reason.to_owned(),
        },
    });
    let _ = hub.send(msg).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_info(write: mpsc::Sender<WsWrite>) -> ClientInfo {
        ClientInfo {
            id: Uuid::new_v4(),
            addr: "127.0.0.1".parse().unwrap(),
            authenticated_user: None,
            write,
        }
    }

    #[tokio::test]
    async fn teardown_runs_once() {
        let (write_tx, mut write_rx) = mpsc::channel(4);
        let (hub_tx, mut hub_rx) = mpsc::channel(4);
        let info = test_info(write_tx);
        let done = AtomicBool::new(false);

        teardown(&done, &hub_tx, &info, CLOSE_NORMAL_CLOSURE, "bye", true).await;
        teardown(&done, &hub_tx, &info, CLOSE_UNSUPPORTED_DATA, "again", true).await;

        // one close frame queued for the writer
        assert!(matches!(
            write_rx.try_recv(),
            Ok(WsWrite::Close { code: CLOSE_NORMAL_CLOSURE, .. })
        ));
        assert!(write_rx.try_recv().is_err());

        // one disconnect reported to the hub
        match hub_rx.try_recv() {
            Ok(HubMessage::Client(msg)) => match msg.event {
                ClientEvent::Disconnected { code, reason } => {
                    assert_eq!(code, CLOSE_NORMAL_CLOSURE);
                    assert_eq!(reason, "bye");
                }
                other => panic!("expected disconnect, got {other:?}"),
            },
            other => panic!("expected client message, got {other:?}"),
        }
        assert!(hub_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn send_or_drop_gives_up_on_a_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let id = Uuid::new_v4();
        tx.try_send(WsWrite::Close {
            code: CLOSE_NORMAL_CLOSURE,
            reason: String::new(),
        })
        .unwrap();
        // nobody drains the queue; this must return instead of blocking
        send_or_drop(
            &tx,
            WsWrite::Message(Outgoing::EndShare(Uuid::new_v4())),
            id,
        )
        .await;
    }
}
