//! The hub actor: single owner of all rooms and connection state.
//!
//! Every connection lifecycle event and every decoded client event is
//! funneled through one channel into one task, so room state never needs
//! a lock. A handler that returns an error disconnects the sender with
//! the error text as the close reason.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use glint_common::protocol::Incoming;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info};
use uuid::Uuid;

use crate::client::{send_or_drop, ClientInfo, WsWrite, CLOSE_NORMAL_CLOSURE};
use crate::config::{Config, IpProvider};
use crate::event;
use crate::relay::CredentialIssuer;
use crate::room::{Room, CLOSE_DONE, CLOSE_OWNER_LEFT};

const INBOX_CAPACITY: usize = 64;
const COUNT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle and protocol events of one connection.
#[derive(Debug)]
pub enum ClientEvent {
    Connected,
    Incoming(Incoming),
    Disconnected { code: u16, reason: String },
}

#[derive(Debug)]
pub struct ClientMessage {
    pub info: ClientInfo,
    /// Set for `Connected`, which arrives before the hub knows the id.
    pub skip_connected_check: bool,
    pub event: ClientEvent,
}

#[derive(Debug)]
pub enum HubMessage {
    Client(ClientMessage),
    RoomCount(oneshot::Sender<usize>),
}

/// Health probe failure: either the hub would not accept the request or
/// it never answered. Both timeouts are independent.
#[derive(Debug, Error)]
pub enum CountError {
    #[error("hub did not accept the request in time")]
    Accept,
    #[error("hub did not reply in time")]
    Reply,
}

/// Cheap clonable handle for talking to the hub from HTTP handlers.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubMessage>,
}

impl HubHandle {
    pub fn sender(&self) -> mpsc::Sender<HubMessage> {
        self.tx.clone()
    }

    /// Number of open rooms, used as a liveness probe of the hub task.
    pub async fn room_count(&self) -> Result<usize, CountError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        timeout(COUNT_TIMEOUT, self.tx.send(HubMessage::RoomCount(reply_tx)))
            .await
            .map_err(|_| CountError::Accept)?
            .map_err(|_| CountError::Accept)?;
        match timeout(COUNT_TIMEOUT, reply_rx).await {
            Ok(Ok(count)) => Ok(count),
            _ => Err(CountError::Reply),
        }
    }
}

pub struct Hub {
    pub(crate) rooms: HashMap<String, Room>,
    /// Every open connection; the value is the room the client is in.
    pub(crate) connected: HashMap<Uuid, Option<String>>,
    pub(crate) config: Config,
    pub(crate) provider: Arc<dyn IpProvider>,
    pub(crate) issuer: Arc<dyn CredentialIssuer>,
    inbox: mpsc::Receiver<HubMessage>,
}

impl Hub {
    pub fn new(
        config: Config,
        provider: Arc<dyn IpProvider>,
        issuer: Arc<dyn CredentialIssuer>,
    ) -> (Hub, HubHandle) {
        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let hub = Hub {
            rooms: HashMap::new(),
            connected: HashMap::new(),
            config,
            provider,
            issuer,
            inbox,
        };
        (hub, HubHandle { tx })
    }

    /// Consume the inbox until every handle is dropped.
    pub async fn run(mut self) {
        while let Some(msg) = self.inbox.recv().await {
            match msg {
                HubMessage::RoomCount(reply) => {
                    let _ = reply.send(self.rooms.len());
                }
                HubMessage::Client(msg) => self.handle_client(msg).await,
            }
        }
    }

    async fn handle_client(&mut self, msg: ClientMessage) {
        // a connection the hub already tore down may still have events in
        // flight; drop them
        if !msg.skip_connected_check && !self.connected.contains_key(&msg.info.id) {
            debug!(id = %msg.info.id, "event from unknown connection ignored");
            return;
        }
        match msg.event {
            ClientEvent::Connected => {
                self.connected.insert(msg.info.id, None);
                debug!(id = %msg.info.id, addr = %msg.info.addr, "client connected");
            }
            ClientEvent::Disconnected { code, reason } => {
                self.disconnected(&msg.info, code, &reason).await;
            }
            ClientEvent::Incoming(event) => {
                if let Err(err) = event::dispatch(self, &msg.info, event).await {
                    debug!(id = %msg.info.id, %err, "event rejected, disconnecting");
                    self.disconnect(&msg.info, &err.to_string()).await;
                }
            }
        }
    }

    /// Server-initiated disconnect: close the socket, then run the same
    /// cleanup as a peer-initiated disconnect.
    pub(crate) async fn disconnect(&mut self, info: &ClientInfo, reason: &str) {
        send_or_drop(
            &info.write,
            WsWrite::Close {
                code: CLOSE_NORMAL_CLOSURE,
                reason: reason.to_owned(),
            },
            info.id,
        )
        .await;
        self.disconnected(info, CLOSE_NORMAL_CLOSURE, reason).await;
    }

    async fn disconnected(&mut self, info: &ClientInfo, code: u16, reason: &str) {
        let Some(room_id) = self.connected.remove(&info.id) else {
            return;
        };
        debug!(id = %info.id, code, reason, "client disconnected");
        let Some(room_id) = room_id else {
            return;
        };

        let close_reason = {
            let Some(room) = self.rooms.get_mut(&room_id) else {
                return;
            };
            let was_owner = room.users.get(&info.id).map(|u| u.owner).unwrap_or(false);
            room.end_sessions_of(info.id, self.issuer.as_ref()).await;
            room.users.remove(&info.id);
            if room.users.is_empty() {
                Some(CLOSE_DONE)
            } else if was_owner && room.close_on_owner_leave {
                Some(CLOSE_OWNER_LEFT)
            } else {
                room.notify_info_changed().await;
                None
            }
        };
        if let Some(reason) = close_reason {
            self.close_room(&room_id, reason).await;
        }
    }

    pub(crate) async fn close_room(&mut self, room_id: &str, reason: &str) {
        if let Some(mut room) = self.rooms.remove(room_id) {
            let members = room.close(reason, self.issuer.as_ref()).await;
            // former members stay connected, just roomless
            for id in members {
                if let Some(entry) = self.connected.get_mut(&id) {
                    *entry = None;
                }
            }
            info!(room = room_id, reason, "room closed");
        }
    }
}
