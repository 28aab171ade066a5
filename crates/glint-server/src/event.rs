//! Handlers for decoded client events, run inside the hub task.
//!
//! Returning an error disconnects the sender; the error text becomes the
//! close reason, so every message here is written for the client.

use glint_common::protocol::{Create, Incoming, Join, Outgoing};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::client::{send_or_drop, ClientInfo, WsWrite};
use crate::hub::Hub;
use crate::names;
use crate::room::{Room, SessionContext, User};

#[derive(Debug, Error)]
pub enum EventError {
    #[error("cannot join room, you are already in one")]
    AlreadyInRoom,
    #[error("room with id {0} does not exist")]
    RoomNotFound(String),
    #[error("room with id {0} already exists")]
    RoomExists(String),
    #[error("not connected")]
    NotConnected,
    #[error("not in a room")]
    NotInRoom,
    #[error("room {0} no longer exists")]
    RoomGone(String),
    #[error("permission denied for session {0}")]
    PermissionDenied(Uuid),
    #[error("{0}")]
    Provider(String),
}

enum Role {
    Host,
    Client,
}

pub(crate) async fn dispatch(
    hub: &mut Hub,
    info: &ClientInfo,
    event: Incoming,
) -> Result<(), EventError> {
    match event {
        Incoming::Create(payload) => create(hub, info, payload).await,
        Incoming::Join(payload) => join(hub, info, payload).await,
        Incoming::StartShare => start_share(hub, info).await,
        Incoming::StopShare => stop_share(hub, info).await,
        Incoming::HostOffer(sdp) => {
            relay(hub, info, sdp.sid, Role::Host, Outgoing::HostOffer(sdp)).await
        }
        Incoming::HostIce(ice) => {
            relay(hub, info, ice.sid, Role::Host, Outgoing::HostIce(ice)).await
        }
        Incoming::ClientAnswer(sdp) => {
            relay(hub, info, sdp.sid, Role::Client, Outgoing::ClientAnswer(sdp)).await
        }
        Incoming::ClientIce(ice) => {
            relay(hub, info, ice.sid, Role::Client, Outgoing::ClientIce(ice)).await
        }
    }
}

/// `create`: open a room and enter it as owner. With `joinIfExist` an
/// existing room is joined instead of rejected.
async fn create(hub: &mut Hub, info: &ClientInfo, payload: Create) -> Result<(), EventError> {
    ensure_roomless(hub, info)?;
    if hub.rooms.contains_key(&payload.id) {
        if payload.join_if_exist {
            return join(
                hub,
                info,
                Join {
                    id: payload.id,
                    username: payload.username,
                },
            )
            .await;
        }
        return Err(EventError::RoomExists(payload.id));
    }

    let mut room = Room::new(
        payload.id.clone(),
        payload.mode,
        payload
            .close_on_owner_leave
            .unwrap_or(hub.config.close_room_when_owner_leaves),
    );
    let name = display_name(info, payload.username);
    room.users.insert(
        info.id,
        User {
            info: info.clone(),
            name,
            streaming: false,
            owner: true,
        },
    );
    room.notify_info_changed().await;
    debug!(room = %payload.id, owner = %info.id, mode = ?payload.mode, "room created");
    hub.rooms.insert(payload.id.clone(), room);
    hub.connected.insert(info.id, Some(payload.id));
    Ok(())
}

/// `join`: enter an existing room. Members already sharing immediately
/// get a session with the newcomer.
async fn join(hub: &mut Hub, info: &ClientInfo, payload: Join) -> Result<(), EventError> {
    ensure_roomless(hub, info)?;
    let issuer = hub.issuer.clone();
    let turn_port = hub.config.turn_port();
    let provider = hub.provider.clone();

    let room = hub
        .rooms
        .get_mut(&payload.id)
        .ok_or_else(|| EventError::RoomNotFound(payload.id.clone()))?;

    let name = display_name(info, payload.username);
    room.users.insert(
        info.id,
        User {
            info: info.clone(),
            name,
            streaming: false,
            owner: false,
        },
    );
    // record membership before anything fallible so a failed join still
    // cleans up through the normal disconnect path
    hub.connected.insert(info.id, Some(payload.id.clone()));
    room.notify_info_changed().await;

    let sharing: Vec<Uuid> = room
        .users
        .values()
        .filter(|u| u.streaming)
        .map(|u| u.info.id)
        .collect();
    if !sharing.is_empty() {
        let ips = provider
            .get()
            .map_err(|err| EventError::Provider(err.to_string()))?;
        let ctx = SessionContext {
            issuer: issuer.as_ref(),
            ips,
            turn_port,
        };
        for host in sharing {
            room.new_session(host, info.id, &ctx).await;
        }
    }
    Ok(())
}

/// `share`: mark the member as sharing and open a session with every
/// other member.
async fn start_share(hub: &mut Hub, info: &ClientInfo) -> Result<(), EventError> {
    let issuer = hub.issuer.clone();
    let turn_port = hub.config.turn_port();
    let provider = hub.provider.clone();

    let room = current_room(hub, info)?;
    let user = room.users.get_mut(&info.id).ok_or(EventError::NotInRoom)?;
    if user.streaming {
        return Ok(());
    }
    user.streaming = true;
    room.notify_info_changed().await;

    let viewers: Vec<Uuid> = room
        .users
        .values()
        .filter(|u| u.info.id != info.id)
        .map(|u| u.info.id)
        .collect();
    if !viewers.is_empty() {
        let ips = provider
            .get()
            .map_err(|err| EventError::Provider(err.to_string()))?;
        let ctx = SessionContext {
            issuer: issuer.as_ref(),
            ips,
            turn_port,
        };
        for viewer in viewers {
            room.new_session(info.id, viewer, &ctx).await;
        }
    }
    Ok(())
}

/// `stopshare`: end every session the member is sharing in.
async fn stop_share(hub: &mut Hub, info: &ClientInfo) -> Result<(), EventError> {
    let issuer = hub.issuer.clone();
    let room = current_room(hub, info)?;
    let user = room.users.get_mut(&info.id).ok_or(EventError::NotInRoom)?;
    if !user.streaming {
        return Ok(());
    }
    user.streaming = false;
    // viewers learn their session ended before the membership snapshot
    room.end_sessions_hosted_by(info.id, issuer.as_ref()).await;
    room.notify_info_changed().await;
    Ok(())
}

/// Forward an SDP or ICE payload to the other party of the session,
/// after checking the sender actually holds the claimed role in it.
async fn relay(
    hub: &mut Hub,
    info: &ClientInfo,
    sid: Uuid,
    role: Role,
    msg: Outgoing,
) -> Result<(), EventError> {
    let room = current_room(hub, info)?;
    let Some(session) = room.sessions.get(&sid) else {
        // the session may have ended while this frame was in flight
        debug!(id = %info.id, session = %sid, "message for unknown session dropped");
        return Ok(());
    };
    let (expected, target) = match role {
        Role::Host => (session.host, session.client),
        Role::Client => (session.client, session.host),
    };
    if expected != info.id {
        return Err(EventError::PermissionDenied(sid));
    }
    if let Some(peer) = room.users.get(&target) {
        send_or_drop(&peer.info.write, WsWrite::Message(msg), target).await;
    }
    Ok(())
}

fn ensure_roomless(hub: &Hub, info: &ClientInfo) -> Result<(), EventError> {
    match hub.connected.get(&info.id) {
        None => Err(EventError::NotConnected),
        Some(Some(_)) => Err(EventError::AlreadyInRoom),
        Some(None) => Ok(()),
    }
}

fn current_room<'h>(hub: &'h mut Hub, info: &ClientInfo) -> Result<&'h mut Room, EventError> {
    let room_id = hub
        .connected
        .get(&info.id)
        .ok_or(EventError::NotConnected)?
        .as_ref()
        .ok_or(EventError::NotInRoom)?
        .clone();
    // a membership record pointing at a vanished room is an internal
    // consistency failure, reported separately from "not in a room"
    hub.rooms
        .get_mut(&room_id)
        .ok_or(EventError::RoomGone(room_id))
}

/// Authenticated name wins, then the client's chosen name, then a
/// generated one.
fn display_name(info: &ClientInfo, requested: Option<String>) -> String {
    info.authenticated_user
        .clone()
        .or(requested)
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(names::random_user_name)
}
