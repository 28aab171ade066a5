//! The signaling wire protocol.
//!
//! Every frame is one JSON envelope `{"type": "<tag>", "payload": ...}`.
//! Inbound envelopes are decoded by [`decode`], which keeps *unknown type*
//! and *malformed payload* apart so the connection layer can report the
//! right close reason. Outbound messages serialize straight into the
//! envelope shape through the adjacently tagged [`Outgoing`] enum.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;
use uuid::Uuid;

/// How peers in a room are expected to reach each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Direct connectivity only, no ICE servers offered.
    Local,
    /// Public STUN URLs, no per-party secrets.
    Stun,
    /// Relayed: each party gets its own ephemeral TURN credential.
    Turn,
}

/// Failure modes of [`decode`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Envelope(String),
    #[error("cannot handle {0}")]
    UnknownType(String),
    #[error("malformed payload: {0}")]
    Payload(String),
}

/// Payload of the `create` event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Create {
    pub id: String,
    pub mode: ConnectionMode,
    #[serde(default)]
    pub close_on_owner_leave: Option<bool>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub join_if_exist: bool,
}

/// Payload of the `join` event.
#[derive(Debug, Clone, Deserialize)]
pub struct Join {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// SDP relay payload (`hostoffer`, `clientanswer`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sid: Uuid,
    pub sdp: serde_json::Value,
}

/// ICE candidate relay payload (`hostice`, `clientice`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub sid: Uuid,
    pub candidate: serde_json::Value,
}

/// Every event a client may send.
#[derive(Debug, Clone)]
pub enum Incoming {
    Create(Create),
    Join(Join),
    StartShare,
    StopShare,
    HostOffer(SessionDescription),
    HostIce(IceCandidate),
    ClientAnswer(SessionDescription),
    ClientIce(IceCandidate),
}

#[derive(Deserialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: String,
    #[serde(borrow, default)]
    payload: Option<&'a RawValue>,
}

fn payload_of<T: DeserializeOwned>(raw: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(raw).map_err(|err| ProtocolError::Payload(err.to_string()))
}

/// Decode one inbound frame into its event.
pub fn decode(text: &str) -> Result<Incoming, ProtocolError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|err| ProtocolError::Envelope(err.to_string()))?;
    // Events without parameters may omit the payload entirely.
    let raw = envelope.payload.map(RawValue::get).unwrap_or("{}");

    let event = match envelope.kind.as_str() {
        "create" => Incoming::Create(payload_of(raw)?),
        "join" => Incoming::Join(payload_of(raw)?),
        "share" => Incoming::StartShare,
        "stopshare" => Incoming::StopShare,
        "hostoffer" => Incoming::HostOffer(payload_of(raw)?),
        "hostice" => Incoming::HostIce(payload_of(raw)?),
        "clientanswer" => Incoming::ClientAnswer(payload_of(raw)?),
        "clientice" => Incoming::ClientIce(payload_of(raw)?),
        other => return Err(ProtocolError::UnknownType(other.to_string())),
    };
    Ok(event)
}

/// One ICE server entry offered to a session party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// One user's record inside a room snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub id: Uuid,
    pub name: String,
    pub streaming: bool,
    pub you: bool,
    pub owner: bool,
}

/// Every message the server may push to a client.
///
/// Serializes directly into the `{type, payload}` envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Outgoing {
    #[serde(rename = "room")]
    RoomInfo { id: String, users: Vec<UserSnapshot> },
    HostSession {
        peer: Uuid,
        id: Uuid,
        #[serde(rename = "iceServers")]
        ice_servers: Vec<IceServer>,
    },
    ClientSession {
        peer: Uuid,
        id: Uuid,
        #[serde(rename = "iceServers")]
        ice_servers: Vec<IceServer>,
    },
    HostOffer(SessionDescription),
    HostIce(IceCandidate),
    ClientAnswer(SessionDescription),
    ClientIce(IceCandidate),
    EndShare(Uuid),
}

impl Outgoing {
    /// The envelope tag this message serializes under.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Outgoing::RoomInfo { .. } => "room",
            Outgoing::HostSession { .. } => "hostsession",
            Outgoing::ClientSession { .. } => "clientsession",
            Outgoing::HostOffer(_) => "hostoffer",
            Outgoing::HostIce(_) => "hostice",
            Outgoing::ClientAnswer(_) => "clientanswer",
            Outgoing::ClientIce(_) => "clientice",
            Outgoing::EndShare(_) => "endshare",
        }
    }
}

/// Serialize one outbound message into its wire envelope.
pub fn encode(msg: &Outgoing) -> serde_json::Result<String> {
    serde_json::to_string(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_join_with_username() {
        let event = decode(r#"{"type":"join","payload":{"id":"r1","username":"bob"}}"#).unwrap();
        match event {
            Incoming::Join(join) => {
                assert_eq!(join.id, "r1");
                assert_eq!(join.username.as_deref(), Some("bob"));
            }
            other => panic!("expected join, got {other:?}"),
        }
    }

    #[test]
    fn decode_share_without_payload() {
        assert!(matches!(
            decode(r#"{"type":"share"}"#).unwrap(),
            Incoming::StartShare
        ));
        assert!(matches!(
            decode(r#"{"type":"stopshare","payload":{}}"#).unwrap(),
            Incoming::StopShare
        ));
    }

    #[test]
    fn decode_unknown_type() {
        let err = decode(r#"{"type":"teleport","payload":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(t) if t == "teleport"));
    }

    #[test]
    fn decode_malformed_payload() {
        // join requires a room id
        let err = decode(r#"{"type":"join","payload":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Payload(_)));
    }

    #[test]
    fn decode_malformed_envelope() {
        let err = decode("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Envelope(_)));
    }

    #[test]
    fn decode_create_defaults() {
        let event =
            decode(r#"{"type":"create","payload":{"id":"r1","mode":"turn"}}"#).unwrap();
        match event {
            Incoming::Create(create) => {
                assert_eq!(create.mode, ConnectionMode::Turn);
                assert_eq!(create.close_on_owner_leave, None);
                assert!(!create.join_if_exist);
            }
            other => panic!("expected create, got {other:?}"),
        }
    }

    #[test]
    fn encode_room_snapshot_envelope() {
        let id = Uuid::new_v4();
        let msg = Outgoing::RoomInfo {
            id: "r1".to_string(),
            users: vec![UserSnapshot {
                id,
                name: "Amy".to_string(),
                streaming: true,
                you: false,
                owner: true,
            }],
        };
        let value: serde_json::Value = serde_json::from_str(&encode(&msg).unwrap()).unwrap();
        assert_eq!(value["type"], "room");
        assert_eq!(value["payload"]["id"], "r1");
        assert_eq!(value["payload"]["users"][0]["name"], "Amy");
        assert_eq!(value["payload"]["users"][0]["owner"], true);
    }

    #[test]
    fn encode_end_share_payload_is_bare_id() {
        let sid = Uuid::new_v4();
        let value: serde_json::Value =
            serde_json::from_str(&encode(&Outgoing::EndShare(sid)).unwrap()).unwrap();
        assert_eq!(value["type"], "endshare");
        assert_eq!(value["payload"], json!(sid.to_string()));
    }

    #[test]
    fn encode_session_descriptor_tags() {
        let msg = Outgoing::HostSession {
            peer: Uuid::new_v4(),
            id: Uuid::new_v4(),
            ice_servers: vec![IceServer {
                urls: vec!["stun:1.2.3.4:3478".to_string()],
                username: None,
                credential: None,
            }],
        };
        assert_eq!(msg.type_tag(), "hostsession");
        let value: serde_json::Value = serde_json::from_str(&encode(&msg).unwrap()).unwrap();
        assert_eq!(value["payload"]["iceServers"][0]["urls"][0], "stun:1.2.3.4:3478");
        // no credential keys for credential-less servers
        assert!(value["payload"]["iceServers"][0].get("username").is_none());
    }

    #[test]
    fn connection_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&ConnectionMode::Turn).unwrap(),
            "\"turn\""
        );
        let mode: ConnectionMode = serde_json::from_str("\"local\"").unwrap();
        assert_eq!(mode, ConnectionMode::Local);
    }
}
