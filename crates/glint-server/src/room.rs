//! Room membership and screen-share sessions.
//!
//! A room tracks its users and the host/client sessions between them,
//! mints the ICE server entries each party receives, and broadcasts
//! membership snapshots in a stable order.

use std::collections::HashMap;
use std::net::IpAddr;

use glint_common::protocol::{ConnectionMode, IceServer, Outgoing, UserSnapshot};
use tracing::debug;
use uuid::Uuid;

use crate::client::{send_or_drop, ClientInfo, WsWrite, CLOSE_NORMAL_CLOSURE};
use crate::config::IpPair;
use crate::relay::CredentialIssuer;

/// Close reason when the owner leaves a room configured to follow them.
pub const CLOSE_OWNER_LEFT: &str = "Owner Left";
/// Close reason when a room ends because nobody is left in it.
pub const CLOSE_DONE: &str = "Read End";

pub struct User {
    pub info: ClientInfo,
    pub name: String,
    pub streaming: bool,
    pub owner: bool,
}

/// One active screen share between two members.
pub struct RoomSession {
    pub host: Uuid,
    pub client: Uuid,
}

/// What a room needs to mint sessions: the credential issuer plus the
/// advertised relay endpoint.
pub struct SessionContext<'a> {
    pub issuer: &'a dyn CredentialIssuer,
    pub ips: IpPair,
    pub turn_port: u16,
}

pub struct Room {
    pub id: String,
    pub mode: ConnectionMode,
    pub close_on_owner_leave: bool,
    pub users: HashMap<Uuid, User>,
    pub sessions: HashMap<Uuid, RoomSession>,
}

/// TURN username for the sharing side of a session.
pub fn host_username(sid: Uuid) -> String {
    format!("{sid}host")
}

/// TURN username for the viewing side of a session.
pub fn client_username(sid: Uuid) -> String {
    format!("{sid}client")
}

impl Room {
    pub fn new(id: String, mode: ConnectionMode, close_on_owner_leave: bool) -> Self {
        Self {
            id,
            mode,
            close_on_owner_leave,
            users: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    /// Start a session between a sharing member and a viewing member.
    ///
    /// Both parties get a descriptor carrying the same session id but
    /// their own ICE servers; in relayed mode each side holds its own
    /// credential bound to its address.
    pub async fn new_session(&mut self, host: Uuid, client: Uuid, ctx: &SessionContext<'_>) {
        let (host_info, client_info) = match (self.users.get(&host), self.users.get(&client)) {
            (Some(h), Some(c)) => (h.info.clone(), c.info.clone()),
            _ => return,
        };
        let sid = Uuid::new_v4();
        let host_ice = ice_servers(ctx, self.mode, &host_username(sid), host_info.addr);
        let client_ice = ice_servers(ctx, self.mode, &client_username(sid), client_info.addr);
        self.sessions.insert(sid, RoomSession { host, client });
        debug!(room = %self.id, session = %sid, %host, %client, "session created");

        send_or_drop(
            &host_info.write,
            WsWrite::Message(Outgoing::HostSession {
                peer: client,
                id: sid,
                ice_servers: host_ice,
            }),
            host,
        )
        .await;
        send_or_drop(
            &client_info.write,
            WsWrite::Message(Outgoing::ClientSession {
                peer: host,
                id: sid,
                ice_servers: client_ice,
            }),
            client,
        )
        .await;
    }

    /// End every session `user` takes part in, notifying the other party
    /// and revoking both credentials.
    pub async fn end_sessions_of(&mut self, user: Uuid, issuer: &dyn CredentialIssuer) {
        let affected: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.host == user || s.client == user)
            .map(|(sid, _)| *sid)
            .collect();
        for sid in affected {
            self.end_session(sid, Some(user), issuer).await;
        }
    }

    /// End every session `user` is sharing in. Sessions where they are
    /// only a viewer keep running.
    pub async fn end_sessions_hosted_by(&mut self, user: Uuid, issuer: &dyn CredentialIssuer) {
        let affected: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.host == user)
            .map(|(sid, _)| *sid)
            .collect();
        for sid in affected {
            self.end_session(sid, Some(user), issuer).await;
        }
    }

    async fn end_session(&mut self, sid: Uuid, initiator: Option<Uuid>, issuer: &dyn CredentialIssuer) {
        let Some(session) = self.sessions.remove(&sid) else {
            return;
        };
        issuer.revoke(&host_username(sid));
        issuer.revoke(&client_username(sid));
        debug!(room = %self.id, session = %sid, "session ended");
        for party in [session.host, session.client] {
            if Some(party) == initiator {
                continue;
            }
            if let Some(user) = self.users.get(&party) {
                send_or_drop(
                    &user.info.write,
                    WsWrite::Message(Outgoing::EndShare(sid)),
                    party,
                )
                .await;
            }
        }
    }

    /// Push a fresh membership snapshot to every member.
    ///
    /// Order is stable: owner first, then sharing members, then by name.
    /// Each recipient sees `you` set on their own record.
    pub async fn notify_info_changed(&self) {
        let mut order: Vec<&User> = self.users.values().collect();
        order.sort_by(|a, b| {
            b.owner
                .cmp(&a.owner)
                .then(b.streaming.cmp(&a.streaming))
                .then(a.name.cmp(&b.name))
                .then(a.info.id.cmp(&b.info.id))
        });
        for recipient in self.users.values() {
            let users = order
                .iter()
                .map(|u| UserSnapshot {
                    id: u.info.id,
                    name: u.name.clone(),
                    streaming: u.streaming,
                    you: u.info.id == recipient.info.id,
                    owner: u.owner,
                })
                .collect();
            send_or_drop(
                &recipient.info.write,
                WsWrite::Message(Outgoing::RoomInfo {
                    id: self.id.clone(),
                    users,
                }),
                recipient.info.id,
            )
            .await;
        }
    }

    /// Close the room: revoke every session credential, send each member
    /// a close frame, and return the former members.
    pub async fn close(&mut self, reason: &str, issuer: &dyn CredentialIssuer) -> Vec<Uuid> {
        for sid in self.sessions.keys() {
            issuer.revoke(&host_username(*sid));
            issuer.revoke(&client_username(*sid));
        }
        self.sessions.clear();
        for user in self.users.values() {
            send_or_drop(
                &user.info.write,
                WsWrite::Close {
                    code: CLOSE_NORMAL_CLOSURE,
                    reason: reason.to_owned(),
                },
                user.info.id,
            )
            .await;
        }
        self.users.drain().map(|(id, _)| id).collect()
    }
}

fn ice_servers(
    ctx: &SessionContext<'_>,
    mode: ConnectionMode,
    username: &str,
    addr: IpAddr,
) -> Vec<IceServer> {
    match mode {
        ConnectionMode::Local => Vec::new(),
        ConnectionMode::Stun => vec![IceServer {
            urls: ice_urls("stun", false, ctx.ips, ctx.turn_port),
            username: None,
            credential: None,
        }],
        ConnectionMode::Turn => {
            let (username, credential) = ctx.issuer.issue(username, addr);
            vec![IceServer {
                urls: ice_urls("turn", true, ctx.ips, ctx.turn_port),
                username: Some(username),
                credential: Some(credential),
            }]
        }
    }
}

fn ice_urls(scheme: &str, with_tcp: bool, ips: IpPair, port: u16) -> Vec<String> {
    let mut urls = Vec::new();
    let mut push = |host: String| {
        urls.push(format!("{scheme}:{host}:{port}"));
        if with_tcp {
            urls.push(format!("{scheme}:{host}:{port}?transport=tcp"));
        }
    };
    if let Some(v4) = ips.v4 {
        push(v4.to_string());
    }
    if let Some(v6) = ips.v6 {
        push(format!("[{v6}]"));
    }
    urls
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Issuer that hands out predictable credentials and records revocations.
    struct FakeIssuer {
        issued: Mutex<Vec<String>>,
        revoked: Mutex<Vec<String>>,
    }

    impl FakeIssuer {
        fn new() -> Self {
            Self {
                issued: Mutex::new(Vec::new()),
                revoked: Mutex::new(Vec::new()),
            }
        }
    }

    impl CredentialIssuer for FakeIssuer {
        fn issue(&self, id: &str, _addr: IpAddr) -> (String, String) {
            self.issued.lock().unwrap().push(id.to_owned());
            (id.to_owned(), format!("secret-{id}"))
        }

        fn revoke(&self, username: &str) {
            self.revoked.lock().unwrap().push(username.to_owned());
        }
    }

    fn member(name: &str, owner: bool, streaming: bool) -> (User, mpsc::Receiver<WsWrite>) {
        let (tx, rx) = mpsc::channel(8);
        let user = User {
            info: ClientInfo {
                id: Uuid::new_v4(),
                addr: "203.0.113.10".parse().unwrap(),
                authenticated_user: None,
                write: tx,
            },
            name: name.to_owned(),
            streaming,
            owner,
        };
        (user, rx)
    }

    fn ips_v4() -> IpPair {
        IpPair {
            v4: Some("198.51.100.1".parse().unwrap()),
            v6: None,
        }
    }

    #[tokio::test]
    async fn snapshot_order_is_owner_then_streaming_then_name() {
        let mut room = Room::new("r1".into(), ConnectionMode::Local, true);
        let (zoe, _zoe_rx) = member("Zoe", false, true);
        let (amy, mut amy_rx) = member("Amy", false, false);
        let (bob, _bob_rx) = member("Bob", true, false);
        let amy_id = amy.info.id;
        for user in [zoe, amy, bob] {
            room.users.insert(user.info.id, user);
        }

        room.notify_info_changed().await;

        let WsWrite::Message(Outgoing::RoomInfo { id, users }) = amy_rx.recv().await.unwrap()
        else {
            panic!("expected a room snapshot");
        };
        assert_eq!(id, "r1");
        let names: Vec<&str> = users.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, ["Bob", "Zoe", "Amy"]);
        // only the recipient's own record carries `you`
        assert!(users.iter().all(|u| u.you == (u.id == amy_id)));
    }

    #[tokio::test]
    async fn new_session_hands_each_party_its_own_credential() {
        let issuer = FakeIssuer::new();
        let mut room = Room::new("r1".into(), ConnectionMode::Turn, true);
        let (host, mut host_rx) = member("Host", true, true);
        let (viewer, mut viewer_rx) = member("Viewer", false, false);
        let (host_id, viewer_id) = (host.info.id, viewer.info.id);
        room.users.insert(host_id, host);
        room.users.insert(viewer_id, viewer);

        let ctx = SessionContext {
            issuer: &issuer,
            ips: ips_v4(),
            turn_port: 3478,
        };
        room.new_session(host_id, viewer_id, &ctx).await;

        let WsWrite::Message(Outgoing::HostSession { peer, id: sid, ice_servers }) =
            host_rx.recv().await.unwrap()
        else {
            panic!("expected a host session descriptor");
        };
        assert_eq!(peer, viewer_id);
        assert_eq!(ice_servers[0].username.as_deref(), Some(host_username(sid).as_str()));
        assert_eq!(
            ice_servers[0].urls,
            vec![
                "turn:198.51.100.1:3478".to_string(),
                "turn:198.51.100.1:3478?transport=tcp".to_string(),
            ]
        );

        let WsWrite::Message(Outgoing::ClientSession { peer, id, ice_servers }) =
            viewer_rx.recv().await.unwrap()
        else {
            panic!("expected a client session descriptor");
        };
        assert_eq!(peer, host_id);
        assert_eq!(id, sid);
        assert_eq!(
            ice_servers[0].username.as_deref(),
            Some(client_username(sid).as_str())
        );

        let issued = issuer.issued.lock().unwrap();
        assert_eq!(issued.len(), 2);
        assert_ne!(issued[0], issued[1]);
    }

    #[tokio::test]
    async fn ending_sessions_notifies_the_other_party_and_revokes() {
        let issuer = FakeIssuer::new();
        let mut room = Room::new("r1".into(), ConnectionMode::Local, true);
        let (host, _host_rx) = member("Host", true, true);
        let (viewer, mut viewer_rx) = member("Viewer", false, false);
        let (host_id, viewer_id) = (host.info.id, viewer.info.id);
        room.users.insert(host_id, host);
        room.users.insert(viewer_id, viewer);
        let sid = Uuid::new_v4();
        room.sessions.insert(
            sid,
            RoomSession {
                host: host_id,
                client: viewer_id,
            },
        );

        room.end_sessions_hosted_by(host_id, &issuer).await;

        assert!(room.sessions.is_empty());
        assert!(matches!(
            viewer_rx.recv().await.unwrap(),
            WsWrite::Message(Outgoing::EndShare(id)) if id == sid
        ));
        let revoked = issuer.revoked.lock().unwrap();
        assert!(revoked.contains(&host_username(sid)));
        assert!(revoked.contains(&client_username(sid)));
    }

    #[tokio::test]
    async fn close_sends_the_reason_to_every_member() {
        let issuer = FakeIssuer::new();
        let mut room = Room::new("r1".into(), ConnectionMode::Local, true);
        let (a, mut a_rx) = member("A", true, false);
        let (b, mut b_rx) = member("B", false, false);
        room.users.insert(a.info.id, a);
        room.users.insert(b.info.id, b);

        let members = room.close(CLOSE_OWNER_LEFT, &issuer).await;
        assert_eq!(members.len(), 2);
        assert!(room.users.is_empty());
        for rx in [&mut a_rx, &mut b_rx] {
            assert!(matches!(
                rx.recv().await.unwrap(),
                WsWrite::Close { code: CLOSE_NORMAL_CLOSURE, reason } if reason == CLOSE_OWNER_LEFT
            ));
        }
    }

    #[test]
    fn ice_urls_bracket_ipv6() {
        let ips = IpPair {
            v4: Some("198.51.100.1".parse().unwrap()),
            v6: Some(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
        };
        let urls = ice_urls("stun", false, ips, 3478);
        assert_eq!(
            urls,
            vec![
                "stun:198.51.100.1:3478".to_string(),
                "stun:[2001:db8::1]:3478".to_string(),
            ]
        );
    }

    #[test]
    fn local_mode_offers_no_ice_servers() {
        let issuer = FakeIssuer::new();
        let ctx = SessionContext {
            issuer: &issuer,
            ips: ips_v4(),
            turn_port: 3478,
        };
        let servers = ice_servers(&ctx, ConnectionMode::Local, "x", "203.0.113.10".parse().unwrap());
        assert!(servers.is_empty());
        assert!(issuer.issued.lock().unwrap().is_empty());
    }
}
