//! TURN credential issuing, in two flavors: a co-located relay hosted by
//! this process, or an externally operated relay fed with self-expiring
//! signed credentials.
//!
//! Credentials are scoped to one side of one session (`<sid>host` /
//! `<sid>client`) and revoked when the session closes. The co-located
//! relay's lookup table is the only state shared across execution contexts
//! outside the hub, guarded by a readers/writer lock.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use glint_common::{Error, Result};
use hmac::{Hmac, Mac};
use ipnet::IpNet;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha1::Sha1;
use tokio::net::UdpSocket;
use tracing::{debug, info};
use turn::auth::{generate_auth_key, AuthHandler};
use turn::relay::relay_none::RelayAddressGeneratorNone;
use turn::relay::relay_range::RelayAddressGeneratorRanges;
use turn::relay::RelayAddressGenerator;
use turn::server::config::{ConnConfig, ServerConfig};
use turn::server::Server;
use util::vnet::net::Net;
use util::Conn;

use crate::config::{Config, IpProvider};

/// Authentication realm of the co-located relay.
pub const REALM: &str = "glint";

const SECRET_LENGTH: usize = 20;
const EXTERNAL_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Mints and revokes per-session TURN credentials.
pub trait CredentialIssuer: Send + Sync {
    /// Issue a `(username, secret)` pair for `id`, bound to the requesting
    /// party's address.
    fn issue(&self, id: &str, addr: IpAddr) -> (String, String);

    /// Drop the credential. A no-op for self-expiring external credentials.
    fn revoke(&self, username: &str);
}

/// The relay subsystem: an issuer plus, in co-located mode, the TURN
/// server kept alive for the process lifetime.
pub struct Relay {
    issuer: Arc<dyn CredentialIssuer>,
    _server: Option<Server>,
}

impl Relay {
    pub fn issuer(&self) -> Arc<dyn CredentialIssuer> {
        self.issuer.clone()
    }
}

/// Start the relay subsystem according to configuration.
///
/// Bind failures and a missing public address are startup-fatal.
pub async fn start(config: &Config, provider: Arc<dyn IpProvider>) -> Result<Relay> {
    if config.turn_external {
        if config.turn_external_secret.is_empty() {
            return Err(Error::config("external TURN relay requires a shared secret"));
        }
        info!("using external TURN relay");
        return Ok(Relay {
            issuer: Arc::new(ExternalIssuer::new(config.turn_external_secret.as_bytes())),
            _server: None,
        });
    }

    let issuer = Arc::new(InternalIssuer::new(REALM, config.turn_deny_peers.clone()));

    let conn = UdpSocket::bind(config.turn_address).await.map_err(|err| {
        Error::relay(format!(
            "udp: could not listen on {}: {err}",
            config.turn_address
        ))
    })?;

    let generator = PublicAddressRewriter {
        inner: allocation_generator(config),
        provider,
    };

    let server = Server::new(ServerConfig {
        conn_configs: vec![ConnConfig {
            conn: Arc::new(conn),
            relay_addr_generator: Box::new(generator),
        }],
        realm: REALM.to_owned(),
        auth_handler: issuer.clone(),
        channel_bind_timeout: Duration::from_secs(0),
        alloc_close_notify: None,
    })
    .await
    .map_err(Error::relay)?;

    info!(addr = %config.turn_address, "TURN/STUN relay listening");
    Ok(Relay {
        issuer,
        _server: Some(server),
    })
}

fn allocation_generator(config: &Config) -> Box<dyn RelayAddressGenerator + Send + Sync> {
    let net = Arc::new(Net::new(None));
    let address = config.turn_address.ip().to_string();
    match config.turn_port_range {
        Some((min_port, max_port)) => {
            debug!(min_port, max_port, "using relay port range");
            Box::new(RelayAddressGeneratorRanges {
                relay_address: config.turn_address.ip(),
                min_port,
                max_port,
                max_retries: 10,
                address,
                net,
            })
        }
        None => Box::new(RelayAddressGeneratorNone { address, net }),
    }
}

/// Rewrites allocated relay addresses to the configured public address.
///
/// The relay process may sit behind NAT or inside a container whose local
/// address is not what peers can reach; clients must be told the public
/// one. IPv4 is preferred for IPv4 allocations when both are configured.
struct PublicAddressRewriter {
    inner: Box<dyn RelayAddressGenerator + Send + Sync>,
    provider: Arc<dyn IpProvider>,
}

#[async_trait]
impl RelayAddressGenerator for PublicAddressRewriter {
    fn validate(&self) -> std::result::Result<(), turn::Error> {
        self.inner.validate()
    }

    async fn allocate_conn(
        &self,
        use_ipv4: bool,
        requested_port: u16,
    ) -> std::result::Result<(Arc<dyn Conn + Send + Sync>, SocketAddr), turn::Error> {
        let (conn, mut relay_addr) = self.inner.allocate_conn(use_ipv4, requested_port).await?;
        let ips = self
            .provider
            .get()
            .map_err(|err| turn::Error::Other(err.to_string()))?;
        let public = match (ips.v4, ips.v6) {
            (Some(v4), None) => IpAddr::V4(v4),
            (None, Some(v6)) => IpAddr::V6(v6),
            (Some(v4), Some(v6)) => {
                if relay_addr.is_ipv4() {
                    IpAddr::V4(v4)
                } else {
                    IpAddr::V6(v6)
                }
            }
            (None, None) => {
                return Err(turn::Error::Other(
                    "no public address available for relay allocation".to_owned(),
                ))
            }
        };
        debug!(allocated = %relay_addr, public = %public, "TURN allocation rewritten");
        relay_addr.set_ip(public);
        Ok((conn, relay_addr))
    }
}

struct Entry {
    addr: IpAddr,
    key: Vec<u8>,
}

/// Issuer for the co-located relay: keeps a username → derived-key table
/// that the relay's authentication callback resolves against.
pub struct InternalIssuer {
    realm: String,
    deny: Vec<IpNet>,
    lookup: RwLock<HashMap<String, Entry>>,
}

impl InternalIssuer {
    pub fn new(realm: impl Into<String>, deny: Vec<IpNet>) -> Self {
        Self {
            realm: realm.into(),
            deny,
            lookup: RwLock::new(HashMap::new()),
        }
    }

    fn denied(&self, ip: IpAddr) -> bool {
        self.deny.iter().any(|net| net.contains(&ip))
    }
}

impl CredentialIssuer for InternalIssuer {
    fn issue(&self, id: &str, addr: IpAddr) -> (String, String) {
        let secret: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SECRET_LENGTH)
            .map(char::from)
            .collect();
        let key = generate_auth_key(id, &self.realm, &secret);
        let mut lookup = self.lookup.write().unwrap_or_else(|e| e.into_inner());
        lookup.insert(id.to_owned(), Entry { addr, key });
        (id.to_owned(), secret)
    }

    fn revoke(&self, username: &str) {
        let mut lookup = self.lookup.write().unwrap_or_else(|e| e.into_inner());
        lookup.remove(username);
    }
}

impl AuthHandler for InternalIssuer {
    fn auth_handle(
        &self,
        username: &str,
        realm: &str,
        src_addr: SocketAddr,
    ) -> std::result::Result<Vec<u8>, turn::Error> {
        if self.denied(src_addr.ip()) {
            debug!(username, addr = %src_addr, "TURN client address denied");
            return Err(turn::Error::Other(format!("address {} denied", src_addr.ip())));
        }

        let lookup = self.lookup.read().unwrap_or_else(|e| e.into_inner());
        match lookup.get(username) {
            Some(entry) => {
                if entry.addr != src_addr.ip() {
                    debug!(
                        username,
                        issued = %entry.addr,
                        actual = %src_addr.ip(),
                        "TURN client address changed since credentials were issued"
                    );
                }
                debug!(username, realm, addr = %src_addr, "TURN authenticated");
                Ok(entry.key.clone())
            }
            None => {
                debug!(username, addr = %src_addr, "TURN username not found");
                Err(turn::Error::Other(format!("no such user {username}")))
            }
        }
    }
}

/// Stateless issuer for an externally operated relay.
///
/// The username embeds the expiry (`"<unixExpiry>:<id>"`) and the secret is
/// the keyed hash of that username, the standard ephemeral-TURN-credential
/// convention. There is no revocation channel; credentials simply expire.
pub struct ExternalIssuer {
    secret: Vec<u8>,
    ttl: Duration,
}

impl ExternalIssuer {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
            ttl: EXTERNAL_TTL,
        }
    }
}

impl CredentialIssuer for ExternalIssuer {
    fn issue(&self, id: &str, _addr: IpAddr) -> (String, String) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let username = format!("{}:{}", now + self.ttl.as_secs(), id);
        let password = sign(&self.secret, &username);
        (username, password)
    }

    fn revoke(&self, _username: &str) {
        // external credentials expire on their own
    }
}

/// base64(HMAC-SHA1(username)) with the relay's shared secret.
pub fn sign(secret: &[u8], username: &str) -> String {
    let mut mac =
        Hmac::<Sha1>::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(username.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_addr() -> SocketAddr {
        "198.51.100.7:40000".parse().unwrap()
    }

    #[test]
    fn internal_issue_then_authenticate() {
        let issuer = InternalIssuer::new(REALM, Vec::new());
        let (username, secret) = issuer.issue("abc123host", client_addr().ip());
        assert_eq!(username, "abc123host");
        assert_eq!(secret.len(), SECRET_LENGTH);

        let key = issuer.auth_handle(&username, REALM, client_addr()).unwrap();
        assert_eq!(key, generate_auth_key(&username, REALM, &secret));
    }

    #[test]
    fn internal_revoke_forgets_the_user() {
        let issuer = InternalIssuer::new(REALM, Vec::new());
        let (username, _) = issuer.issue("gone", client_addr().ip());
        issuer.revoke(&username);
        assert!(issuer.auth_handle(&username, REALM, client_addr()).is_err());
    }

    #[test]
    fn internal_credentials_are_distinct_per_party() {
        let issuer = InternalIssuer::new(REALM, Vec::new());
        let (_, host_secret) = issuer.issue("sidhost", client_addr().ip());
        let (_, client_secret) = issuer.issue("sidclient", client_addr().ip());
        assert_ne!(host_secret, client_secret);
    }

    #[test]
    fn internal_denies_listed_networks() {
        let deny = vec!["198.51.100.0/24".parse().unwrap()];
        let issuer = InternalIssuer::new(REALM, deny);
        let (username, _) = issuer.issue("blocked", client_addr().ip());
        assert!(issuer.auth_handle(&username, REALM, client_addr()).is_err());
    }

    #[test]
    fn external_credentials_round_trip() {
        let issuer = ExternalIssuer::new(b"s3cr3t");
        let (username, password) = issuer.issue("abc", client_addr().ip());
        // an independent party holding the same secret derives the same password
        assert_eq!(sign(b"s3cr3t", &username), password);
    }

    #[test]
    fn external_username_embeds_expiry_and_id() {
        let issuer = ExternalIssuer::new(b"s3cr3t");
        let (username, password) = issuer.issue("abc", client_addr().ip());
        let (expiry, id) = username.split_once(':').unwrap();
        assert_eq!(id, "abc");
        let expiry: u64 = expiry.parse().unwrap();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert!(expiry > now, "credential must expire in the future");

        // revocation is a documented no-op; the credential stays verifiable
        issuer.revoke(&username);
        assert_eq!(sign(b"s3cr3t", &username), password);
    }
}
