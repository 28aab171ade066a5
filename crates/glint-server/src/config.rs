//! Environment-driven server configuration.
//!
//! The rest of the server only ever sees an immutable [`Config`] snapshot;
//! nothing re-reads the environment after startup.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use glint_common::{Error, Result};
use ipnet::IpNet;

/// The server's externally reachable addresses, as advertised in ICE URLs
/// and in rewritten relay allocations.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpPair {
    pub v4: Option<Ipv4Addr>,
    pub v6: Option<Ipv6Addr>,
}

/// Source of the server's public addresses.
///
/// Kept behind a trait so a DNS-backed resolver can slot in without the hub
/// or the relay caring.
pub trait IpProvider: Send + Sync {
    fn get(&self) -> Result<IpPair>;
}

/// Fixed addresses taken from configuration.
pub struct StaticIpProvider {
    pair: IpPair,
}

impl StaticIpProvider {
    pub fn new(v4: Option<Ipv4Addr>, v6: Option<Ipv6Addr>) -> Self {
        Self {
            pair: IpPair { v4, v6 },
        }
    }
}

impl IpProvider for StaticIpProvider {
    fn get(&self) -> Result<IpPair> {
        if self.pair.v4.is_none() && self.pair.v6.is_none() {
            return Err(Error::config(
                "no public IP configured; set GLINT_PUBLIC_IPV4 and/or GLINT_PUBLIC_IPV6",
            ));
        }
        Ok(self.pair)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP + WebSocket listen address.
    pub server_address: SocketAddr,
    /// TURN listen address; its port is also the advertised ICE port.
    pub turn_address: SocketAddr,
    /// Relay allocation port range, `min:max`.
    pub turn_port_range: Option<(u16, u16)>,
    /// Use an externally operated TURN relay instead of the co-located one.
    pub turn_external: bool,
    /// Shared secret for the external relay's ephemeral credentials.
    pub turn_external_secret: String,
    /// Source networks refused by the co-located relay.
    pub turn_deny_peers: Vec<IpNet>,
    pub public_ipv4: Option<Ipv4Addr>,
    pub public_ipv6: Option<Ipv6Addr>,
    /// Default for rooms that do not choose explicitly on `create`.
    pub close_room_when_owner_leaves: bool,
    /// Honor `X-Real-IP` when resolving client addresses.
    pub trust_proxy_headers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1:5050".parse().expect("static address"),
            turn_address: "0.0.0.0:3478".parse().expect("static address"),
            turn_port_range: None,
            turn_external: false,
            turn_external_secret: String::new(),
            turn_deny_peers: Vec::new(),
            public_ipv4: None,
            public_ipv6: None,
            close_room_when_owner_leaves: true,
            trust_proxy_headers: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let defaults = Config::default();

        let server_address = env_parse("GLINT_SERVER_ADDRESS", defaults.server_address)?;
        let turn_address = env_parse("GLINT_TURN_ADDRESS", defaults.turn_address)?;
        let turn_port_range = match std::env::var("GLINT_TURN_PORT_RANGE") {
            Ok(raw) if !raw.trim().is_empty() => Some(parse_port_range(raw.trim())?),
            _ => None,
        };
        let turn_external_secret =
            std::env::var("GLINT_TURN_EXTERNAL_SECRET").unwrap_or_default();
        let turn_deny_peers = parse_deny_peers(
            &std::env::var("GLINT_TURN_DENY_PEERS").unwrap_or_default(),
        )?;
        let public_ipv4 = env_parse_opt("GLINT_PUBLIC_IPV4")?;
        let public_ipv6 = env_parse_opt("GLINT_PUBLIC_IPV6")?;

        Ok(Config {
            server_address,
            turn_address,
            turn_port_range,
            turn_external: !turn_external_secret.is_empty(),
            turn_external_secret,
            turn_deny_peers,
            public_ipv4,
            public_ipv6,
            close_room_when_owner_leaves: env_bool(
                "GLINT_CLOSE_ROOM_WHEN_OWNER_LEAVES",
                defaults.close_room_when_owner_leaves,
            ),
            trust_proxy_headers: env_bool(
                "GLINT_TRUST_PROXY_HEADERS",
                defaults.trust_proxy_headers,
            ),
        })
    }

    /// The port advertised in STUN/TURN URLs.
    pub fn turn_port(&self) -> u16 {
        self.turn_address.port()
    }

    pub fn ip_provider(&self) -> Arc<dyn IpProvider> {
        Arc::new(StaticIpProvider::new(self.public_ipv4, self.public_ipv6))
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("{name} has an invalid value: {raw}"))),
        Err(_) => Ok(default),
    }
}

fn env_parse_opt<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::config(format!("{name} has an invalid value: {raw}"))),
        _ => Ok(None),
    }
}

fn parse_port_range(raw: &str) -> Result<(u16, u16)> {
    let (min, max) = raw
        .split_once(':')
        .ok_or_else(|| Error::config(format!("port range must be min:max, got {raw}")))?;
    let min: u16 = min
        .parse()
        .map_err(|_| Error::config(format!("invalid port range start: {min}")))?;
    let max: u16 = max
        .parse()
        .map_err(|_| Error::config(format!("invalid port range end: {max}")))?;
    if min > max || min == 0 {
        return Err(Error::config(format!("invalid port range {min}:{max}")));
    }
    Ok((min, max))
}

fn parse_deny_peers(raw: &str) -> Result<Vec<IpNet>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse()
                .map_err(|_| Error::config(format!("invalid deny-list network: {part}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_parses() {
        assert_eq!(parse_port_range("50000:55000").unwrap(), (50000, 55000));
        assert!(parse_port_range("55000:50000").is_err());
        assert!(parse_port_range("50000").is_err());
        assert!(parse_port_range("0:10").is_err());
    }

    #[test]
    fn deny_peers_parse() {
        let nets = parse_deny_peers("10.0.0.0/8, 192.168.0.0/16").unwrap();
        assert_eq!(nets.len(), 2);
        assert!(nets[0].contains(&"10.1.2.3".parse::<std::net::IpAddr>().unwrap()));
        assert!(parse_deny_peers("not-a-net").is_err());
        assert!(parse_deny_peers("").unwrap().is_empty());
    }

    #[test]
    fn static_provider_requires_an_address() {
        let empty = StaticIpProvider::new(None, None);
        assert!(empty.get().is_err());

        let v4only = StaticIpProvider::new(Some(Ipv4Addr::new(203, 0, 113, 9)), None);
        let pair = v4only.get().unwrap();
        assert_eq!(pair.v4, Some(Ipv4Addr::new(203, 0, 113, 9)));
        assert!(pair.v6.is_none());
    }
}
