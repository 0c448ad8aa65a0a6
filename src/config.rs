use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConnectError, Result};

/// Flat proxy kind, as found in stored connection settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    None,
    Socks,
    Http,
}

/// Destination host, either a name still to be resolved or an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetHost {
    Addr(IpAddr),
    Name(String),
}

impl fmt::Display for TargetHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetHost::Addr(IpAddr::V6(ip)) => write!(f, "[{ip}]"),
            TargetHost::Addr(ip) => write!(f, "{ip}"),
            TargetHost::Name(name) => f.write_str(name),
        }
    }
}

/// A `host:port` pair, used both for the tunnel destination and for proxy
/// endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTarget {
    pub host: TargetHost,
    pub port: u16,
}

pub type ProxyEndpoint = ConnectionTarget;

impl ConnectionTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            Ok(ip) => TargetHost::Addr(ip),
            Err(_) => TargetHost::Name(host),
        };
        Self { host, port }
    }

    /// Parses `host:port`, `a.b.c.d:port` or `[v6]:port`.
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or(ConnectError::InvalidTarget("missing port"))?;
        if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
            return Err(ConnectError::InvalidTarget("IPv6 host must be bracketed"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ConnectError::InvalidTarget("port is not a number in 1-65535"))?;
        let target = Self::new(host, port);
        target.validate()?;
        Ok(target)
    }

    pub fn validate(&self) -> Result<()> {
        if let TargetHost::Name(name) = &self.host {
            if name.trim().is_empty() {
                return Err(ConnectError::InvalidTarget("empty host"));
            }
        }
        if self.port == 0 {
            return Err(ConnectError::InvalidTarget("port must be in 1-65535"));
        }
        Ok(())
    }

    /// `host:port` as written in a CONNECT request line or `Host` header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for ConnectionTarget {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: TargetHost::Addr(addr.ip()),
            port: addr.port(),
        }
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Proxy login. The password never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: Option<String>) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Where a proxy lives and how to log in to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub endpoint: ProxyEndpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

/// Outbound proxy selection for a connector
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProxyConfig {
    #[default]
    None,
    Socks(ProxySettings),
    Http(ProxySettings),
}

impl ProxyConfig {
    /// Builds a config from the flat stored form. An empty username counts
    /// as no credentials; the proxy host is ignored for `ProxyKind::None`.
    pub fn from_parts(
        host: &str,
        port: u16,
        kind: ProxyKind,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self> {
        if kind == ProxyKind::None {
            return Ok(ProxyConfig::None);
        }
        let endpoint = ConnectionTarget::new(host, port);
        let credentials = username
            .filter(|u| !u.is_empty())
            .map(|u| Credentials::new(u, password.map(str::to_string)));
        let settings = ProxySettings { endpoint, credentials };
        let config = match kind {
            ProxyKind::Socks => ProxyConfig::Socks(settings),
            _ => ProxyConfig::Http(settings),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parses `http://[user[:pass]@]host:port`, `socks5://...` or `none`.
    /// Userinfo is taken literally; no percent-decoding is applied.
    pub fn parse_url(url: &str) -> Result<Self> {
        let url = url.trim();
        if url.eq_ignore_ascii_case("none") || url.eq_ignore_ascii_case("direct") {
            return Ok(ProxyConfig::None);
        }
        let (scheme, rest) = url
            .split_once("://")
            .ok_or(ConnectError::InvalidProxy("missing scheme"))?;
        let kind = match scheme.to_ascii_lowercase().as_str() {
            "http" => ProxyKind::Http,
            "socks" | "socks5" | "socks5h" => ProxyKind::Socks,
            "none" | "direct" => return Ok(ProxyConfig::None),
            _ => return Err(ConnectError::InvalidProxy("unknown scheme")),
        };
        let rest = rest.trim_end_matches('/');
        let (userinfo, hostport) = match rest.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo), hostport),
            None => (None, rest),
        };
        let (username, password) = match userinfo {
            Some(info) => match info.split_once(':') {
                Some((user, pass)) => (Some(user), Some(pass)),
                None => (Some(info), None),
            },
            None => (None, None),
        };
        let endpoint = ConnectionTarget::parse(hostport)
            .map_err(|_| ConnectError::InvalidProxy("proxy address must be host:port"))?;
        let credentials = username
            .filter(|u| !u.is_empty())
            .map(|u| Credentials::new(u, password.map(str::to_string)));
        let settings = ProxySettings { endpoint, credentials };
        Ok(match kind {
            ProxyKind::Socks => ProxyConfig::Socks(settings),
            _ => ProxyConfig::Http(settings),
        })
    }

    pub fn kind(&self) -> ProxyKind {
        match self {
            ProxyConfig::None => ProxyKind::None,
            ProxyConfig::Socks(_) => ProxyKind::Socks,
            ProxyConfig::Http(_) => ProxyKind::Http,
        }
    }

    pub fn settings(&self) -> Option<&ProxySettings> {
        match self {
            ProxyConfig::None => None,
            ProxyConfig::Socks(s) | ProxyConfig::Http(s) => Some(s),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(settings) = self.settings() {
            settings
                .endpoint
                .validate()
                .map_err(|_| ConnectError::InvalidProxy("proxy needs a host and a port in 1-65535"))?;
        }
        Ok(())
    }
}

/// Connector behaviour knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Bound on the TCP connect and on each handshake read/write.
    #[serde(default)]
    pub handshake_timeout: Option<Duration>,
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
}

fn default_nodelay() -> bool {
    true
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: None,
            nodelay: default_nodelay(),
        }
    }
}
