use std::net::{SocketAddr, TcpStream};

use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::{ConnectionTarget, ConnectorConfig, Credentials, ProxyConfig, ProxyEndpoint};
use crate::dialer::{DialOptions, Dialer, Route, SystemDialer};
use crate::error::{ConnectError, Result};
use crate::handshake::{self, HandshakeState};

/// Produces TCP streams to a target, tunneled through the configured proxy
/// when there is one. Whatever the caller writes to the returned stream
/// reaches the target; the proxy's framing has already been consumed.
///
/// The connector holds no per-connection state, so one instance can serve
/// concurrent callers.
#[derive(Debug, Clone)]
pub struct ProxyAwareConnector<D = SystemDialer> {
    proxy: ProxyConfig,
    config: ConnectorConfig,
    dialer: D,
}

impl ProxyAwareConnector<SystemDialer> {
    pub fn new(proxy: ProxyConfig) -> Self {
        Self::with_config(proxy, ConnectorConfig::default())
    }

    pub fn with_config(proxy: ProxyConfig, config: ConnectorConfig) -> Self {
        Self::with_dialer(proxy, config, SystemDialer)
    }
}

impl<D: Dialer> ProxyAwareConnector<D> {
    pub fn with_dialer(proxy: ProxyConfig, config: ConnectorConfig, dialer: D) -> Self {
        Self { proxy, config, dialer }
    }

    pub fn proxy(&self) -> &ProxyConfig {
        &self.proxy
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Opens a connection to `target`, binding the local end to `local_bind`
    /// first when given. Blocks for the connect plus, on the authenticated
    /// HTTP path, one CONNECT round trip. Never retries.
    pub fn connect(&self, target: &ConnectionTarget, local_bind: Option<SocketAddr>) -> Result<TcpStream> {
        self.establish(target, local_bind, None)
    }

    /// Like [`connect`](Self::connect), but gives up with
    /// [`ConnectError::Cancelled`] once `cancel` fires.
    pub fn connect_with_cancel(
        &self,
        target: &ConnectionTarget,
        local_bind: Option<SocketAddr>,
        cancel: &CancelToken,
    ) -> Result<TcpStream> {
        self.establish(target, local_bind, Some(cancel))
    }

    fn establish(
        &self,
        target: &ConnectionTarget,
        local_bind: Option<SocketAddr>,
        cancel: Option<&CancelToken>,
    ) -> Result<TcpStream> {
        target.validate()?;
        self.proxy.validate()?;
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(ConnectError::Cancelled);
        }

        let opts = DialOptions {
            local_bind,
            timeout: self.config.handshake_timeout,
            nodelay: self.config.nodelay,
        };
        debug!(dest = %target, proxy = ?self.proxy.kind(), state = ?HandshakeState::Connecting, "connecting");

        let stream = match &self.proxy {
            ProxyConfig::None => self.dialer.dial(target, &opts)?,
            ProxyConfig::Socks(settings) => {
                let route = Route::Socks {
                    proxy: &settings.endpoint,
                    credentials: settings.credentials.as_ref(),
                };
                self.dialer.dial_routed(&route, target, &opts)?
            }
            ProxyConfig::Http(settings) => match &settings.credentials {
                None => {
                    let route = Route::Http { proxy: &settings.endpoint };
                    self.dialer.dial_routed(&route, target, &opts)?
                }
                Some(credentials) => {
                    let stream = self.dialer.dial(&settings.endpoint, &opts)?;
                    self.tunnel(stream, target, &settings.endpoint, credentials, cancel)?
                }
            },
        };

        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(ConnectError::Cancelled);
        }
        Ok(stream)
    }

    fn tunnel(
        &self,
        stream: TcpStream,
        target: &ConnectionTarget,
        proxy: &ProxyEndpoint,
        credentials: &Credentials,
        cancel: Option<&CancelToken>,
    ) -> Result<TcpStream> {
        let registration = match cancel {
            Some(token) => match token.register(&stream) {
                Some(id) => Some((token, id)),
                None => return Err(ConnectError::Cancelled),
            },
            None => None,
        };
        let _registration = scopeguard::guard(registration, |registration| {
            if let Some((token, id)) = registration {
                token.release(id);
            }
        });

        let timeout = self.config.handshake_timeout;
        match handshake::open_tunnel(stream, target, proxy, Some(credentials), timeout) {
            Err(_) if cancel.is_some_and(CancelToken::is_cancelled) => Err(ConnectError::Cancelled),
            other => other,
        }
    }
}
