// CONNECT tunnel negotiation with an HTTP proxy.
// Only the status line and headers are consumed; whatever the proxy sends
// after the blank line belongs to the tunneled protocol.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose, Engine as _};
use tracing::{debug, warn};

use crate::config::{ConnectionTarget, Credentials, ProxyEndpoint};
use crate::error::{ConnectError, Result};
use crate::response::{self, ProxyResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Connecting,
    SendingRequest,
    AwaitingStatusLine,
    AwaitingHeaders,
    Tunneled,
    Failed,
}

/// `base64(username ":" password)`, password empty when absent.
pub fn basic_auth_value(credentials: &Credentials) -> String {
    let password = credentials.password.as_deref().unwrap_or("");
    general_purpose::STANDARD.encode(format!("{}:{}", credentials.username, password))
}

/// The request line names the target; `Host` names the proxy being asked.
pub fn build_request(
    target: &ConnectionTarget,
    proxy: &ProxyEndpoint,
    credentials: Option<&Credentials>,
) -> String {
    let mut request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\n",
        target.authority(),
        proxy.authority()
    );
    if let Some(credentials) = credentials {
        request.push_str("Proxy-Authorization: Basic ");
        request.push_str(&basic_auth_value(credentials));
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request
}

/// One CONNECT exchange. A handshake runs at most once; a second `run`
/// is refused.
pub struct TunnelHandshake<'a> {
    target: &'a ConnectionTarget,
    proxy: &'a ProxyEndpoint,
    credentials: Option<&'a Credentials>,
    state: HandshakeState,
}

impl<'a> TunnelHandshake<'a> {
    /// The socket to the proxy is already open, so the handshake starts in
    /// `SendingRequest`.
    pub fn new(
        target: &'a ConnectionTarget,
        proxy: &'a ProxyEndpoint,
        credentials: Option<&'a Credentials>,
    ) -> Self {
        Self {
            target,
            proxy,
            credentials,
            state: HandshakeState::SendingRequest,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn run<S: Read + Write>(&mut self, stream: &mut S) -> Result<ProxyResponse> {
        if self.state != HandshakeState::SendingRequest {
            return Err(ConnectError::Unsupported("handshake already ran"));
        }
        let result = self.exchange(stream);
        if result.is_err() {
            self.enter(HandshakeState::Failed);
        }
        result
    }

    fn exchange<S: Read + Write>(&mut self, stream: &mut S) -> Result<ProxyResponse> {
        let request = build_request(self.target, self.proxy, self.credentials);
        stream
            .write_all(request.as_bytes())
            .and_then(|_| stream.flush())
            .map_err(ConnectError::from_handshake_io)?;

        self.enter(HandshakeState::AwaitingStatusLine);
        let status = response::read_status_line(stream)?;
        if !status.is_success() {
            warn!(dest = %self.target, code = status.code, "proxy refused tunnel");
            return Err(ConnectError::ProxyRejected {
                code: status.code,
                reason: status.reason,
            });
        }

        self.enter(HandshakeState::AwaitingHeaders);
        let headers = response::drain_headers(stream)?;

        self.enter(HandshakeState::Tunneled);
        Ok(ProxyResponse { status, headers })
    }

    fn enter(&mut self, next: HandshakeState) {
        debug!(dest = %self.target, from = ?self.state, to = ?next, "handshake state");
        self.state = next;
    }
}

/// Socket view whose reads and writes share one deadline. Each call gets
/// the time left as its socket timeout, so a peer trickling bytes cannot
/// stretch the exchange past the deadline.
struct DeadlineStream<'a> {
    stream: &'a TcpStream,
    deadline: Option<Instant>,
}

impl DeadlineStream<'_> {
    fn remaining(&self) -> io::Result<Option<Duration>> {
        let Some(deadline) = self.deadline else {
            return Ok(None);
        };
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(io::ErrorKind::TimedOut.into());
        }
        Ok(Some(left))
    }
}

impl Read for DeadlineStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(left) = self.remaining()? {
            self.stream.set_read_timeout(Some(left))?;
        }
        (&*self.stream).read(buf)
    }
}

impl Write for DeadlineStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(left) = self.remaining()? {
            self.stream.set_write_timeout(Some(left))?;
        }
        (&*self.stream).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.stream).flush()
    }
}

/// Runs the CONNECT handshake over an owned socket. `timeout` bounds the
/// whole exchange, not each read. The socket is shut down and dropped on
/// every failure; on success it comes back with its timeouts cleared.
pub(crate) fn open_tunnel(
    stream: TcpStream,
    target: &ConnectionTarget,
    proxy: &ProxyEndpoint,
    credentials: Option<&Credentials>,
    timeout: Option<Duration>,
) -> Result<TcpStream> {
    let stream = scopeguard::guard(stream, |s| {
        let _ = s.shutdown(Shutdown::Both);
    });
    let mut bounded = DeadlineStream {
        stream: &stream,
        deadline: timeout.filter(|t| !t.is_zero()).map(|t| Instant::now() + t),
    };

    let mut handshake = TunnelHandshake::new(target, proxy, credentials);
    let reply = handshake.run(&mut bounded)?;
    debug!(
        dest = %target,
        code = reply.status.code,
        headers = reply.headers.len(),
        authenticated = credentials.is_some(),
        "tunnel established"
    );

    stream.set_read_timeout(None).map_err(ConnectError::Io)?;
    stream.set_write_timeout(None).map_err(ConnectError::Io)?;
    Ok(scopeguard::ScopeGuard::into_inner(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    struct ScriptedProxy {
        reply: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl ScriptedProxy {
        fn new(reply: &[u8]) -> Self {
            Self {
                reply: Cursor::new(reply.to_vec()),
                written: Vec::new(),
            }
        }

        fn remaining(&mut self) -> Vec<u8> {
            let mut rest = Vec::new();
            self.reply.read_to_end(&mut rest).unwrap();
            rest
        }
    }

    impl Read for ScriptedProxy {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reply.read(buf)
        }
    }

    impl Write for ScriptedProxy {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn alice() -> Credentials {
        Credentials::new("alice", Some("s3cret".into()))
    }

    fn proxy_local() -> ProxyEndpoint {
        ConnectionTarget::new("proxy.local", 8080)
    }

    #[test]
    fn request_for_example_scenario() {
        let target = ConnectionTarget::new("example.com", 443);
        let via = proxy_local();
        let request = build_request(&target, &via, Some(&alice()));
        assert_eq!(
            request,
            "CONNECT example.com:443 HTTP/1.1\r\n\
             Host: proxy.local:8080\r\n\
             Proxy-Authorization: Basic YWxpY2U6czNjcmV0\r\n\
             \r\n"
        );
        assert_eq!(general_purpose::STANDARD.encode("alice:s3cret"), "YWxpY2U6czNjcmV0");
    }

    #[test]
    fn auth_value_without_password() {
        let creds = Credentials::new("user", None);
        assert_eq!(basic_auth_value(&creds), general_purpose::STANDARD.encode("user:"));
        let creds = Credentials::new("user", Some("pass".into()));
        assert_eq!(basic_auth_value(&creds), "dXNlcjpwYXNz");
    }

    #[test]
    fn request_without_credentials_has_no_auth_header() {
        let target = ConnectionTarget::new("10.0.0.1", 22);
        let request = build_request(&target, &proxy_local(), None);
        assert_eq!(request, "CONNECT 10.0.0.1:22 HTTP/1.1\r\nHost: proxy.local:8080\r\n\r\n");
    }

    #[test]
    fn success_leaves_tunnel_bytes_unread() {
        let target = ConnectionTarget::new("example.com", 443);
        let via = proxy_local();
        let creds = alice();
        let mut proxy = ScriptedProxy::new(b"HTTP/1.1 200 Connection established\r\nA: 1\r\n\r\nSSH-2.0-x\r\n");
        let mut handshake = TunnelHandshake::new(&target, &via, Some(&creds));

        let reply = handshake.run(&mut proxy).unwrap();
        assert_eq!(handshake.state(), HandshakeState::Tunneled);
        assert_eq!(reply.status.code, 200);
        assert_eq!(reply.headers, vec!["A: 1".to_string()]);
        assert_eq!(proxy.remaining(), b"SSH-2.0-x\r\n");
        assert!(String::from_utf8(proxy.written.clone())
            .unwrap()
            .starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
    }

    #[test]
    fn status_boundaries() {
        let target = ConnectionTarget::new("example.com", 443);
        let via = proxy_local();
        for (code, ok) in [(199, false), (200, true), (299, true), (300, false)] {
            let reply = format!("HTTP/1.1 {code} Whatever\r\n\r\n");
            let mut proxy = ScriptedProxy::new(reply.as_bytes());
            let result = TunnelHandshake::new(&target, &via, None).run(&mut proxy);
            assert_eq!(result.is_ok(), ok, "status {code}");
            if !ok {
                assert_eq!(result.unwrap_err().status_code(), Some(code));
            }
        }
    }

    #[test]
    fn malformed_status_is_rejected_as_400() {
        let target = ConnectionTarget::new("example.com", 443);
        let via = proxy_local();
        for reply in [&b"\r\n\r\n"[..], &b"HTTP/1.1\r\n\r\n"[..]] {
            let mut proxy = ScriptedProxy::new(reply);
            let mut handshake = TunnelHandshake::new(&target, &via, None);
            let err = handshake.run(&mut proxy).unwrap_err();
            assert_eq!(err.status_code(), Some(400));
            assert_eq!(handshake.state(), HandshakeState::Failed);
        }
    }

    #[test]
    fn rejection_does_not_drain_headers() {
        let target = ConnectionTarget::new("example.com", 443);
        let via = proxy_local();
        let mut proxy = ScriptedProxy::new(b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n");
        let err = TunnelHandshake::new(&target, &via, None).run(&mut proxy).unwrap_err();
        match err {
            ConnectError::ProxyRejected { code, reason } => {
                assert_eq!(code, 407);
                assert_eq!(reason, "Proxy Authentication Required");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn eof_before_status_and_mid_headers() {
        let target = ConnectionTarget::new("example.com", 443);
        let via = proxy_local();
        let mut proxy = ScriptedProxy::new(b"");
        let err = TunnelHandshake::new(&target, &via, None).run(&mut proxy).unwrap_err();
        assert!(matches!(err, ConnectError::UnexpectedEof));

        let mut proxy = ScriptedProxy::new(b"HTTP/1.1 200 OK\r\nVia: x\r\n");
        let mut handshake = TunnelHandshake::new(&target, &via, None);
        let err = handshake.run(&mut proxy).unwrap_err();
        assert!(matches!(err, ConnectError::UnexpectedEof));
        assert_eq!(handshake.state(), HandshakeState::Failed);
    }

    #[test]
    fn handshake_runs_once() {
        let target = ConnectionTarget::new("example.com", 443);
        let via = proxy_local();
        let mut proxy = ScriptedProxy::new(b"HTTP/1.1 200 OK\r\n\r\n");
        let mut handshake = TunnelHandshake::new(&target, &via, None);
        handshake.run(&mut proxy).unwrap();
        let written = proxy.written.len();
        assert!(matches!(handshake.run(&mut proxy), Err(ConnectError::Unsupported(_))));
        assert_eq!(proxy.written.len(), written);
    }

    #[test]
    fn spent_deadline_times_out_without_reading() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        server.write_all(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();

        let mut bounded = DeadlineStream {
            stream: &client,
            deadline: Some(Instant::now()),
        };
        let err = response::read_line(&mut bounded).unwrap_err();
        assert!(matches!(err, ConnectError::TimedOut));

        let mut unbounded = DeadlineStream {
            stream: &client,
            deadline: None,
        };
        assert_eq!(response::read_line(&mut unbounded).unwrap(), "HTTP/1.1 200 OK");
    }
}
