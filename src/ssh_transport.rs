use std::net::TcpStream;
use std::time::Duration;

use ssh2::{HostKeyType, Session};
use tracing::debug;

#[derive(Debug)]
pub enum SshError {
    Session(ssh2::Error),
}

impl std::fmt::Display for SshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SshError::Session(e) => write!(f, "SSH handshake failed: {e}"),
        }
    }
}

impl std::error::Error for SshError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SshError::Session(e) => Some(e),
        }
    }
}

impl From<ssh2::Error> for SshError {
    fn from(e: ssh2::Error) -> Self {
        SshError::Session(e)
    }
}

/// SSH session running over a stream produced by the connector
pub struct SshTransport {
    session: Session,
}

impl SshTransport {
    /// Takes ownership of the (possibly tunneled) stream and runs the SSH
    /// key exchange over it. Authentication is left to the caller.
    pub fn handshake(stream: TcpStream, timeout: Option<Duration>) -> Result<Self, SshError> {
        let mut session = Session::new()?;
        if let Some(timeout) = timeout {
            session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        }
        session.set_tcp_stream(stream);
        session.handshake()?;
        debug!(banner = session.banner().unwrap_or(""), "SSH handshake complete");
        Ok(Self { session })
    }

    pub fn banner(&self) -> Option<&str> {
        self.session.banner()
    }

    pub fn host_key_type(&self) -> Option<HostKeyType> {
        self.session.host_key().map(|(_, kind)| kind)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn non_ssh_peer_fails_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let _ = s.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n");
        });

        let stream = TcpStream::connect(addr).unwrap();
        let result = SshTransport::handshake(stream, Some(Duration::from_secs(5)));
        assert!(matches!(result, Err(SshError::Session(_))));
        server.join().unwrap();
    }
}
