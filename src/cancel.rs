use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    in_flight: Mutex<Vec<(u64, TcpStream)>>,
}

/// Aborts a blocked `connect_with_cancel` from another thread.
///
/// The connector registers a duplicate handle of its socket here while the
/// handshake runs; `cancel` shuts down every registered socket so the
/// blocked reads and writes return. One token may cover several concurrent
/// connects.
#[derive(Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        if let Ok(mut in_flight) = self.state.in_flight.lock() {
            for (id, stream) in in_flight.drain(..) {
                debug!(registration = id, "cancelling in-flight proxy handshake");
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the registration id to hand back to `release`, or `None`
    /// when the token was already cancelled; the caller must then give up
    /// on the socket.
    pub(crate) fn register(&self, stream: &TcpStream) -> Option<u64> {
        let Ok(mut in_flight) = self.state.in_flight.lock() else {
            return None;
        };
        if self.is_cancelled() {
            return None;
        }
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(handle) = stream.try_clone() {
            in_flight.push((id, handle));
        }
        Some(id)
    }

    pub(crate) fn release(&self, id: u64) {
        if let Ok(mut in_flight) = self.state.in_flight.lock() {
            in_flight.retain(|(registered, _)| *registered != id);
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
