//! Session-id to socket registry with insert-replace semantics: registering
//! over a live socket asks it to close, waits out a short grace budget, and
//! terminates the transport if the close never lands.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

/// Budget a replaced socket gets to close gracefully.
pub const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_millis(1500);

#[async_trait]
pub trait RegisteredSocket: Send + Sync {
    /// Request a graceful close.
    async fn close(&self);
    /// Tear the underlying transport down immediately.
    async fn terminate(&self);
    /// Resolve once the socket has fully closed.
    async fn wait_closed(&self);
    /// Detach event listeners; called on the socket being replaced.
    fn clear_listeners(&self);
}

#[derive(Default)]
pub struct SocketRegistry {
    sockets: DashMap<String, Arc<dyn RegisteredSocket>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `socket` under `session_id`. The map points at the new
    /// socket before the old one is dealt with, so concurrent lookups never
    /// observe the closing socket.
    pub async fn register(
        &self,
        session_id: &str,
        socket: Arc<dyn RegisteredSocket>,
    ) -> Arc<dyn RegisteredSocket> {
        let previous = self.sockets.insert(session_id.to_string(), socket.clone());

        if let Some(old) = previous {
            log::info!("replacing existing socket for session '{session_id}'");
            old.clear_listeners();
            old.close().await;
            if tokio::time::timeout(GRACEFUL_CLOSE_TIMEOUT, old.wait_closed())
                .await
                .is_err()
            {
                log::warn!(
                    "socket for session '{session_id}' did not close within {GRACEFUL_CLOSE_TIMEOUT:?}, terminating"
                );
                old.terminate().await;
            }
        }
        socket
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<dyn RegisteredSocket>> {
        self.sockets.get(session_id).map(|entry| entry.value().clone())
    }

    /// Remove the entry for `session_id` if it still points at `socket`.
    /// Sockets call this from their close path so a replaced socket cannot
    /// deregister its successor.
    pub fn deregister_if_current(
        &self,
        session_id: &str,
        socket: &Arc<dyn RegisteredSocket>,
    ) -> bool {
        self.sockets
            .remove_if(session_id, |_, current| Arc::ptr_eq(current, socket))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}
