use std::{fmt, net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use axum::extract::ws::Message;
use dashmap::DashMap;
use futures_util::{Sink, SinkExt};
use tokio::sync::{Mutex as TokioMutex, MutexGuard};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Write half of a client connection.
pub type ClientSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

/// Represents a connected dashboard client.
#[derive(Clone)]
pub struct Client {
    /// Unique identifier for the client.
    pub id: Uuid,
    /// Socket address of the client, when known.
    pub addr: Option<SocketAddr>,
    /// Serializes writes to the connection.
    sink: Arc<TokioMutex<ClientSink>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish()
    }
}

impl Client {
    /// Creates a new `Client` around the write half of a connection.
    ///
    /// # Arguments
    ///
    /// * `addr` - The socket address of the client.
    /// * `sink` - The sink frames are written to.
    pub fn new<S>(addr: Option<SocketAddr>, sink: S) -> Self
    where
        S: Sink<Message, Error = axum::Error> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            addr,
            sink: Arc::new(TokioMutex::new(Box::pin(sink))),
        }
    }

    /// Sends a message, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Timeout` if the write did not complete in time and
    /// `ClientError::SendFailed` if the connection rejected it.
    #[instrument(skip(self, message), fields(client = %self.id))]
    pub async fn send(&self, message: Message, timeout: Duration) -> Result<(), ClientError> {
        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send(message).await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ClientError::SendFailed(e.to_string())),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Sends a close frame and closes the sink, waiting at most `timeout`.
    /// Errors are ignored, the peer may already be gone.
    pub async fn close(&self, timeout: Duration) {
        let close = async {
            let mut sink = self.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
            sink.close().await
        };
        match tokio::time::timeout(timeout, close).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Closing client {} failed: {}", self.id, e),
            Err(_) => debug!("Closing client {} timed out", self.id),
        }
    }

    /// Locks the write half for a sequence of writes that must not interleave
    /// with broadcasts.
    pub(crate) async fn lock_sink(&self) -> MutexGuard<'_, ClientSink> {
        self.sink.lock().await
    }
}

/// Manages multiple client connections.
#[derive(Clone, Default)]
pub struct ClientManager {
    /// A concurrent map storing active clients.
    clients: Arc<DashMap<Uuid, Client>>,
}

impl ClientManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, client: Client) {
        self.clients.insert(client.id, client);
    }

    /// Removes a client by ID, returning it if it was still registered.
    pub fn remove(&self, id: &Uuid) -> Option<Client> {
        self.clients.remove(id).map(|(_, client)| client)
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Copies the current client set so sends happen without holding map locks.
    pub fn snapshot(&self) -> Vec<Client> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// Represents errors that may occur in client operations.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("Failed to send message: {0}")]
    SendFailed(String),
    #[error("Send timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use futures_util::sink;

    use super::*;

    #[tokio::test]
    async fn send_times_out_on_a_stuck_sink() {
        let stuck = sink::unfold((), |_, _msg: Message| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, axum::Error>(())
        });
        let client = Client::new(None, stuck);
        let result = client.send(Message::Text("x".into()), Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ClientError::Timeout)));
    }

    #[tokio::test]
    async fn send_failure_is_reported() {
        let broken = sink::unfold((), |_, _msg: Message| async {
            Err::<(), _>(axum::Error::new(std::io::Error::other("gone")))
        });
        let client = Client::new(None, broken);
        let result = client.send(Message::Text("x".into()), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ClientError::SendFailed(_))));
    }

    #[test]
    fn manager_tracks_clients() {
        let manager = ClientManager::new();
        let client = Client::new(None, sink::drain().sink_map_err(axum::Error::new));
        let id = client.id;
        manager.add(client);
        assert_eq!(manager.count(), 1);
        assert_eq!(manager.snapshot().len(), 1);
        assert!(manager.remove(&id).is_some());
        assert!(manager.remove(&id).is_none());
        assert_eq!(manager.count(), 0);
    }
}
