//! Fan-out of scale readings to every connected client.

use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::server::{
    client::{Client, ClientManager},
    health::{HealthMetrics, ScaleActivity},
    message::reading_message,
};

/// Capacity of the reader-to-broadcaster queue.
pub const OUTBOUND_CAPACITY: usize = 100;
pub const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Delivers queued readings to the client set.
///
/// Each send runs in its own task and is never awaited by the consume loop.
/// A client whose send fails or exceeds the timeout is removed and closed;
/// the other clients are unaffected.
#[derive(Clone)]
pub struct Broadcaster {
    clients: ClientManager,
    metrics: HealthMetrics,
    activity: Arc<ScaleActivity>,
    send_timeout: Duration,
    sends: TaskTracker,
}

impl Broadcaster {
    pub fn new(metrics: HealthMetrics, activity: Arc<ScaleActivity>, send_timeout: Duration) -> Self {
        Self {
            clients: ClientManager::new(),
            metrics,
            activity,
            send_timeout,
            sends: TaskTracker::new(),
        }
    }

    pub fn add_client(&self, client: Client) {
        self.clients.add(client);
    }

    /// Unregisters a client. Returns whether it was still registered, in
    /// which case the caller owns closing it.
    pub fn remove_client(&self, id: &Uuid) -> bool {
        self.clients.remove(id).is_some()
    }

    pub fn client_count(&self) -> usize {
        self.clients.count()
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Consumes the outbound queue until it closes or `cancel` fires.
    pub async fn run(&self, mut outbound: mpsc::Receiver<String>, cancel: CancellationToken) {
        loop {
            let value = tokio::select! {
                _ = cancel.cancelled() => break,
                value = outbound.recv() => match value {
                    Some(value) => value,
                    None => break,
                },
            };
            self.broadcast(&value);
        }
        self.wait_for_sends().await;
        info!("Broadcaster stopped");
    }

    /// Waits for every send started so far. Each one is bounded by the send
    /// timeout plus the close of a dropped client.
    pub async fn wait_for_sends(&self) {
        self.sends.close();
        self.sends.wait().await;
        self.sends.reopen();
    }

    /// Starts one send per client and returns without waiting for them.
    #[instrument(skip(self))]
    pub fn broadcast(&self, value: &str) {
        self.metrics.readings_broadcast.inc();
        if !value.starts_with("ERR_") {
            self.activity.record();
        }

        let clients = self.clients.snapshot();
        if clients.is_empty() {
            return;
        }

        debug!("Broadcast {} to {} clients", value, clients.len());
        let message = reading_message(value);
        for client in clients {
            let message = message.clone();
            let this = self.clone();
            self.sends.spawn(async move {
                match client.send(message, this.send_timeout).await {
                    Ok(()) => {
                        this.metrics.messages_sent.inc();
                    }
                    Err(e) => {
                        warn!("Dropping client {}: {}", client.id, e);
                        if this.remove_client(&client.id) {
                            client.close(this.send_timeout).await;
                        }
                    }
                }
            });
        }
    }
}
