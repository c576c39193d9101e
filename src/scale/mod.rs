//! Scale reader: owns the serial port and turns device answers into readings.
//!
//! Each cycle re-reads the configuration. In test mode a burst of simulated
//! readings is emitted; otherwise the configured port is opened and polled
//! until it fails, is closed by a configuration change, or the reader stops.
//! Failures are broadcast as [`Sentinel`] codes through the same queue as
//! readings and retried after [`ReaderTimings::retry_delay`].

pub mod port;
pub mod simulate;

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigStore, Snapshot};
pub use port::{PortOpener, ScalePort, SystemPorts};
pub use simulate::generate_simulated_weights;

pub const BAUD_RATE: u32 = 9600;
/// Size of the buffer one poll reads into.
pub const RESPONSE_LEN: usize = 20;
/// Command sent to brands without a known command.
pub const DEFAULT_COMMAND: &[u8] = b"P";

/// Device-layer failure codes broadcast in place of a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    Connection,
    Eof,
    Timeout,
    Read,
}

impl Sentinel {
    pub fn code(self) -> &'static str {
        match self {
            Sentinel::Connection => "ERR_SCALE_CONN",
            Sentinel::Eof => "ERR_EOF",
            Sentinel::Timeout => "ERR_TIMEOUT",
            Sentinel::Read => "ERR_READ",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Sentinel::Connection => "Could not connect to the serial port",
            Sentinel::Eof => "EOF received, device possibly disconnected",
            Sentinel::Timeout => "Read timeout",
            Sentinel::Read => "Read error",
        }
    }
}

/// Poll command for a scale brand (case-insensitive).
pub fn command_for_brand(brand: &str) -> &'static [u8] {
    match brand.to_lowercase().as_str() {
        "rhino" | "rhino bar 8rs" => b"P",
        _ => DEFAULT_COMMAND,
    }
}

/// Delays driving the reader state machine.
#[derive(Debug, Clone, Copy)]
pub struct ReaderTimings {
    /// Wait before reconnecting after a failure.
    pub retry_delay: Duration,
    pub read_timeout: Duration,
    /// Wait between writing the command and reading the answer.
    pub settle_delay: Duration,
    /// Wait after a successful reading before the next poll.
    pub poll_interval: Duration,
    /// Spacing between simulated readings.
    pub simulated_spacing: Duration,
}

impl Default for ReaderTimings {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(3),
            read_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_millis(500),
            poll_interval: Duration::from_millis(300),
            simulated_spacing: Duration::from_millis(300),
        }
    }
}

type SharedPort = Arc<Mutex<Option<Box<dyn ScalePort>>>>;

fn lock_port(port: &SharedPort) -> MutexGuard<'_, Option<Box<dyn ScalePort>>> {
    port.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Poll {
    Reading(String),
    Empty,
    Timeout,
    Eof,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
    /// The port was closed from outside while polling.
    Closed,
    Cancelled,
}

/// Reads the scale and feeds the outbound queue.
pub struct Reader {
    config: Arc<ConfigStore>,
    outbound: mpsc::Sender<String>,
    opener: Arc<dyn PortOpener>,
    port: SharedPort,
    stop: CancellationToken,
    timings: ReaderTimings,
}

impl Reader {
    pub fn new(
        config: Arc<ConfigStore>,
        outbound: mpsc::Sender<String>,
        opener: Arc<dyn PortOpener>,
        timings: ReaderTimings,
    ) -> Self {
        Self {
            config,
            outbound,
            opener,
            port: Arc::new(Mutex::new(None)),
            stop: CancellationToken::new(),
            timings,
        }
    }

    /// Runs read cycles until `cancel` fires or [`Reader::stop`] is called.
    pub async fn run(&self, cancel: CancellationToken) {
        while !self.stopping(&cancel) {
            self.read_cycle(&cancel).await;
        }
        self.close_port();
        info!("Scale reader stopped");
    }

    /// Stops the run loop and closes the port. Later calls do nothing more.
    pub fn stop(&self) {
        self.stop.cancel();
        self.close_port();
    }

    /// Closes the port without stopping the loop, forcing a reconnect with
    /// the current settings.
    pub fn close_port(&self) {
        if lock_port(&self.port).take().is_some() {
            info!("Serial port closed");
        }
    }

    pub fn is_connected(&self) -> bool {
        lock_port(&self.port).is_some()
    }

    /// Queues a sentinel without ever blocking; dropped if the queue is full.
    pub fn send_sentinel(&self, sentinel: Sentinel) {
        self.enqueue(sentinel.code().to_string());
    }

    fn enqueue(&self, value: String) {
        if let Err(mpsc::error::TrySendError::Full(dropped)) = self.outbound.try_send(value) {
            debug!("Outbound queue full, dropping {}", dropped);
        }
    }

    fn stopping(&self, cancel: &CancellationToken) -> bool {
        cancel.is_cancelled() || self.stop.is_cancelled()
    }

    /// Sleeps for `delay`; returns false if the reader was asked to stop meanwhile.
    async fn pause(&self, cancel: &CancellationToken, delay: Duration) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn read_cycle(&self, cancel: &CancellationToken) {
        let conf = self.config.get();

        if conf.test_mode {
            self.simulate(cancel, &conf).await;
            return;
        }

        if let Err(e) = self.connect(&conf.port).await {
            error!(
                "Could not open serial port {}: {}. Retrying in {:?}",
                conf.port, e, self.timings.retry_delay
            );
            self.send_sentinel(Sentinel::Connection);
            self.pause(cancel, self.timings.retry_delay).await;
            return;
        }
        info!("Connected to serial port {}", conf.port);

        self.poll_loop(cancel, &conf.port).await;

        if !self.stopping(cancel) {
            info!(
                "Waiting {:?} before reconnecting to the serial port",
                self.timings.retry_delay
            );
            self.pause(cancel, self.timings.retry_delay).await;
        }
    }

    async fn simulate(&self, cancel: &CancellationToken, conf: &Snapshot) {
        info!("Test mode active - environment: {}", conf.environment);

        for weight in generate_simulated_weights() {
            let value = format!("{weight:.2}");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.stop.cancelled() => return,
                sent = self.outbound.send(value) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
            if !self.pause(cancel, self.timings.simulated_spacing).await {
                return;
            }
        }
        self.pause(cancel, self.timings.retry_delay).await;
    }

    async fn connect(&self, path: &str) -> Result<(), io::Error> {
        let opener = Arc::clone(&self.opener);
        let port = Arc::clone(&self.port);
        let path = path.to_string();
        let read_timeout = self.timings.read_timeout;

        task::spawn_blocking(move || {
            let mut device = opener
                .open(&path, BAUD_RATE)
                .map_err(|e| io::Error::new(io::ErrorKind::NotConnected, e.to_string()))?;
            device.set_timeout(read_timeout)?;
            *lock_port(&port) = Some(device);
            Ok(())
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    async fn poll_loop(&self, cancel: &CancellationToken, path: &str) {
        loop {
            if self.stopping(cancel) {
                return;
            }

            let brand = self.config.get().brand;
            match self.poll_once(cancel, command_for_brand(&brand)).await {
                Poll::Reading(weight) => {
                    info!("Weight sent: {}", weight);
                    self.enqueue(weight);
                }
                Poll::Empty => warn!("No meaningful weight received"),
                Poll::Timeout => {
                    warn!("{}: {}. Retrying...", Sentinel::Timeout.description(), path);
                    self.send_sentinel(Sentinel::Timeout);
                    continue;
                }
                Poll::Eof => {
                    warn!("{}: {}", Sentinel::Eof.description(), path);
                    self.send_sentinel(Sentinel::Eof);
                    self.close_port();
                    return;
                }
                Poll::ReadFailed(e) => {
                    error!("{}: {} - {}", Sentinel::Read.description(), path, e);
                    self.send_sentinel(Sentinel::Read);
                    self.close_port();
                    return;
                }
                Poll::WriteFailed(e) => {
                    error!("Error writing to serial port {}: {}. Closing and retrying", path, e);
                    self.close_port();
                    return;
                }
                Poll::Closed => {
                    info!("Serial port closed, leaving read loop");
                    return;
                }
                Poll::Cancelled => return,
            }

            if !self.pause(cancel, self.timings.poll_interval).await {
                return;
            }
        }
    }

    /// One write, settle, read sequence.
    ///
    /// The port lock is taken for the write and again for the read, never
    /// across the settle delay, so `close_port` only waits for in-flight I/O.
    async fn poll_once(&self, cancel: &CancellationToken, command: &'static [u8]) -> Poll {
        let port = Arc::clone(&self.port);
        let written = task::spawn_blocking(move || match lock_port(&port).as_mut() {
            None => Poll::Closed,
            Some(device) => match device.write_command(command) {
                Ok(()) => Poll::Empty,
                Err(e) => Poll::WriteFailed(e),
            },
        })
        .await
        .unwrap_or_else(|e| Poll::WriteFailed(io::Error::new(io::ErrorKind::Other, e)));

        if !matches!(written, Poll::Empty) {
            return written;
        }

        if !self.pause(cancel, self.timings.settle_delay).await {
            return Poll::Cancelled;
        }

        let port = Arc::clone(&self.port);
        task::spawn_blocking(move || {
            let mut guard = lock_port(&port);
            let Some(device) = guard.as_mut() else {
                return Poll::Closed;
            };
            let mut buf = [0u8; RESPONSE_LEN];
            match device.read_response(&mut buf) {
                Ok(0) => Poll::Eof,
                Ok(n) => {
                    let weight = String::from_utf8_lossy(&buf[..n]).trim().to_string();
                    if weight.is_empty() {
                        Poll::Empty
                    } else {
                        Poll::Reading(weight)
                    }
                }
                Err(e) => match e.kind() {
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Poll::Timeout,
                    io::ErrorKind::UnexpectedEof => Poll::Eof,
                    _ => Poll::ReadFailed(e),
                },
            }
        })
        .await
        .unwrap_or_else(|e| Poll::ReadFailed(io::Error::new(io::ErrorKind::Other, e)))
    }
}
