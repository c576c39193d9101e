//! Service lifecycle: Init, Start, Stop.
//!
//! `start` launches every loop on a [`TaskTracker`] under one cancellation
//! scope and returns; `stop` unwinds them in order.

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    config::{BuildInfo, ConfigStore, Environment},
    logging::{self, LogManager},
    scale::{PortOpener, Reader, ReaderTimings, SystemPorts},
    server::{self, broadcaster::OUTBOUND_CAPACITY, AppState, Assets},
    utils::DaemonError,
};

/// Bound on draining in-flight HTTP requests at shutdown.
pub const HTTP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on waiting for the background loops after cancellation.
pub const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// One-shot quit signal. Only the first [`QuitSignal::fire`] has an effect.
#[derive(Debug, Default)]
pub struct QuitSignal {
    fired: AtomicBool,
    token: CancellationToken,
}

impl QuitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal. Returns true only for the caller that raised it.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Resolves once the signal has been raised.
    pub async fn wait(&self) {
        self.token.cancelled().await
    }
}

/// Handles owned between `start` and `stop`.
struct Running {
    cancel: CancellationToken,
    http_shutdown: CancellationToken,
    reader: Arc<Reader>,
    http: JoinHandle<()>,
    tracker: TaskTracker,
}

/// The daemon: wires the config store, reader, broadcaster, auth manager and
/// HTTP server together.
pub struct Service {
    build: BuildInfo,
    opener: Arc<dyn PortOpener>,
    timings: ReaderTimings,
    env: Option<Environment>,
    logs: Option<Arc<LogManager>>,
    config: Option<Arc<ConfigStore>>,
    quit: Arc<QuitSignal>,
    local_addr: Option<SocketAddr>,
    running: Option<Running>,
}

impl Service {
    pub fn new(build: BuildInfo) -> Self {
        Self {
            build,
            opener: Arc::new(SystemPorts),
            timings: ReaderTimings::default(),
            env: None,
            logs: None,
            config: None,
            quit: Arc::new(QuitSignal::new()),
            local_addr: None,
            running: None,
        }
    }

    /// Replaces the serial port opener.
    pub fn with_port_opener(mut self, opener: Arc<dyn PortOpener>) -> Self {
        self.opener = opener;
        self
    }

    pub fn with_timings(mut self, timings: ReaderTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Resolves the environment, sets up logging and creates the config
    /// store. Starts no background work.
    pub fn init(&mut self) -> Result<(), DaemonError> {
        let env = Environment::resolve(&self.build.env, &self.build.service_name, self.build.http_port);
        let logs = LogManager::setup(
            &env.service_name,
            self.build.log_dir.as_ref().map(PathBuf::from),
            env.default_verbose,
        );
        if !logging::init_tracing(&logs) {
            debug!("Tracing subscriber already installed");
        }

        self.config = Some(Arc::new(ConfigStore::new(&env)));
        info!(
            "Service {} initialized (environment {}, version {})",
            env.service_name,
            env.name,
            self.build.version()
        );
        self.env = Some(env);
        self.logs = Some(logs);
        Ok(())
    }

    /// Launches the auth sweep, broadcaster, reader and HTTP server, and
    /// returns without waiting on any of them.
    ///
    /// # Errors
    /// Fails if called before `init` or twice, or if the embedded assets
    /// cannot be prepared.
    pub fn start(&mut self) -> Result<(), DaemonError> {
        if self.running.is_some() {
            return Err(DaemonError::Lifecycle("service already started"));
        }
        let (Some(env), Some(logs), Some(config)) = (&self.env, &self.logs, &self.config) else {
            return Err(DaemonError::Lifecycle("start called before init"));
        };

        let assets = Assets::load().map_err(|e| {
            error!("Failed to load embedded assets: {}", e);
            e
        })?;

        let cancel = CancellationToken::new();
        let http_shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        self.quit = Arc::new(QuitSignal::new());

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let reader = Arc::new(Reader::new(
            Arc::clone(config),
            outbound_tx,
            Arc::clone(&self.opener),
            self.timings,
        ));

        let on_config_change: server::ConfigChangeHook = {
            let reader = Arc::clone(&reader);
            Arc::new(move || {
                let reader = Arc::clone(&reader);
                tokio::task::spawn_blocking(move || reader.close_port());
            })
        };
        let state = Arc::new(AppState {
            on_config_change,
            shutdown: http_shutdown.clone(),
            ..AppState::new(
                self.build.clone(),
                env.clone(),
                Arc::clone(config),
                Arc::clone(logs),
                assets,
            )?
        });

        {
            let auth = Arc::clone(&state.auth);
            let cancel = cancel.clone();
            tracker.spawn(async move { auth.sweep_loop(cancel).await });
        }
        {
            let broadcaster = state.broadcaster.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move { broadcaster.run(outbound_rx, cancel).await });
        }
        {
            let reader = Arc::clone(&reader);
            let cancel = cancel.clone();
            tracker.spawn(async move { reader.run(cancel).await });
        }

        let listener = server::bind(&env.listen_addr);
        self.local_addr = listener.as_ref().ok().and_then(|l| l.local_addr().ok());
        let http = {
            let quit = Arc::clone(&self.quit);
            let shutdown = http_shutdown.clone();
            let addr = env.listen_addr.clone();
            tracker.spawn(async move {
                let result = match listener {
                    Ok(listener) => server::serve(listener, state, shutdown).await,
                    Err(e) => Err(DaemonError::Http(format!("bind {addr}: {e}"))),
                };
                if let Err(e) = result {
                    error!("HTTP server failed: {}", e);
                    quit.fire();
                }
            })
        };

        {
            let quit = Arc::clone(&self.quit);
            tracker.spawn(async move {
                quit.wait().await;
                debug!("Run loop released");
            });
        }

        info!("Service started");
        self.running = Some(Running {
            cancel,
            http_shutdown,
            reader,
            http,
            tracker,
        });
        Ok(())
    }

    /// Shuts everything down in order: loops, reader, HTTP server, quit
    /// signal, task drain, log file.
    pub async fn stop(&mut self) -> Result<(), DaemonError> {
        let Some(mut running) = self.running.take() else {
            return Err(DaemonError::Lifecycle("stop called before start"));
        };
        info!("Stopping service");

        running.cancel.cancel();
        let reader = Arc::clone(&running.reader);
        if let Err(e) = tokio::task::spawn_blocking(move || reader.stop()).await {
            warn!("Stopping the scale reader failed: {}", e);
        }

        running.http_shutdown.cancel();
        if tokio::time::timeout(HTTP_SHUTDOWN_TIMEOUT, &mut running.http)
            .await
            .is_err()
        {
            warn!("HTTP server did not shut down within {:?}", HTTP_SHUTDOWN_TIMEOUT);
            running.http.abort();
        }

        if !self.quit.fire() {
            debug!("Quit already signaled");
        }

        running.tracker.close();
        if tokio::time::timeout(TASK_DRAIN_TIMEOUT, running.tracker.wait())
            .await
            .is_err()
        {
            warn!("Background tasks did not finish within {:?}", TASK_DRAIN_TIMEOUT);
        }

        info!("Service stopped");
        if let Some(logs) = &self.logs {
            if let Err(e) = logs.close() {
                eprintln!("Failed to close log file: {e}");
            }
        }
        Ok(())
    }

    /// The quit signal of the current run, for callers that want to exit
    /// when the service quits on its own.
    pub fn quit_signal(&self) -> Arc<QuitSignal> {
        Arc::clone(&self.quit)
    }

    pub fn quit_fired(&self) -> bool {
        self.quit.is_fired()
    }

    /// Address the HTTP listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn config(&self) -> Option<&Arc<ConfigStore>> {
        self.config.as_ref()
    }

    pub fn environment(&self) -> Option<&Environment> {
        self.env.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Mutex};

    use futures_util::{SinkExt, StreamExt};
    use tungstenite::protocol::Message;

    use super::*;
    use crate::{scale::ScalePort, utils::error::ScaleError};

    /// Records every port it opens; the ports never answer.
    #[derive(Default)]
    struct RecordingOpener {
        opened: Mutex<Vec<String>>,
    }

    impl RecordingOpener {
        fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }
    }

    struct SilentPort;

    impl ScalePort for SilentPort {
        fn write_command(&mut self, _command: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn read_response(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            std::thread::sleep(Duration::from_millis(5));
            Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
        }

        fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
            Ok(())
        }
    }

    impl PortOpener for RecordingOpener {
        fn open(&self, path: &str, _baud_rate: u32) -> Result<Box<dyn ScalePort>, ScaleError> {
            self.opened.lock().unwrap().push(path.to_string());
            Ok(Box::new(SilentPort))
        }
    }

    fn quick_timings() -> ReaderTimings {
        ReaderTimings {
            retry_delay: Duration::from_millis(20),
            read_timeout: Duration::from_millis(20),
            settle_delay: Duration::from_millis(1),
            poll_interval: Duration::from_millis(1),
            simulated_spacing: Duration::from_millis(1),
        }
    }

    fn build(dir: &tempfile::TempDir, http_port: u16) -> BuildInfo {
        BuildInfo {
            env: "local".into(),
            http_port,
            log_dir: Some(dir.path().display().to_string()),
            ..BuildInfo::default()
        }
    }

    #[test]
    fn quit_fires_once() {
        let quit = QuitSignal::new();
        assert!(!quit.is_fired());
        assert!(quit.fire());
        assert!(!quit.fire());
        assert!(quit.is_fired());
    }

    #[tokio::test]
    async fn lifecycle_order_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = Service::new(build(&dir, 0)).with_timings(quick_timings());
        assert!(matches!(service.start(), Err(DaemonError::Lifecycle(_))));
        assert!(matches!(service.stop().await, Err(DaemonError::Lifecycle(_))));

        service.init().unwrap();
        service.start().unwrap();
        assert!(matches!(service.start(), Err(DaemonError::Lifecycle(_))));
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_unblocks_every_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = Service::new(build(&dir, 0)).with_timings(quick_timings());
        service.init().unwrap();
        service.start().unwrap();
        assert!(service.local_addr().is_some());
        assert!(!service.quit_fired());

        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(5), service.stop())
            .await
            .unwrap()
            .unwrap();
        assert!(service.quit_fired());
    }

    #[tokio::test]
    async fn listener_failure_fires_quit_and_stop_still_completes() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();

        let mut service = Service::new(build(&dir, port)).with_timings(quick_timings());
        service.init().unwrap();
        service.start().unwrap();

        let quit = service.quit_signal();
        tokio::time::timeout(Duration::from_secs(2), quit.wait())
            .await
            .unwrap();
        assert!(service.quit_fired());

        tokio::time::timeout(Duration::from_secs(5), service.stop())
            .await
            .unwrap()
            .unwrap();
        // the listener already raised quit, stop must not raise it again
        assert!(!quit.fire());
    }

    #[tokio::test]
    async fn accepted_config_reopens_the_scale_port() {
        let dir = tempfile::tempdir().unwrap();
        let opener = Arc::new(RecordingOpener::default());
        let mut service = Service::new(BuildInfo {
            env: "remote".into(),
            ..build(&dir, 0)
        })
        .with_port_opener(opener.clone())
        .with_timings(quick_timings());
        service.init().unwrap();
        service.start().unwrap();

        let wait_for = |port: &'static str| {
            let opener = Arc::clone(&opener);
            async move {
                tokio::time::timeout(Duration::from_secs(2), async {
                    while !opener.opened().iter().any(|p| p == port) {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                })
                .await
                .unwrap();
            }
        };
        wait_for("COM3").await;

        let port = service.local_addr().unwrap().port();
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws"))
            .await
            .unwrap();
        ws.next().await.unwrap().unwrap();
        ws.send(Message::Text(
            r#"{"tipo":"config","puerto":"COM7","marca":"","modoPrueba":false}"#.into(),
        ))
        .await
        .unwrap();

        wait_for("COM7").await;
        assert_eq!(service.config().unwrap().get().port, "COM7");

        drop(ws);
        tokio::time::timeout(Duration::from_secs(5), service.stop())
            .await
            .unwrap()
            .unwrap();
    }
}
