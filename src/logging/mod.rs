//! Log manager: owns the log file, filters chatter when verbose is off, and
//! backs the `tracing` subscriber.

pub mod rotation;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::info;
use tracing_subscriber::{fmt::MakeWriter, EnvFilter};

use crate::utils::error::LogError;
use rotation::FLUSH_KEEP_LINES;

/// Messages dropped from the log file while verbose logging is off.
pub const NON_CRITICAL_PREFIXES: &[&str] = &[
    "Test mode active",
    "Weight sent",
    "No meaningful weight received",
    "Configuration unchanged",
    "Listening for client messages",
    "Stopped listening for client messages",
    "Client connected",
    "Client disconnected",
];

/// Verbosity and file size, as reported to dashboard clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStatus {
    pub verbose: bool,
    pub size: u64,
}

#[derive(Debug)]
pub struct LogManager {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
    verbose: RwLock<bool>,
}

impl LogManager {
    /// Resolves `<base>/<name>/<name>.log`, rotates it if oversized and opens it
    /// for appending. Any filesystem failure degrades to console output.
    pub fn setup(name: &str, base_dir: Option<PathBuf>, default_verbose: bool) -> Arc<Self> {
        let base = base_dir
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        let dir = base.join(name);

        if let Err(e) = fs::create_dir_all(&dir) {
            eprintln!("Logging to stdout (no write access to {}: {})", dir.display(), e);
            return Arc::new(Self::console(default_verbose));
        }

        let path = dir.join(format!("{name}.log"));
        if let Err(e) = rotation::rotate_if_needed(&path) {
            eprintln!("Log rotation error: {e}");
        }

        match Self::open(&path, default_verbose) {
            Ok(mgr) => Arc::new(mgr),
            Err(e) => {
                eprintln!("Logging to stdout (cannot open {}: {})", path.display(), e);
                Arc::new(Self::console(default_verbose))
            }
        }
    }

    /// Opens `path` for appending.
    pub fn open(path: &Path, verbose: bool) -> io::Result<Self> {
        let file = open_append(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            file: Mutex::new(Some(file)),
            verbose: RwLock::new(verbose),
        })
    }

    /// A manager without a file; everything goes to stdout.
    pub fn console(verbose: bool) -> Self {
        Self {
            path: None,
            file: Mutex::new(None),
            verbose: RwLock::new(verbose),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_verbose(&self, verbose: bool) {
        *self.verbose.write().unwrap_or_else(PoisonError::into_inner) = verbose;
        info!("Log verbosity set to {}", verbose);
    }

    pub fn verbose(&self) -> bool {
        *self.verbose.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cuts the file down to its last 50 lines and reopens it.
    ///
    /// The handle lock is held throughout, so writers never see a closed file.
    pub fn flush(&self) -> Result<(), LogError> {
        let path = self.path.as_deref().ok_or(LogError::NotConfigured)?;
        {
            let mut file = self.lock_file();
            file.take();
            let truncated = rotation::truncate_to_last(path, FLUSH_KEEP_LINES);
            // reopen even if the rewrite failed so logging keeps going
            *file = open_append(path).ok();
            truncated?;
            if file.is_none() {
                return Err(LogError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    format!("cannot reopen {}", path.display()),
                )));
            }
        }
        info!("Logs flushed");
        Ok(())
    }

    /// Last `n` lines of the file, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        self.path
            .as_deref()
            .and_then(|p| rotation::read_last_lines(p, n).ok())
            .unwrap_or_default()
    }

    pub fn status(&self) -> LogStatus {
        LogStatus {
            verbose: self.verbose(),
            size: self.path.as_deref().map(rotation::file_size).unwrap_or(0),
        }
    }

    /// Closes the file. Later lines go to stdout.
    pub fn close(&self) -> io::Result<()> {
        match self.lock_file().take() {
            Some(mut file) => file.flush(),
            None => Ok(()),
        }
    }

    fn lock_file(&self) -> MutexGuard<'_, Option<File>> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_filtered(&self, line: &[u8]) -> bool {
        if self.verbose() {
            return false;
        }
        let line = String::from_utf8_lossy(line);
        NON_CRITICAL_PREFIXES.iter().any(|p| line.contains(p))
    }

    /// Write path for one formatted log line.
    fn write_line(&self, line: &[u8]) -> io::Result<usize> {
        if self.is_filtered(line) {
            return Ok(line.len());
        }
        match self.lock_file().as_mut() {
            Some(file) => file.write_all(line)?,
            None => io::stdout().write_all(line)?,
        }
        Ok(line.len())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).read(true).open(path)
}

/// `io::Write` handle given to the fmt layer for each event.
pub struct LogWriter(Arc<LogManager>);

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_line(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct MakeLogWriter(Arc<LogManager>);

impl<'a> MakeWriter<'a> for MakeLogWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter(Arc::clone(&self.0))
    }
}

/// Installs the global subscriber writing through `manager`.
///
/// Returns false if a subscriber was already installed.
pub fn init_tracing(manager: &Arc<LogManager>) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(MakeLogWriter(Arc::clone(manager)))
        .try_init()
        .is_ok()
}
