use std::sync::{PoisonError, RwLock};

use config::{Config as ConfigSource, Environment as EnvSource};
use password_hash::PasswordHash;
use serde::Deserialize;
use tracing::warn;

use crate::utils::error::ConfigError;

/// Serial port used until an operator configures another one.
pub const DEFAULT_SERIAL_PORT: &str = "COM3";
/// Brand used until an operator configures another one.
pub const DEFAULT_BRAND: &str = "Rhino BAR 8RS";

/// Values fixed when the binary is built (or supplied by the service
/// environment), treated as opaque strings by the rest of the daemon.
#[derive(Debug, Deserialize, Clone)]
pub struct BuildInfo {
    /// Deployment profile label (`local`, `remote`, `test`).
    pub env: String,
    /// Name used for the log directory and file.
    pub service_name: String,
    pub build_date: String,
    pub build_time: String,
    /// Argon2 PHC string for the dashboard password. Auth is disabled when absent.
    pub password_hash: Option<String>,
    /// Token that `config` messages must carry. Not enforced when absent.
    pub auth_token: Option<String>,
    /// The port on which the HTTP/WebSocket server will listen.
    pub http_port: u16,
    /// Overrides the platform data directory used for the log file.
    pub log_dir: Option<String>,
}

impl BuildInfo {
    /// Loads the build inputs from `BASCULA_*` environment variables, falling
    /// back to the values baked in at compile time.
    ///
    /// # Errors
    /// Returns a `ConfigError` if a variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(EnvSource::with_prefix("BASCULA"))
    }

    /// Loads the build inputs from the given environment source.
    pub fn load(source: EnvSource) -> Result<Self, ConfigError> {
        let mut info: BuildInfo = ConfigSource::builder()
            .set_default("env", option_env!("BASCULA_ENV").unwrap_or("local"))?
            .set_default(
                "service_name",
                option_env!("BASCULA_SERVICE_NAME").unwrap_or("BasculaServicio"),
            )?
            .set_default("build_date", option_env!("BASCULA_BUILD_DATE").unwrap_or("unknown"))?
            .set_default("build_time", option_env!("BASCULA_BUILD_TIME").unwrap_or("unknown"))?
            .set_default("http_port", option_env!("BASCULA_HTTP_PORT").unwrap_or("8080"))?
            .set_default("password_hash", option_env!("BASCULA_PASSWORD_HASH"))?
            .set_default("auth_token", option_env!("BASCULA_AUTH_TOKEN"))?
            .add_source(source)
            .build()?
            .try_deserialize()?;

        // An empty injected value means "not configured".
        info.password_hash = info.password_hash.filter(|h| !h.is_empty());
        info.auth_token = info.auth_token.filter(|t| !t.is_empty());
        info.log_dir = info.log_dir.filter(|d| !d.is_empty());
        Ok(info)
    }

    /// Validates the loaded values.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` for a zero port or a password hash that
    /// is not a valid PHC string.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http_port == 0 {
            return Err(ConfigError::Invalid("http_port must be greater than 0".into()));
        }
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::Invalid("service_name cannot be empty".into()));
        }
        if let Some(hash) = &self.password_hash {
            PasswordHash::new(hash)
                .map_err(|e| ConfigError::Invalid(format!("password_hash: {e}")))?;
        }
        Ok(())
    }

    /// `"<date> <time>"`, the version string shown to dashboard clients.
    pub fn version(&self) -> String {
        format!("{} {}", self.build_date, self.build_time)
    }
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            env: "local".into(),
            service_name: "BasculaServicio".into(),
            build_date: "unknown".into(),
            build_time: "unknown".into(),
            password_hash: None,
            auth_token: None,
            http_port: 8080,
            log_dir: None,
        }
    }
}

/// A named bundle of deployment defaults, chosen once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    /// Display name sent to clients (`LOCAL`, `REMOTO`).
    pub name: String,
    pub service_name: String,
    pub listen_addr: String,
    pub default_port: String,
    /// Simulated readings instead of real hardware.
    pub default_test_mode: bool,
    /// Verbose logging on startup.
    pub default_verbose: bool,
}

impl Environment {
    /// Resolves the profile for `label`, defaulting to `local` for unknown labels.
    pub fn resolve(label: &str, service_name: &str, http_port: u16) -> Self {
        let (name, host, test_mode, verbose) = match label {
            "local" => ("LOCAL", "127.0.0.1", true, false),
            "remote" => ("REMOTO", "0.0.0.0", false, false),
            "test" => ("LOCAL", "127.0.0.1", true, true),
            other => {
                warn!("Unknown environment '{}', defaulting to 'local'", other);
                ("LOCAL", "127.0.0.1", true, false)
            }
        };
        Self {
            name: name.into(),
            service_name: service_name.into(),
            listen_addr: format!("{host}:{http_port}"),
            default_port: DEFAULT_SERIAL_PORT.into(),
            default_test_mode: test_mode,
            default_verbose: verbose,
        }
    }
}

/// Immutable copy of the device settings at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub port: String,
    pub brand: String,
    pub test_mode: bool,
    pub environment: String,
    /// WebSocket address advertised to clients.
    pub dir: String,
}

/// Thread-safe store of the device settings.
///
/// Readers always get a copy; the only write path is [`ConfigStore::update`].
#[derive(Debug)]
pub struct ConfigStore {
    current: RwLock<Snapshot>,
}

impl ConfigStore {
    pub fn new(env: &Environment) -> Self {
        Self {
            current: RwLock::new(Snapshot {
                port: env.default_port.clone(),
                brand: DEFAULT_BRAND.into(),
                test_mode: env.default_test_mode,
                environment: env.name.clone(),
                dir: format!("ws://{}", env.listen_addr),
            }),
        }
    }

    pub fn get(&self) -> Snapshot {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies new device settings and reports whether anything changed.
    ///
    /// Empty `port` or `brand` keep the current value; `test_mode` is always taken.
    pub fn update(&self, port: &str, brand: &str, test_mode: bool) -> bool {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);

        let port = if port.is_empty() { current.port.as_str() } else { port };
        let brand = if brand.is_empty() { current.brand.as_str() } else { brand };

        let changed = current.port != port || current.brand != brand || current.test_mode != test_mode;
        if changed {
            *current = Snapshot {
                port: port.to_string(),
                brand: brand.to_string(),
                test_mode,
                environment: current.environment.clone(),
                dir: current.dir.clone(),
            };
        }
        changed
    }
}
