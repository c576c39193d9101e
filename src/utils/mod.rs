pub mod error;

pub use error::{AssetError, ConfigError, DaemonError, LogError, ScaleError};
