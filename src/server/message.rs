//! Wire format of the dashboard WebSocket protocol.
//!
//! Field names are fixed by existing dashboard clients.

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Snapshot;
use crate::logging::LogStatus;

/// Represents the reasons an inbound frame is ignored.
#[derive(Error, Debug)]
pub enum MessageError {
    /// The frame exceeds the accepted size.
    #[error("Message too long ({0} bytes)")]
    MessageTooLong(usize),

    /// A field exceeds its accepted length.
    #[error("Field {0} too long")]
    FieldTooLong(&'static str),

    /// The frame is not a known JSON message.
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
}

/// Messages a dashboard client can send, discriminated by `tipo`.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "tipo")]
pub enum ClientMessage {
    #[serde(rename = "config")]
    Config(ConfigRequest),

    #[serde(rename = "logConfig")]
    LogConfig { verbose: bool },

    #[serde(rename = "logFlush")]
    LogFlush {},

    #[serde(rename = "logTail")]
    LogTail {
        #[serde(default)]
        lines: Option<f64>,
    },

    #[serde(rename = "logStatus")]
    LogStatus {},
}

/// Requested device settings. Empty strings keep the current value.
#[derive(Debug, Default, Deserialize, PartialEq)]
pub struct ConfigRequest {
    #[serde(default)]
    pub puerto: String,
    #[serde(default)]
    pub marca: String,
    #[serde(default, rename = "modoPrueba")]
    pub modo_prueba: bool,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Device settings as shown to clients.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClientConfig {
    pub puerto: String,
    pub marca: String,
    #[serde(rename = "modoPrueba")]
    pub modo_prueba: bool,
    pub dir: String,
    pub ambiente: String,
}

impl From<&Snapshot> for ClientConfig {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            puerto: snapshot.port.clone(),
            marca: snapshot.brand.clone(),
            modo_prueba: snapshot.test_mode,
            dir: snapshot.dir.clone(),
            ambiente: snapshot.environment.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ErrorCode {
    #[serde(rename = "RATE_LIMITED")]
    RateLimited,
    #[serde(rename = "AUTH_INVALID_TOKEN")]
    AuthInvalidToken,
}

/// Structured replies sent to a single client.
///
/// Readings are not part of this enum: they travel as bare JSON strings, see
/// [`reading_message`].
#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "tipo")]
pub enum ServerMessage {
    #[serde(rename = "ambiente")]
    Ambiente {
        ambiente: String,
        version: String,
        config: ClientConfig,
    },

    #[serde(rename = "logStatus")]
    LogStatus { verbose: bool, size: u64 },

    #[serde(rename = "logLines")]
    LogLines { lines: Vec<String> },

    #[serde(rename = "logFlushResult")]
    LogFlushResult {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "error")]
    Error { error: ErrorCode },
}

impl ServerMessage {
    pub fn ambiente(snapshot: &Snapshot, version: String) -> Self {
        ServerMessage::Ambiente {
            ambiente: snapshot.environment.clone(),
            version,
            config: ClientConfig::from(snapshot),
        }
    }
}

impl From<LogStatus> for ServerMessage {
    fn from(status: LogStatus) -> Self {
        ServerMessage::LogStatus {
            verbose: status.verbose,
            size: status.size,
        }
    }
}

impl TryFrom<&ServerMessage> for Message {
    type Error = serde_json::Error;

    fn try_from(msg: &ServerMessage) -> Result<Self, Self::Error> {
        Ok(Message::Text(serde_json::to_string(msg)?))
    }
}

/// A reading or sentinel as a bare JSON string frame, e.g. `"12.50"`.
pub fn reading_message(value: &str) -> Message {
    Message::Text(serde_json::Value::String(value.to_string()).to_string())
}

/// Parses one text frame.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, MessageError> {
    serde_json::from_str(text).map_err(|e| MessageError::InvalidFormat(e.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn readings_are_bare_json_strings() {
        assert_eq!(reading_message("12.50"), Message::Text("\"12.50\"".into()));
        assert_eq!(reading_message("ERR_EOF"), Message::Text("\"ERR_EOF\"".into()));
    }

    #[test]
    fn parses_every_inbound_kind() {
        let config = parse_client_message(
            r#"{"tipo":"config","puerto":"COM5","marca":"Rhino","modoPrueba":true,"auth_token":"t"}"#,
        )
        .unwrap();
        assert_eq!(
            config,
            ClientMessage::Config(ConfigRequest {
                puerto: "COM5".into(),
                marca: "Rhino".into(),
                modo_prueba: true,
                dir: None,
                auth_token: Some("t".into()),
            })
        );

        assert_eq!(
            parse_client_message(r#"{"tipo":"logConfig","verbose":true}"#).unwrap(),
            ClientMessage::LogConfig { verbose: true }
        );
        assert_eq!(parse_client_message(r#"{"tipo":"logFlush"}"#).unwrap(), ClientMessage::LogFlush {});
        assert_eq!(
            parse_client_message(r#"{"tipo":"logTail","lines":20}"#).unwrap(),
            ClientMessage::LogTail { lines: Some(20.0) }
        );
        assert_eq!(
            parse_client_message(r#"{"tipo":"logTail"}"#).unwrap(),
            ClientMessage::LogTail { lines: None }
        );
        assert_eq!(parse_client_message(r#"{"tipo":"logStatus"}"#).unwrap(), ClientMessage::LogStatus {});
    }

    #[test]
    fn unknown_or_malformed_frames_are_errors() {
        assert!(parse_client_message(r#"{"tipo":"reboot"}"#).is_err());
        assert!(parse_client_message(r#"{"verbose":true}"#).is_err());
        assert!(parse_client_message("not json").is_err());
        assert!(parse_client_message(r#"{"tipo":"logConfig"}"#).is_err());
    }

    #[test]
    fn outbound_shapes() {
        let snapshot = Snapshot {
            port: "COM3".into(),
            brand: "Rhino BAR 8RS".into(),
            test_mode: false,
            environment: "LOCAL".into(),
            dir: "ws://127.0.0.1:8080".into(),
        };
        let value = serde_json::to_value(ServerMessage::ambiente(&snapshot, "d t".into())).unwrap();
        assert_eq!(
            value,
            json!({
                "tipo": "ambiente",
                "ambiente": "LOCAL",
                "version": "d t",
                "config": {
                    "puerto": "COM3",
                    "marca": "Rhino BAR 8RS",
                    "modoPrueba": false,
                    "dir": "ws://127.0.0.1:8080",
                    "ambiente": "LOCAL"
                }
            })
        );

        let error = serde_json::to_value(ServerMessage::Error { error: ErrorCode::RateLimited }).unwrap();
        assert_eq!(error, json!({"tipo": "error", "error": "RATE_LIMITED"}));

        let flushed = serde_json::to_value(ServerMessage::LogFlushResult { ok: true, error: None }).unwrap();
        assert_eq!(flushed, json!({"tipo": "logFlushResult", "ok": true}));

        let status = serde_json::to_value(ServerMessage::from(LogStatus { verbose: true, size: 42 })).unwrap();
        assert_eq!(status, json!({"tipo": "logStatus", "verbose": true, "size": 42}));
    }
}
