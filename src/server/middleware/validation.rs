use crate::server::message::{ClientMessage, MessageError};

/// Largest accepted inbound text frame.
pub const MAX_MESSAGE_LEN: usize = 4096;
/// Largest accepted `puerto`/`marca` value.
pub const MAX_FIELD_LEN: usize = 64;
pub const DEFAULT_TAIL_LINES: usize = 100;
pub const MAX_TAIL_LINES: usize = 1000;

/// Rejects oversized frames before they are parsed.
pub fn validate_frame(text: &str) -> Result<(), MessageError> {
    if text.len() > MAX_MESSAGE_LEN {
        return Err(MessageError::MessageTooLong(text.len()));
    }
    Ok(())
}

/// Validates a parsed client message.
///
/// # Returns
///
/// * `Ok(())` if the message is within allowed limits.
/// * `Err(MessageError::FieldTooLong)` if a `config` field exceeds [`MAX_FIELD_LEN`] characters.
pub fn validate_message(msg: &ClientMessage) -> Result<(), MessageError> {
    match msg {
        ClientMessage::Config(req) if req.puerto.chars().count() > MAX_FIELD_LEN => {
            Err(MessageError::FieldTooLong("puerto"))
        }
        ClientMessage::Config(req) if req.marca.chars().count() > MAX_FIELD_LEN => {
            Err(MessageError::FieldTooLong("marca"))
        }
        _ => Ok(()),
    }
}

/// Line count for a `logTail` request: 100 when absent, clamped to 1..=1000.
pub fn tail_lines(requested: Option<f64>) -> usize {
    match requested {
        Some(n) if n.is_finite() => (n as i64).clamp(1, MAX_TAIL_LINES as i64) as usize,
        _ => DEFAULT_TAIL_LINES,
    }
}
