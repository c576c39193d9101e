// src/server/middleware/mod.rs
pub mod rate_limit;
pub mod session;
pub mod validation;

// Re-export main components for cleaner imports
pub use rate_limit::ConfigRateLimiter;
pub use session::require_session;
pub use validation::{validate_frame, validate_message};
