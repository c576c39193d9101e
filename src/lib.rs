pub mod auth;
pub mod config;
pub mod daemon;
pub mod logging;
pub mod scale;
pub mod server;
pub mod utils;
