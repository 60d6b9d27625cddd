pub mod comms;
pub mod config;
pub mod error;
pub mod progress;
pub mod resilience;
pub mod security;
pub mod translation;
pub mod utils;

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
