pub mod audit_log;
pub mod auth;
pub mod csrf;
pub mod rate_limit;
pub mod rotation;
