pub mod batch;
pub mod cache;
pub mod circuit_breaker;
pub mod dedup;
pub mod pool;
