pub mod logging;
pub mod task;
