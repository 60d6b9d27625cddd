pub mod guard;
pub mod local_api;
