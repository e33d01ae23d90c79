//! Download worker: queue-driven job processing with status tracking and
//! result artifacts.

pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod queue;
pub mod store;
