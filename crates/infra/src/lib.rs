//! Infrastructure layer: job storage, service wiring, background sweeping and
//! configuration.

pub mod config;
pub mod jobs;


pub use config::{ConfigError, SchedulerConfig};
