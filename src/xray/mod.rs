//! Optional external tunnel adapter.

pub mod config;
pub mod manager;
pub mod metrics;

pub use config::{generate, GenerateOptions, Generated};
pub use manager::{ChildProcess, Instance, OsRunner, ProcessRunner};
pub use metrics::{parse_debug_vars, MetricsClient, NodeHealth};
