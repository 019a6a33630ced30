//! Casa Core Library
//!
//! This crate provides configuration and its error type for the Casa offline shell.

pub mod config;
pub mod error;

pub use config::{
    CasaConfig, ExcludedPattern, LogSettings, NetworkConfig, PageConfig, WorkerConfig,
    DEFAULT_SCRIPT_PATH,
};
pub use error::{ConfigError, ConfigResult};
