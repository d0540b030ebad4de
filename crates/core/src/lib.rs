//! Core functionality for the Pidgeon provisioning tooling.
//!
//! This crate provides the configuration model, the shared error type and
//! logging initialisation used across the Pidgeon workspace.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    AuthoritiesConfig, BundleConfig, CloudConfig, Config, DatabaseConfig, FillPolicy,
    PathsConfig, SecretsConfig, StagingConfig,
};
pub use error::{CoreError, Result};
