//! Configuration Module
//!
//! Configuration loading for the market-sync service.

mod settings;

pub use settings::{
    ApiSettings, ConfigError, CredentialSettings, ServerSettings, StreamSettings, SyncConfig,
};
