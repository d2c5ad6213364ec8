/// TOML configuration for the tailing pipeline
#[allow(clippy::module_inception)]
pub mod config;

pub use config::{
    AlertsConfig, CollaboratorsConfig, Config, MonitorConfig, ServerConfig, SmtpConfig,
    TailingConfig,
};
