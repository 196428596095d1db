//! Configuration for the sitedeploy orchestrator.
//!
//! Settings come from an optional `sitedeploy.kdl` file and are then
//! overridden by environment variables. Every field has a default.

pub mod error;
pub mod secret;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use secret::SecretString;
pub use system::{
    AuthConfig, DatabaseConfig, GitHubConfig, OrchestratorConfig, ProcessorConfig, ServerConfig,
};
