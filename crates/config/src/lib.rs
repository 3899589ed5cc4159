//! Configuration loading, validation and env substitution.
//!
//! Config files: `pollcast.toml`, `pollcast.yaml`, or `pollcast.json`,
//! searched in `./` then the user config directory (`~/.config/pollcast/`).
//!
//! String values may reference `${ENV_VAR}` or `${ENV_VAR:-fallback}`.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{config_dir, discover_and_load, find_config_file, load_config},
    schema::{
        DatabaseConfig, MessagesConfig, PollcastConfig, PollsConfig, RedisConfig, SecurityConfig,
        ServerConfig, TwitchConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
