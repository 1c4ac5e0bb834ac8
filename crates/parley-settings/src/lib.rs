//! # parley-settings
//!
//! Layered configuration: compiled defaults, then `settings.json` from the
//! parley home directory, then `PARLEY_*` environment variables.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, parley_home,
    resolve_path, settings_path,
};
pub use types::*;
