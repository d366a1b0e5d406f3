//! Configuration module.
//!
//! Handles the settings file, environment variables, and registry loading.

mod settings;

pub use settings::{expand_env_vars, CompilerSettings, RegistrySettings, Settings, SettingsError};
