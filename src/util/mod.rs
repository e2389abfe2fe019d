//! Miscellaneous shared helpers (error taxonomy, settings paths).

pub mod config;
pub mod error;

pub use config::{cache_path_for_settings, default_cache_path, resolve_relative};
pub use error::{
    ConfigError, ConfmonError, ErrorClass, HostParseError, SettingsError, VbucketError,
};
