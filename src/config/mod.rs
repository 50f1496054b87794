mod basic;
mod registry;
mod tunables;

pub use basic::{BasicConfig, GoogleDefaults, OpenaiPassthroughConfig};
pub use registry::{OVERRIDE_KEYS, SettingsRegistry};
pub use tunables::{PoolMode, Tunables};

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Application configuration managed by Figment.
///
/// `basic` and `google`/`openai` are boot-time only; `tunables` seeds the
/// [`SettingsRegistry`], which then layers persisted overrides on top.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Core server configuration (see `basic` table in config.toml).
    #[serde(default)]
    pub basic: BasicConfig,

    /// Default Google OAuth client used when a credential carries none.
    #[serde(default)]
    pub google: GoogleDefaults,

    /// Optional raw OpenAI reverse proxy.
    #[serde(default)]
    pub openai: OpenaiPassthroughConfig,

    /// Runtime-tunable defaults (see `tunables` table in config.toml).
    #[serde(default)]
    pub tunables: Tunables,
}

const DEFAULT_CONFIG_FILE: &str = "config.toml";

impl Config {
    /// Builds a Figment that merges defaults and a config TOML file.
    pub fn figment() -> Figment {
        let figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if PathBuf::from(DEFAULT_CONFIG_FILE).is_file() {
            figment.merge(Toml::file(DEFAULT_CONFIG_FILE))
        } else {
            figment
        }
    }

    /// Loads configuration by merging defaults and `config.toml` if present.
    ///
    /// Note: this does **not** validate required fields like
    /// `basic.secret_key`. The server binary should call
    /// [`Config::from_toml`] instead to avoid running with insecure defaults.
    pub fn from_optional_toml() -> Self {
        Self::figment().extract().unwrap_or_else(|err| {
            panic!("failed to extract configuration (defaults + optional config.toml): {err}")
        })
    }

    /// Loads configuration from the TOML file (with defaults) and validates
    /// required fields.
    pub fn from_toml() -> Self {
        if !PathBuf::from(DEFAULT_CONFIG_FILE).is_file() {
            panic!("config file not found: {}", DEFAULT_CONFIG_FILE);
        }
        let cfg: Self = Self::figment().extract().unwrap_or_else(|err| {
            panic!(
                "failed to extract configuration from {}: {err}",
                DEFAULT_CONFIG_FILE
            )
        });
        if cfg.basic.secret_key.trim().is_empty() {
            panic!("basic.secret_key must be set and non-empty");
        }
        cfg
    }
}
