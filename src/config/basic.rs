use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr};

/// Basic (core) configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BasicConfig {
    /// HTTP server listen address (e.g., "0.0.0.0", "127.0.0.1").
    /// TOML: `basic.listen_addr`. Default: `0.0.0.0`.
    #[serde(default = "default_listen_ip")]
    pub listen_addr: IpAddr,

    /// HTTP server listen port.
    /// TOML: `basic.listen_port`. Default: `8188`.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Database URL for SQLite.
    /// TOML: `basic.database_url`. Default: `sqlite://castor.db`.
    #[serde(default)]
    pub database_url: String,

    /// Log level for tracing subscriber initialization.
    /// TOML: `basic.loglevel`. Default: `info`.
    #[serde(default)]
    pub loglevel: String,

    /// Process secret: derives the vault key and signs session tokens
    /// (required, non-empty).
    /// TOML: `basic.secret_key`. Must be provided.
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_string_lax")]
    pub secret_key: String,

    /// Username of the bootstrap admin account created on first start.
    #[serde(default = "default_admin_username")]
    pub admin_username: String,

    /// Password of the bootstrap admin account. Empty disables bootstrap.
    #[serde(default)]
    pub admin_password: String,

    /// Optional forward proxy for all upstream HTTP clients.
    #[serde(default)]
    pub proxy: Option<url::Url>,
}

impl Default for BasicConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_ip(),
            listen_port: default_listen_port(),
            database_url: "sqlite://castor.db".to_string(),
            loglevel: "info".to_string(),
            // No insecure default. `Config::from_toml()` enforces non-empty.
            secret_key: String::new(),
            admin_username: default_admin_username(),
            admin_password: String::new(),
            proxy: None,
        }
    }
}

/// Google OAuth client defaults (the Gemini CLI public client).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GoogleDefaults {
    #[serde(default = "default_google_client_id")]
    pub client_id: String,
    #[serde(default = "default_google_client_secret")]
    pub client_secret: String,
}

impl Default for GoogleDefaults {
    fn default() -> Self {
        Self {
            client_id: default_google_client_id(),
            client_secret: default_google_client_secret(),
        }
    }
}

/// Raw OpenAI reverse-proxy settings; inactive while `api_key` is empty.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenaiPassthroughConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_openai_api_base")]
    pub api_base: String,
}

impl Default for OpenaiPassthroughConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: default_openai_api_base(),
        }
    }
}

impl OpenaiPassthroughConfig {
    pub fn enabled(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

fn deserialize_string_lax<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;

    match v {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom(
            "expected a string or a number for basic.secret_key",
        )),
    }
}

/// Default IP address for the HTTP server listen address.
fn default_listen_ip() -> IpAddr {
    Ipv4Addr::new(0, 0, 0, 0).into()
}

/// Default port for the HTTP server.
fn default_listen_port() -> u16 {
    8188
}

fn default_admin_username() -> String {
    "admin".to_string()
}

fn default_google_client_id() -> String {
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com".to_string()
}

fn default_google_client_secret() -> String {
    "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".to_string()
}

fn default_openai_api_base() -> String {
    "https://api.openai.com".to_string()
}
