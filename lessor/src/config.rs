//! The proxy's configuration file

use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use lessor_axum::UseAutoAuth;
use lessor_cache::{RefreshBehaviour, WhenInconsistent};
use serde::{de, Deserialize, Deserializer};
use thiserror::Error;

/// Where a Kubernetes pod finds its service account token
pub const DEFAULT_SERVICE_ACCOUNT_TOKEN_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/token";

const DEFAULT_LISTEN_PORT: u16 = 8100;

/// An invalid configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("error reading configuration file {}", .path.display())]
    Read {
        /// Path of the configuration file
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML or does not fit the schema
    #[error("error parsing configuration")]
    Parse(#[from] toml::de::Error),
    /// The values are inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Format of log lines
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Standard,
    /// One JSON object per line
    Json,
}

/// The whole configuration file
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Exit once the first token has been obtained
    #[serde(default)]
    pub exit_after_auth: bool,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    pub cache: Option<CacheConfig>,
    pub auto_auth: Option<AutoAuthConfig>,
    #[serde(default)]
    pub api_proxy: ApiProxySection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    pub address: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub address: SocketAddr,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_LISTEN_PORT)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default)]
    pub cache_static_secrets: bool,
    #[serde(default)]
    pub disable_caching_dynamic_secrets: bool,
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub static_secret_token_capability_refresh_interval: Duration,
    #[serde(default, deserialize_with = "from_str")]
    pub static_secret_token_capability_refresh_behaviour: RefreshBehaviour,
    pub persist: Option<PersistConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: PathBuf,
    #[serde(default)]
    pub keep_after_import: bool,
    #[serde(default = "default_true")]
    pub exit_on_err: bool,
    #[serde(default = "default_service_account_token_file")]
    pub service_account_token_file: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoAuthConfig {
    #[serde(default = "default_min_backoff", with = "humantime_serde")]
    pub min_backoff: Duration,
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
    #[serde(default)]
    pub exit_on_err: bool,
    #[serde(default = "default_true")]
    pub enable_reauth_on_new_credentials: bool,
    pub method: MethodConfig,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MethodConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub mount_path: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, with = "humantime_serde")]
    pub wrap_ttl: Duration,
    /// Method specific settings, sent as the login body by generic methods
    #[serde(default)]
    pub config: toml::Table,
}

impl fmt::Debug for MethodConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodConfig")
            .field("kind", &self.kind)
            .field("mount_path", &self.mount_path)
            .field("namespace", &self.namespace)
            .field("wrap_ttl", &self.wrap_ttl)
            .field("config", &self.config.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MethodConfig {
    /// Path of the token file, for the `token_file` method
    pub fn token_file_path(&self) -> Option<&str> {
        self.config
            .get("token_file_path")
            .and_then(toml::Value::as_str)
            .filter(|path| !path.is_empty())
    }

    /// Where a generic method logs in
    pub fn login_path(&self) -> String {
        let mount = self.mount_path.trim_matches('/');
        if mount.is_empty() {
            format!("auth/{}/login", self.kind)
        } else {
            format!("{}/login", mount)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiProxySection {
    /// Unset means "true" when auto-auth is configured
    #[serde(default, deserialize_with = "auto_auth_use")]
    pub use_auto_auth_token: Option<UseAutoAuth>,
    #[serde(default, deserialize_with = "consistency")]
    pub enforce_consistency: bool,
    #[serde(default, deserialize_with = "from_str")]
    pub when_inconsistent: WhenInconsistent,
    #[serde(default)]
    pub prepend_configured_namespace: bool,
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_refresh_interval() -> Duration {
    lessor_cache::capabilities::DEFAULT_REFRESH_INTERVAL
}

fn default_min_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_service_account_token_file() -> PathBuf {
    PathBuf::from(DEFAULT_SERVICE_ACCOUNT_TOKEN_FILE)
}

fn from_str<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(de::Error::custom)
}

fn auto_auth_use<'de, D>(deserializer: D) -> Result<Option<UseAutoAuth>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    let mode = match Flag::deserialize(deserializer)? {
        Flag::Bool(true) => UseAutoAuth::WhenMissing,
        Flag::Bool(false) => UseAutoAuth::Never,
        Flag::Text(text) => text.to_ascii_lowercase().parse().map_err(de::Error::custom)?,
    };
    Ok(Some(mode))
}

fn consistency<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match String::deserialize(deserializer)?.as_str() {
        "always" => Ok(true),
        "never" | "" => Ok(false),
        other => Err(de::Error::custom(format!(
            "unknown consistency enforcement `{}`; expected always or never",
            other
        ))),
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Reads and validates the configuration at `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        text.parse()
    }

    /// How the handler uses the auto-auth token
    pub fn use_auto_auth(&self) -> UseAutoAuth {
        match (self.api_proxy.use_auto_auth_token, &self.auto_auth) {
            (_, None) => UseAutoAuth::Never,
            (Some(mode), Some(_)) => mode,
            (None, Some(_)) => UseAutoAuth::WhenMissing,
        }
    }

    /// Checks values the schema alone cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.address.trim().is_empty() {
            return invalid("upstream.address must not be empty");
        }

        if self.exit_after_auth && self.auto_auth.is_none() {
            return invalid("exit_after_auth requires an auto_auth section");
        }

        if let Some(auto_auth) = &self.auto_auth {
            if auto_auth.min_backoff.is_zero() {
                return invalid("auto_auth.min_backoff must be positive");
            }
            if auto_auth.min_backoff > auto_auth.max_backoff {
                return invalid("auto_auth.min_backoff must not exceed auto_auth.max_backoff");
            }

            let method = &auto_auth.method;
            if method.kind.is_empty() {
                return invalid("auto_auth.method.type must not be empty");
            }
            if method.kind == "token_file" && method.token_file_path().is_none() {
                return invalid("the token_file method requires config.token_file_path");
            }
            if !method.wrap_ttl.is_zero() && self.use_auto_auth() != UseAutoAuth::Never {
                return invalid(
                    "auto_auth.method.wrap_ttl cannot be used with api_proxy.use_auto_auth_token",
                );
            }
        }

        if let Some(cache) = &self.cache {
            if cache.disable_caching_dynamic_secrets && !cache.cache_static_secrets {
                return invalid(
                    "cache.disable_caching_dynamic_secrets requires cache.cache_static_secrets",
                );
            }
            if cache.cache_static_secrets
                && cache.static_secret_token_capability_refresh_interval.is_zero()
            {
                return invalid("cache.static_secret_token_capability_refresh_interval must be positive");
            }

            if let Some(persist) = &cache.persist {
                if persist.kind != "kubernetes" {
                    return invalid(format!(
                        "unsupported cache.persist.type `{}`; only kubernetes is supported",
                        persist.kind
                    ));
                }
                if persist.path.as_os_str().is_empty() {
                    return invalid("cache.persist.path must not be empty");
                }
                if self.auto_auth.is_none() {
                    return invalid("cache.persist requires an auto_auth section");
                }
            }
        }

        Ok(())
    }
}

fn invalid<T>(msg: impl Into<String>) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid(msg.into()))
}
