use std::env;
use std::time::Duration;

use clap::ValueEnum;
use overleash_lib::storage::redis::DEFAULT_CHANNEL;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("unable to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid reload interval {0:?}, expected minutes or a value like 30s, 5m, 1h")]
    Reload(String),
}

/// Top-level overleash.toml configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServeConfig {
    #[serde(default)]
    pub upstream: String,
    /// Comma separated upstream tokens. The first one is the primary.
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_reload")]
    pub reload: String,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub register: bool,
    #[serde(default)]
    pub streamer: bool,
    #[serde(default)]
    pub delta: bool,
    #[serde(default)]
    pub webhook: bool,
    #[serde(default = "default_true")]
    pub enable_frontend_api: bool,
    #[serde(default = "default_true")]
    pub backup: bool,
    #[serde(default)]
    pub prometheus_metrics: bool,
    #[serde(default = "default_storage")]
    pub storage: StorageBackend,
    #[serde(default = "default_redis_address")]
    pub redis_address: String,
    #[serde(default)]
    pub redis_password: Option<String>,
    #[serde(default)]
    pub redis_db: i64,
    #[serde(default = "default_redis_channel")]
    pub redis_channel: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    File,
    Null,
    Redis,
}

/// Flags of the `serve` command. Each one given on the command line wins
/// over the file and the environment.
#[derive(clap::Args, Debug, Default)]
pub struct ServeArgs {
    /// Path to config file
    #[arg(short = 'c', long = "config", env = "OVERLEASH_CONFIG", default_value = "overleash.toml")]
    pub config: String,

    /// Base URL of the upstream feature service
    #[arg(short = 'u', long = "upstream")]
    pub upstream: Option<String>,

    /// Comma separated upstream tokens
    #[arg(short = 't', long = "token")]
    pub token: Option<String>,

    /// Address to listen on, e.g. 0.0.0.0:5433
    #[arg(short = 'l', long = "listen-address")]
    pub listen_address: Option<String>,

    /// Polling interval: minutes, or a value like 30s, 5m, 1h. 0 disables polling
    #[arg(short = 'r', long = "reload")]
    pub reload: Option<String>,

    /// Log at debug level
    #[arg(short = 'v', long = "verbose", num_args = 0..=1, default_missing_value = "true")]
    pub verbose: Option<bool>,

    /// Register with upstream at startup
    #[arg(long = "register", num_args = 0..=1, default_missing_value = "true")]
    pub register: Option<bool>,

    /// Serve the streaming endpoint
    #[arg(long = "streamer", num_args = 0..=1, default_missing_value = "true")]
    pub streamer: Option<bool>,

    /// Consume upstream deltas instead of polling
    #[arg(long = "delta", num_args = 0..=1, default_missing_value = "true")]
    pub delta: Option<bool>,

    /// Accept refresh webhooks
    #[arg(long = "webhook", num_args = 0..=1, default_missing_value = "true")]
    pub webhook: Option<bool>,

    /// Serve the frontend API
    #[arg(long = "enable-frontend-api", num_args = 0..=1, default_missing_value = "true")]
    pub enable_frontend_api: Option<bool>,

    /// Keep a backup of every fetched snapshot
    #[arg(long = "backup", num_args = 0..=1, default_missing_value = "true")]
    pub backup: Option<bool>,

    /// Expose prometheus metrics on /metrics
    #[arg(long = "prometheus-metrics", num_args = 0..=1, default_missing_value = "true")]
    pub prometheus_metrics: Option<bool>,

    /// Where overrides are persisted
    #[arg(short = 's', long = "storage", value_enum)]
    pub storage: Option<StorageBackend>,

    #[arg(long = "redis-address")]
    pub redis_address: Option<String>,

    #[arg(long = "redis-password")]
    pub redis_password: Option<String>,

    #[arg(long = "redis-db")]
    pub redis_db: Option<i64>,

    #[arg(long = "redis-channel")]
    pub redis_channel: Option<String>,
}

// ── Default value functions ──────────────────────────

fn default_listen_address() -> String {
    "0.0.0.0:5433".to_string()
}

fn default_reload() -> String {
    "0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_storage() -> StorageBackend {
    StorageBackend::File
}

fn default_redis_address() -> String {
    "localhost:6379".to_string()
}

fn default_redis_channel() -> String {
    DEFAULT_CHANNEL.to_string()
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            upstream: String::new(),
            token: String::new(),
            listen_address: default_listen_address(),
            reload: default_reload(),
            verbose: false,
            register: false,
            streamer: false,
            delta: false,
            webhook: false,
            enable_frontend_api: true,
            backup: true,
            prometheus_metrics: false,
            storage: default_storage(),
            redis_address: default_redis_address(),
            redis_password: None,
            redis_db: 0,
            redis_channel: default_redis_channel(),
        }
    }
}

impl ServeConfig {
    /// Loads configuration from a TOML file. A missing file yields the
    /// defaults.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_string(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.to_string(),
                source,
            }),
        }
    }

    /// Apply `OVERLEASH_*` environment variables to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_env(|key| env::var(key).ok());
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let string = |key: &str, target: &mut String| {
            if let Some(val) = lookup(key) {
                *target = val;
            }
        };

        string("OVERLEASH_UPSTREAM", &mut self.upstream);
        string("OVERLEASH_TOKEN", &mut self.token);
        string("OVERLEASH_LISTEN_ADDRESS", &mut self.listen_address);
        string("OVERLEASH_RELOAD", &mut self.reload);
        string("OVERLEASH_REDIS_ADDRESS", &mut self.redis_address);
        string("OVERLEASH_REDIS_CHANNEL", &mut self.redis_channel);

        let flag = |key: &str, target: &mut bool| {
            if let Some(val) = lookup(key) {
                match parse_bool(&val) {
                    Some(b) => *target = b,
                    None => warn!(key, value = %val, "ignoring non-boolean environment value"),
                }
            }
        };

        flag("OVERLEASH_VERBOSE", &mut self.verbose);
        flag("OVERLEASH_REGISTER", &mut self.register);
        flag("OVERLEASH_STREAMER", &mut self.streamer);
        flag("OVERLEASH_DELTA", &mut self.delta);
        flag("OVERLEASH_WEBHOOK", &mut self.webhook);
        flag("OVERLEASH_ENABLE_FRONTEND_API", &mut self.enable_frontend_api);
        flag("OVERLEASH_BACKUP", &mut self.backup);
        flag("OVERLEASH_PROMETHEUS_METRICS", &mut self.prometheus_metrics);

        if let Some(val) = lookup("OVERLEASH_STORAGE") {
            match StorageBackend::from_str(&val, true) {
                Ok(storage) => self.storage = storage,
                Err(_) => warn!(value = %val, "unknown OVERLEASH_STORAGE value"),
            }
        }

        if let Some(val) = lookup("OVERLEASH_REDIS_PASSWORD") {
            self.redis_password = Some(val).filter(|p| !p.is_empty());
        }

        if let Some(val) = lookup("OVERLEASH_REDIS_DB") {
            match val.trim().parse::<i64>() {
                Ok(db) => self.redis_db = db,
                Err(_) => warn!(value = %val, "ignoring non-numeric OVERLEASH_REDIS_DB"),
            }
        }
    }

    /// Apply command line flags to the configuration.
    pub fn apply_cli(&mut self, args: &ServeArgs) {
        fn set<T: Clone>(source: &Option<T>, target: &mut T) {
            if let Some(val) = source {
                *target = val.clone();
            }
        }

        set(&args.upstream, &mut self.upstream);
        set(&args.token, &mut self.token);
        set(&args.listen_address, &mut self.listen_address);
        set(&args.reload, &mut self.reload);
        set(&args.verbose, &mut self.verbose);
        set(&args.register, &mut self.register);
        set(&args.streamer, &mut self.streamer);
        set(&args.delta, &mut self.delta);
        set(&args.webhook, &mut self.webhook);
        set(&args.enable_frontend_api, &mut self.enable_frontend_api);
        set(&args.backup, &mut self.backup);
        set(&args.prometheus_metrics, &mut self.prometheus_metrics);
        set(&args.storage, &mut self.storage);
        set(&args.redis_address, &mut self.redis_address);
        set(&args.redis_db, &mut self.redis_db);
        set(&args.redis_channel, &mut self.redis_channel);
        if args.redis_password.is_some() {
            self.redis_password = args.redis_password.clone();
        }
    }

    pub fn reload_interval(&self) -> Result<Duration, ConfigError> {
        parse_reload(&self.reload)
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parses a polling interval. A bare number counts minutes.
pub fn parse_reload(raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Duration::ZERO);
    }

    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::Reload(raw.to_string()))?;

    let seconds = match unit.trim() {
        "" | "m" | "min" => value * 60,
        "s" => value,
        "h" => value * 3600,
        _ => return Err(ConfigError::Reload(raw.to_string())),
    };
    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServeConfig::default();
        assert_eq!(config.listen_address, "0.0.0.0:5433");
        assert_eq!(config.storage, StorageBackend::File);
        assert_eq!(config.redis_channel, "overrides-updates");
        assert!(config.backup);
        assert!(config.enable_frontend_api);
        assert_eq!(config.reload_interval().unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ServeConfig::load("/nonexistent/overleash.toml").unwrap();
        assert_eq!(config, ServeConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "upstream = \"https://flags.example.com\"\ntoken = \"*:dev.a,*:prod.b\"\nstreamer = true\nstorage = \"redis\"\nreload = \"5m\""
        )
        .unwrap();

        let config = ServeConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.upstream, "https://flags.example.com");
        assert!(config.streamer);
        assert_eq!(config.storage, StorageBackend::Redis);
        assert_eq!(config.reload_interval().unwrap(), Duration::from_secs(300));
        assert_eq!(config.listen_address, "0.0.0.0:5433");
    }

    #[test]
    fn test_unparseable_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "streamer = \"sometimes\"").unwrap();
        assert!(matches!(
            ServeConfig::load(file.path().to_str().unwrap()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_env_overrides_file() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("OVERLEASH_TOKEN", "*:dev.a"),
            ("OVERLEASH_DELTA", "yes"),
            ("OVERLEASH_BACKUP", "false"),
            ("OVERLEASH_STORAGE", "NULL"),
            ("OVERLEASH_REDIS_DB", "3"),
            ("OVERLEASH_WEBHOOK", "maybe"),
        ]);

        let mut config = ServeConfig {
            webhook: true,
            ..Default::default()
        };
        config.apply_env(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.token, "*:dev.a");
        assert!(config.delta);
        assert!(!config.backup);
        assert_eq!(config.storage, StorageBackend::Null);
        assert_eq!(config.redis_db, 3);
        assert!(config.webhook);
    }

    #[test]
    fn test_cli_overrides_env() {
        let mut config = ServeConfig::default();
        config.apply_env(|key| (key == "OVERLEASH_LISTEN_ADDRESS").then(|| "127.0.0.1:1".to_string()));

        let args = ServeArgs {
            listen_address: Some("127.0.0.1:2".into()),
            streamer: Some(true),
            ..Default::default()
        };
        config.apply_cli(&args);

        assert_eq!(config.listen_address, "127.0.0.1:2");
        assert!(config.streamer);
        assert!(config.backup);
    }

    #[test]
    fn test_parse_reload() {
        assert_eq!(parse_reload("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_reload("2").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_reload("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_reload("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_reload("soon").is_err());
        assert!(parse_reload("5d").is_err());
    }
}
