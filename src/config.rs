use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_collection_interval_secs")]
    pub collection_interval_secs: u64,
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub auto_status_chat_id: Option<i64>,
    #[serde(default = "default_auto_status_interval_secs")]
    pub auto_status_interval_secs: u64,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlertsConfig {
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(default = "default_cpu_threshold_percent")]
    pub cpu_threshold_percent: f64,
    #[serde(default = "default_ram_threshold_percent")]
    pub ram_threshold_percent: f64,
    #[serde(default = "default_gpu_threshold_percent")]
    pub gpu_threshold_percent: f64,
    #[serde(default = "default_disk_threshold_percent")]
    pub disk_threshold_percent: f64,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            collection_interval_secs: default_collection_interval_secs(),
            io_timeout_secs: default_io_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            sink: SinkConfig::default(),
            telegram: TelegramConfig::default(),
            alerts: AlertsConfig::default(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bot_token: None,
            allowed_users: Vec::new(),
            auto_status_chat_id: None,
            auto_status_interval_secs: default_auto_status_interval_secs(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            chat_id: None,
            cpu_threshold_percent: default_cpu_threshold_percent(),
            ram_threshold_percent: default_ram_threshold_percent(),
            gpu_threshold_percent: default_gpu_threshold_percent(),
            disk_threshold_percent: default_disk_threshold_percent(),
            check_interval_secs: default_check_interval_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl SinkConfig {
    /// All four connection settings are present and non-empty.
    pub fn is_configured(&self) -> bool {
        [&self.url, &self.token, &self.org, &self.bucket]
            .iter()
            .all(|v| v.as_deref().is_some_and(|s| !s.trim().is_empty()))
    }
}

impl TelegramConfig {
    pub fn token(&self) -> Option<&str> {
        self.bot_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("config validation failed: {0}")]
    Validation(String),
}

impl Config {
    /// YAML file (if any), then process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })
    }

    /// Overlays environment-style keys. Empty values count as unset.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("LISTEN_ADDR") {
            self.listen = v;
        }
        if let Some(v) = get("COLLECTION_INTERVAL") {
            self.collection_interval_secs = parse_var("COLLECTION_INTERVAL", &v)?;
        }
        if let Some(v) = get("IO_TIMEOUT") {
            self.io_timeout_secs = parse_var("IO_TIMEOUT", &v)?;
        }
        if let Some(v) = get("SHUTDOWN_GRACE") {
            self.shutdown_grace_secs = parse_var("SHUTDOWN_GRACE", &v)?;
        }

        if let Some(v) = get("INFLUXDB_URL") {
            self.sink.url = Some(v);
        }
        if let Some(v) = get("INFLUXDB_TOKEN") {
            self.sink.token = Some(v);
        }
        if let Some(v) = get("INFLUXDB_ORG") {
            self.sink.org = Some(v);
        }
        if let Some(v) = get("INFLUXDB_BUCKET") {
            self.sink.bucket = Some(v);
        }

        if let Some(v) = get("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = Some(v);
        }
        if let Some(v) = get("TELEGRAM_ALLOWED_USERS") {
            self.telegram.allowed_users = parse_list(&v);
        }
        if let Some(v) = get("TELEGRAM_AUTO_SEND_CHAT_ID") {
            self.telegram.auto_status_chat_id = Some(parse_var("TELEGRAM_AUTO_SEND_CHAT_ID", &v)?);
        }
        if let Some(v) = get("TELEGRAM_AUTO_SEND_INTERVAL") {
            self.telegram.auto_status_interval_secs = parse_var("TELEGRAM_AUTO_SEND_INTERVAL", &v)?;
        }
        if let Some(v) = get("TELEGRAM_RATE_LIMIT_PER_MINUTE") {
            self.telegram.rate_limit_per_minute = parse_var("TELEGRAM_RATE_LIMIT_PER_MINUTE", &v)?;
        }

        if let Some(v) = get("TELEGRAM_ALERT_CHAT_ID") {
            self.alerts.chat_id = Some(parse_var("TELEGRAM_ALERT_CHAT_ID", &v)?);
        }
        if let Some(v) = get("ALERT_CPU_THRESHOLD") {
            self.alerts.cpu_threshold_percent = parse_var("ALERT_CPU_THRESHOLD", &v)?;
        }
        if let Some(v) = get("ALERT_RAM_THRESHOLD") {
            self.alerts.ram_threshold_percent = parse_var("ALERT_RAM_THRESHOLD", &v)?;
        }
        if let Some(v) = get("ALERT_GPU_THRESHOLD") {
            self.alerts.gpu_threshold_percent = parse_var("ALERT_GPU_THRESHOLD", &v)?;
        }
        if let Some(v) = get("ALERT_DISK_THRESHOLD") {
            self.alerts.disk_threshold_percent = parse_var("ALERT_DISK_THRESHOLD", &v)?;
        }
        if let Some(v) = get("ALERT_CHECK_INTERVAL") {
            self.alerts.check_interval_secs = parse_var("ALERT_CHECK_INTERVAL", &v)?;
        }
        if let Some(v) = get("ALERT_COOLDOWN") {
            self.alerts.cooldown_secs = parse_var("ALERT_COOLDOWN", &v)?;
        }

        Ok(())
    }

    /// `listen` as a socket address, surrounding whitespace ignored.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        SocketAddr::from_str(self.listen.trim()).map_err(|_| {
            ConfigError::Validation("listen must be a valid host:port socket address".to_string())
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        if self.collection_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "collection_interval_secs must be >= 1".to_string(),
            ));
        }
        if self.io_timeout_secs < 1 {
            return Err(ConfigError::Validation(
                "io_timeout_secs must be >= 1".to_string(),
            ));
        }

        validate_telegram(&self.telegram)?;
        validate_alerts(&self.alerts)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_telegram(cfg: &TelegramConfig) -> Result<(), ConfigError> {
    if cfg.rate_limit_per_minute < 1 {
        return Err(ConfigError::Validation(
            "telegram.rate_limit_per_minute must be >= 1".to_string(),
        ));
    }
    if cfg.auto_status_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "telegram.auto_status_interval_secs must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_alerts(cfg: &AlertsConfig) -> Result<(), ConfigError> {
    let thresholds = [
        ("alerts.cpu_threshold_percent", cfg.cpu_threshold_percent),
        ("alerts.ram_threshold_percent", cfg.ram_threshold_percent),
        ("alerts.gpu_threshold_percent", cfg.gpu_threshold_percent),
        ("alerts.disk_threshold_percent", cfg.disk_threshold_percent),
    ];
    for (name, value) in thresholds {
        if !(0.0..=100.0).contains(&value) {
            return Err(ConfigError::Validation(format!(
                "{name} must be within 0..100"
            )));
        }
    }
    if cfg.check_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "alerts.check_interval_secs must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn parse_var<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    })
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_listen() -> String {
    "0.0.0.0:1232".to_string()
}

const fn default_collection_interval_secs() -> u64 {
    10
}

const fn default_io_timeout_secs() -> u64 {
    30
}

const fn default_shutdown_grace_secs() -> u64 {
    10
}

const fn default_true() -> bool {
    true
}

const fn default_auto_status_interval_secs() -> u64 {
    3600
}

const fn default_rate_limit_per_minute() -> u32 {
    30
}

const fn default_cpu_threshold_percent() -> f64 {
    80.0
}

const fn default_ram_threshold_percent() -> f64 {
    85.0
}

const fn default_gpu_threshold_percent() -> f64 {
    90.0
}

const fn default_disk_threshold_percent() -> f64 {
    90.0
}

const fn default_check_interval_secs() -> u64 {
    60
}

const fn default_cooldown_secs() -> u64 {
    300
}
