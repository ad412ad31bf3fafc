use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_DISPATCH_INTERVAL_SECS: u64 = 60; // thresholds are minute-granular
pub const DEFAULT_REGION_COOLDOWN_SECS: u64 = 5; // damps re-entrant UI arm calls
pub const DEFAULT_WARNING_LEADS_SECS: [u64; 5] = [3600, 1800, 900, 300, 60];

/// Top-level config (runwatch.toml + RUNWATCH_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunwatchConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub registrar: RegistrarConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub countdown: CountdownConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token required on API calls. `None` leaves the API open.
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Seconds between dispatch ticks.
    #[serde(default = "default_dispatch_interval")]
    pub interval_secs: u64,
    /// Ticks a record may fail transiently (after in-call retries) before it
    /// is marked `error`.
    #[serde(default = "default_max_tick_retries")]
    pub max_tick_retries: u32,
    /// Ask the control API for the live state before each send.
    #[serde(default)]
    pub verify_with_control: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_DISPATCH_INTERVAL_SECS,
            max_tick_retries: default_max_tick_retries(),
            verify_with_control: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Total send attempts per delivery call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// HTTP push relay endpoint. Unset means notifications are only logged.
    pub relay_url: Option<String>,
    pub relay_token: Option<String>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            relay_url: None,
            relay_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrarConfig {
    #[serde(default = "default_region_cooldown")]
    pub region_cooldown_secs: u64,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            region_cooldown_secs: DEFAULT_REGION_COOLDOWN_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Finished or soft-deleted records older than this are purged.
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            max_age_hours: default_max_age_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountdownConfig {
    /// Lead times (seconds before the stop instant) at which local warnings fire.
    #[serde(default = "default_warning_leads")]
    pub warning_leads_secs: Vec<u64>,
    #[serde(default = "default_countdown_db_path")]
    pub db_path: String,
}

impl Default for CountdownConfig {
    fn default() -> Self {
        Self {
            warning_leads_secs: default_warning_leads(),
            db_path: default_countdown_db_path(),
        }
    }
}

/// HTTP endpoint fronting the cloud provider's describe/stop calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Base URL. Unset disables state probing and local auto-stop.
    pub url: Option<String>,
    pub token: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_dispatch_interval() -> u64 {
    DEFAULT_DISPATCH_INTERVAL_SECS
}
fn default_max_tick_retries() -> u32 {
    3
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_cap_ms() -> u64 {
    4_000
}
fn default_region_cooldown() -> u64 {
    DEFAULT_REGION_COOLDOWN_SECS
}
fn default_sweep_interval() -> u64 {
    300
}
fn default_max_age_hours() -> u64 {
    24
}
fn default_warning_leads() -> Vec<u64> {
    DEFAULT_WARNING_LEADS_SECS.to_vec()
}
fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
}
fn default_db_path() -> String {
    format!("{}/.runwatch/runwatch.db", home_dir())
}
fn default_countdown_db_path() -> String {
    format!("{}/.runwatch/countdown.db", home_dir())
}

impl RunwatchConfig {
    /// Load config from a TOML file with RUNWATCH_* env var overrides.
    ///
    /// Path resolution: explicit argument, then `~/.runwatch/runwatch.toml`.
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        tracing::debug!(%path, "loading config");

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::RunwatchError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("RUNWATCH_").split("__"))
    }
}

fn default_config_path() -> String {
    format!("{}/.runwatch/runwatch.toml", home_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RunwatchConfig::default();
        assert_eq!(cfg.dispatch.interval_secs, 60);
        assert_eq!(cfg.delivery.max_attempts, 3);
        assert_eq!(cfg.delivery.backoff_base_ms, 1_000);
        assert_eq!(cfg.delivery.backoff_cap_ms, 4_000);
        assert_eq!(cfg.registrar.region_cooldown_secs, 5);
        assert_eq!(cfg.countdown.warning_leads_secs, vec![3600, 1800, 900, 300, 60]);
        assert!(cfg.server.token.is_none());
        assert!(cfg.control.url.is_none());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let toml = r#"
            [dispatch]
            interval_secs = 30

            [delivery]
            relay_url = "https://push.example/send"
        "#;
        let cfg: RunwatchConfig = Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .unwrap();
        assert_eq!(cfg.dispatch.interval_secs, 30);
        assert_eq!(cfg.dispatch.max_tick_retries, 3);
        assert_eq!(cfg.delivery.relay_url.as_deref(), Some("https://push.example/send"));
        assert_eq!(cfg.delivery.max_attempts, 3);
        assert_eq!(cfg.server.port, DEFAULT_PORT);
    }
}
