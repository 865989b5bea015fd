use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use fise::element::Thresholds;

/// Everything the ingester reads at startup. TOML file first, then
/// environment variables named after the dotted option with dots turned
/// into underscores and uppercased (CAPACITY_MONITOR_BASE_INTERVAL and so
/// on); the environment wins. Durations are plain seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: ListenConfig,
    pub auth: AuthConfig,
    pub registry: RegistryConfig,
    pub capacity_monitor: MonitorConfig,
    pub reloader: ReloaderConfig,
    pub selector: SelectorConfig,
    pub finalize: FinalizeConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub tcp: String,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub admin_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub token_refresh_skew: u64,
}

// keep the secret out of any debug-printed config
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("admin_url", &self.admin_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("token_refresh_skew", &self.token_refresh_skew)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub endpoint: String,
    pub max_stale: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub base_interval: u64,
    pub min_interval: u64,
    pub max_interval: u64,
    pub leader_check: u64,
    pub per_se_timeout: u64,
    pub concurrency: usize,
    pub thresholds: ThresholdsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdsConfig {
    pub warning: f64,
    pub critical: f64,
    pub full: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloaderConfig {
    pub enabled: bool,
    pub interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub local_cache_ttl: u64,
    pub min_headroom_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizeConfig {
    pub safety_margin: u64,
    pub phase_max_attempts: u32,
    pub recovery_timeout: u64,
    pub gc_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub drain_timeout: u64,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            tcp: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            admin_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            token_refresh_skew: 300,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            endpoint: "redis://127.0.0.1:6379".to_string(),
            max_stale: 90,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            enabled: true,
            base_interval: 30,
            min_interval: 10,
            max_interval: 120,
            leader_check: 10,
            per_se_timeout: 5,
            concurrency: 16,
            thresholds: ThresholdsConfig::default(),
        }
    }
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        ThresholdsConfig {
            warning: 80.0,
            critical: 90.0,
            full: 98.0,
        }
    }
}

impl Default for ReloaderConfig {
    fn default() -> Self {
        ReloaderConfig {
            enabled: true,
            interval: 60,
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        SelectorConfig {
            local_cache_ttl: 5,
            min_headroom_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        FinalizeConfig {
            safety_margin: 24 * 60 * 60,
            phase_max_attempts: 3,
            recovery_timeout: 30 * 60,
            gc_interval: 60,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        ShutdownConfig { drain_timeout: 10 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: ListenConfig::default(),
            auth: AuthConfig::default(),
            registry: RegistryConfig::default(),
            capacity_monitor: MonitorConfig::default(),
            reloader: ReloaderConfig::default(),
            selector: SelectorConfig::default(),
            finalize: FinalizeConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

// CAPACITY_MONITOR_THRESHOLDS_WARNING -> capacity_monitor.thresholds.warning
// section names contain underscores themselves, so a generic split on "_"
// would shred them; map the known prefixes explicitly instead
fn env_to_key(env: &str) -> Option<String> {
    const SECTIONS: &[(&str, &str)] = &[
        ("CAPACITY_MONITOR_", "capacity_monitor."),
        ("RELOADER_", "reloader."),
        ("SELECTOR_", "selector."),
        ("FINALIZE_", "finalize."),
        ("SHUTDOWN_", "shutdown."),
        ("REGISTRY_", "registry."),
        ("AUTH_", "auth."),
        ("LISTEN_", "listen."),
    ];
    let upper = env.to_ascii_uppercase();
    for (prefix, section) in SECTIONS {
        if let Some(rest) = upper.strip_prefix(prefix) {
            let rest = if let Some(t) = rest.strip_prefix("THRESHOLDS_") {
                format!("thresholds.{}", t.to_ascii_lowercase())
            } else {
                rest.to_ascii_lowercase()
            };
            if rest.is_empty() {
                return None;
            }
            return Some(format!("{section}{rest}"));
        }
    }
    None
}

impl Config {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(
            Env::raw()
                .filter(|key| env_to_key(key.as_str()).is_some())
                .map(|key| env_to_key(key.as_str()).unwrap().into())
                .split("."),
        );
        let config: Config = figment
            .extract()
            .context("could not load configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth.admin_url.is_empty() {
            bail!("auth.admin_url must be set");
        }
        if self.auth.client_id.is_empty() || self.auth.client_secret.is_empty() {
            bail!("auth.client_id and auth.client_secret must be set");
        }
        let m = &self.capacity_monitor;
        if m.min_interval > m.max_interval {
            bail!("capacity_monitor.min_interval exceeds max_interval");
        }
        if m.base_interval < m.min_interval || m.base_interval > m.max_interval {
            bail!("capacity_monitor.base_interval outside [min_interval, max_interval]");
        }
        if m.concurrency == 0 {
            bail!("capacity_monitor.concurrency must be at least 1");
        }
        let t = &m.thresholds;
        if !(t.warning < t.critical && t.critical < t.full && t.full <= 100.0) {
            bail!("capacity_monitor.thresholds must satisfy warning < critical < full <= 100");
        }
        if self.finalize.phase_max_attempts == 0 {
            bail!("finalize.phase_max_attempts must be at least 1");
        }
        Ok(())
    }

    /// The reload interval, already clamped to its documented bounds.
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reloader.interval.clamp(10, 600))
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            warning_percent: self.capacity_monitor.thresholds.warning,
            critical_percent: self.capacity_monitor.thresholds.critical,
            full_percent: self.capacity_monitor.thresholds.full,
            min_headroom_bytes: self.selector.min_headroom_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!("0.0.0.0:8080", c.listen.tcp);
        assert_eq!(300, c.auth.token_refresh_skew);
        assert_eq!(30, c.capacity_monitor.base_interval);
        assert_eq!(10, c.capacity_monitor.min_interval);
        assert_eq!(120, c.capacity_monitor.max_interval);
        assert_eq!(5, c.capacity_monitor.per_se_timeout);
        assert_eq!(16, c.capacity_monitor.concurrency);
        assert_eq!(80.0, c.capacity_monitor.thresholds.warning);
        assert_eq!(90.0, c.capacity_monitor.thresholds.critical);
        assert_eq!(98.0, c.capacity_monitor.thresholds.full);
        assert_eq!(60, c.reloader.interval);
        assert_eq!(5, c.selector.local_cache_ttl);
        assert_eq!(64 * 1024 * 1024, c.selector.min_headroom_bytes);
        assert_eq!(24 * 60 * 60, c.finalize.safety_margin);
        assert_eq!(3, c.finalize.phase_max_attempts);
        assert_eq!(30 * 60, c.finalize.recovery_timeout);
        assert_eq!(10, c.shutdown.drain_timeout);
    }

    #[test]
    fn env_key_mapping() {
        assert_eq!(
            Some("capacity_monitor.base_interval".to_string()),
            env_to_key("CAPACITY_MONITOR_BASE_INTERVAL")
        );
        assert_eq!(
            Some("capacity_monitor.thresholds.warning".to_string()),
            env_to_key("CAPACITY_MONITOR_THRESHOLDS_WARNING")
        );
        assert_eq!(
            Some("auth.client_secret".to_string()),
            env_to_key("AUTH_CLIENT_SECRET")
        );
        assert_eq!(
            Some("reloader.interval".to_string()),
            env_to_key("RELOADER_INTERVAL")
        );
        // unrelated environment noise is dropped entirely
        assert_eq!(None, env_to_key("PATH"));
        assert_eq!(None, env_to_key("HOME"));
        assert_eq!(None, env_to_key("AUTH_"));
    }

    #[test]
    fn reload_interval_is_clamped() {
        let mut c = Config::default();
        c.reloader.interval = 1;
        assert_eq!(Duration::from_secs(10), c.reload_interval());
        c.reloader.interval = 10_000;
        assert_eq!(Duration::from_secs(600), c.reload_interval());
        c.reloader.interval = 45;
        assert_eq!(Duration::from_secs(45), c.reload_interval());
    }

    fn valid() -> Config {
        let mut c = Config::default();
        c.auth.admin_url = "http://admin:8000".to_string();
        c.auth.client_id = "ingester".to_string();
        c.auth.client_secret = "secret".to_string();
        c
    }

    #[test]
    fn validation_requires_credentials() {
        assert!(Config::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validation_rejects_inverted_intervals() {
        let mut c = valid();
        c.capacity_monitor.min_interval = 200;
        assert!(c.validate().is_err());
    }

    #[test]
    fn validation_rejects_bad_thresholds() {
        let mut c = valid();
        c.capacity_monitor.thresholds.warning = 95.0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn file_and_env_layering() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "fi.toml",
                r#"
                    [auth]
                    admin_url = "http://admin:8000"
                    client_id = "ingester"
                    client_secret = "from-file"

                    [capacity_monitor]
                    base_interval = 20
                "#,
            )?;
            jail.set_env("AUTH_CLIENT_SECRET", "from-env");
            jail.set_env("CAPACITY_MONITOR_MAX_INTERVAL", "240");
            let c = Config::load(Some(Path::new("fi.toml"))).unwrap();
            assert_eq!("from-env", c.auth.client_secret);
            assert_eq!(20, c.capacity_monitor.base_interval);
            assert_eq!(240, c.capacity_monitor.max_interval);
            // untouched values keep their defaults
            assert_eq!(10, c.capacity_monitor.min_interval);
            Ok(())
        });
    }
}
