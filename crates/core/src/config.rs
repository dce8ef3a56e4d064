use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_schema_version() -> u32 {
    1
}

/// How long a freshly locked track stays sealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    pub development_mode: bool,
    pub development_lock_days: u32,
    pub production_lock_weeks: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            development_mode: false,
            development_lock_days: 1,
            production_lock_weeks: 4,
        }
    }
}

impl LockConfig {
    pub fn wait_duration(&self) -> Duration {
        if self.development_mode {
            Duration::days(i64::from(self.development_lock_days))
        } else {
            Duration::weeks(i64::from(self.production_lock_weeks))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        i64::try_from(self.interval_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub request_timeout_ms: u64,
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            client_id: "YOUR_SPOTIFY_CLIENT_ID".to_string(),
            client_secret: String::new(),
            redirect_uri: "http://localhost:3000/auth/callback/spotify".to_string(),
            scopes: [
                "user-library-read",
                "playlist-read-private",
                "playlist-modify-public",
                "playlist-modify-private",
                "user-top-read",
                "user-read-recently-played",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub listen_addr: String,
    /// Defaults to the platform data directory when unset.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    pub log_level: String,
    pub lock: LockConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    pub spotify: SpotifyConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            listen_addr: "127.0.0.1:8000".to_string(),
            database_path: None,
            log_level: "info".to_string(),
            lock: LockConfig::default(),
            sweep: SweepConfig::default(),
            spotify: SpotifyConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AppConfig, LockConfig, SweepConfig};
    use chrono::Duration;

    #[test]
    fn wait_duration_follows_the_mode_flag() {
        let mut lock = LockConfig {
            development_mode: true,
            development_lock_days: 7,
            production_lock_weeks: 4,
        };
        assert_eq!(lock.wait_duration(), Duration::days(7));

        lock.development_mode = false;
        assert_eq!(lock.wait_duration(), Duration::weeks(4));
    }

    #[test]
    fn default_config_survives_toml() {
        let text = toml::to_string_pretty(&AppConfig::default()).expect("serialize");
        let parsed: AppConfig = toml::from_str(&text).expect("parse");
        assert_eq!(parsed.sweep.interval_secs, 60);
        assert_eq!(parsed.listen_addr, "127.0.0.1:8000");
        assert!(parsed.database_path.is_none());
    }

    #[test]
    fn oversized_sweep_interval_saturates() {
        let huge = SweepConfig {
            interval_secs: 100_000_000_000_000_000,
        };
        assert_eq!(huge.interval(), Duration::MAX);
        let max = SweepConfig {
            interval_secs: u64::MAX,
        };
        assert_eq!(max.interval(), Duration::MAX);
        assert_eq!(SweepConfig::default().interval(), Duration::seconds(60));
    }
}
