// ============================
// crates/backend-lib/src/config.rs
// ============================
//! Configuration management.
use anyhow::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Application settings
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Data directory path
    pub data_dir: PathBuf,
    /// Log level
    pub log_level: String,
    /// Default participant cap applied when a session does not set one
    pub default_max_participants: u32,
    /// Bounded wait for join checks and signaling forwards, in seconds
    pub op_timeout_secs: u64,
    /// Liveness settings for the connection reaper
    pub heartbeat: HeartbeatSettings,
    /// ICE server configuration handed to joining peers
    pub ice: IceSettings,
    /// Request rate limiting
    pub rate_limit: RateLimitSettings,
}

/// Heartbeat / liveness thresholds. Transport close events are not always
/// reliable, so idle connections past the threshold are treated as gone.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatSettings {
    /// How often the reaper sweeps rooms, in seconds
    pub sweep_interval_secs: u64,
    /// No activity for this long means the connection is dead, in seconds
    pub liveness_timeout_secs: u64,
}

/// STUN is always offered; TURN only when credentials are configured.
#[derive(Debug, Clone, Deserialize)]
pub struct IceSettings {
    pub stun_urls: Vec<String>,
    pub turn_url: Option<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

/// Sliding-window rate limit applied to session-mutating requests.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    pub window_ms: u64,
    pub max_requests: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".parse().unwrap(),
            data_dir: PathBuf::from("data"),
            log_level: "info".to_string(),
            default_max_participants: 100,
            op_timeout_secs: 5,
            heartbeat: HeartbeatSettings::default(),
            ice: IceSettings::default(),
            rate_limit: RateLimitSettings::default(),
        }
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            liveness_timeout_secs: 60,
        }
    }
}

impl Default for IceSettings {
    fn default() -> Self {
        Self {
            stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_url: None,
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 120,
        }
    }
}

impl Settings {
    /// Load settings from `config.toml` and `LIVECAST_`-prefixed
    /// environment variables, falling back to defaults per field.
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    /// Load settings from an explicit TOML file path.
    pub fn load_from(path: &str) -> Result<Self> {
        let settings = Figment::from(figment::providers::Serialized::defaults(
            SettingsDefaults::default(),
        ))
        .merge(Toml::file(path))
        .merge(Env::prefixed("LIVECAST_").split("__"))
        .extract()?;

        Ok(settings)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.sweep_interval_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat.liveness_timeout_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit.window_ms)
    }
}

/// Serializable mirror of [`Settings`] used to seed figment with defaults.
#[derive(Debug, serde::Serialize)]
struct SettingsDefaults {
    bind_addr: String,
    data_dir: PathBuf,
    log_level: String,
    default_max_participants: u32,
    op_timeout_secs: u64,
    heartbeat: HeartbeatDefaults,
    ice: IceDefaults,
    rate_limit: RateLimitDefaults,
}

#[derive(Debug, serde::Serialize)]
struct HeartbeatDefaults {
    sweep_interval_secs: u64,
    liveness_timeout_secs: u64,
}

#[derive(Debug, serde::Serialize)]
struct IceDefaults {
    stun_urls: Vec<String>,
    turn_url: Option<String>,
    turn_username: Option<String>,
    turn_credential: Option<String>,
}

#[derive(Debug, serde::Serialize)]
struct RateLimitDefaults {
    window_ms: u64,
    max_requests: u32,
}

impl Default for SettingsDefaults {
    fn default() -> Self {
        let s = Settings::default();
        Self {
            bind_addr: s.bind_addr.to_string(),
            data_dir: s.data_dir,
            log_level: s.log_level,
            default_max_participants: s.default_max_participants,
            op_timeout_secs: s.op_timeout_secs,
            heartbeat: HeartbeatDefaults {
                sweep_interval_secs: s.heartbeat.sweep_interval_secs,
                liveness_timeout_secs: s.heartbeat.liveness_timeout_secs,
            },
            ice: IceDefaults {
                stun_urls: s.ice.stun_urls,
                turn_url: s.ice.turn_url,
                turn_username: s.ice.turn_username,
                turn_credential: s.ice.turn_credential,
            },
            rate_limit: RateLimitDefaults {
                window_ms: s.rate_limit.window_ms,
                max_requests: s.rate_limit.max_requests,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.bind_addr.port(), 3000);
        assert_eq!(settings.default_max_participants, 100);
        assert_eq!(settings.heartbeat.sweep_interval_secs, 30);
        assert_eq!(settings.heartbeat.liveness_timeout_secs, 60);
        assert!(settings.ice.turn_url.is_none());
        assert_eq!(settings.rate_limit.max_requests, 120);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let settings = Settings::load_from("does-not-exist.toml").unwrap();
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.op_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_duration_helpers() {
        let settings = Settings::default();
        assert_eq!(settings.sweep_interval(), Duration::from_secs(30));
        assert_eq!(settings.liveness_timeout(), Duration::from_secs(60));
        assert_eq!(settings.rate_limit_window(), Duration::from_millis(60_000));
    }
}
