use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [auth]
//                    session_ttl_secs = 3600
//
//   env var:         TIDE_AUTH__SESSION_TTL_SECS=3600   (double underscore = nesting)
//
//   (single underscore stays within field names: TIDE_EVENTS__HEARTBEAT_SECS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub events: EventsFileConfig,
}

/// Server tuning knobs (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Auth-related tunables (lives under `[auth]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_allow_registration")]
    pub allow_registration: bool,
}

impl Default for AuthFileConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl(),
            allow_registration: default_allow_registration(),
        }
    }
}

/// Event-stream tunables (lives under `[events]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventsFileConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl Default for EventsFileConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

fn default_session_ttl() -> u64 {
    86400
}
fn default_allow_registration() -> bool {
    true
}
fn default_heartbeat_secs() -> u64 {
    30
}

/// Build a figment that layers: struct defaults → config.toml → TIDE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `TIDE_AUTH__SESSION_TTL_SECS=3600`  →  `auth.session_ttl_secs = 3600`
///   `TIDE_EVENTS__HEARTBEAT_SECS=10`    →  `events.heartbeat_secs = 10`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("TIDE_").split("__"))
}

// =============================================================================
// Resolved runtime views
// =============================================================================

/// Filesystem layout: data directory and database location.
#[derive(Clone, Debug)]
pub struct TidepoolConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl TidepoolConfig {
    /// Resolve the data directory (`~/.tidepool` by default) and make sure
    /// it exists.
    pub fn new(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not determine home directory")?
                .join(".tidepool"),
        };

        std::fs::create_dir_all(&data_dir).with_context(|| {
            format!("Failed to create data directory: {}", data_dir.display())
        })?;

        let db_path = data_dir.join("tidepool.db");
        Ok(Self { data_dir, db_path })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }
}

/// Resolved auth configuration.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub session_ttl_secs: u64,
    pub allow_registration: bool,
}

impl AuthConfig {
    pub fn from_file(fc: &AuthFileConfig) -> Self {
        Self {
            session_ttl_secs: fc.session_ttl_secs,
            allow_registration: fc.allow_registration,
        }
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs as i64)
    }
}

/// Resolved event-stream configuration.
#[derive(Clone, Debug)]
pub struct EventsConfig {
    pub heartbeat_interval: Duration,
}

impl EventsConfig {
    pub fn from_file(fc: &EventsFileConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(fc.heartbeat_secs),
        }
    }
}
