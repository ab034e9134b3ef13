//! Gateway configuration.
//!
//! Configuration is loaded from environment variables once at startup and
//! shared as `Arc<Config>`. The room token is redacted in Debug output.

use common::config::ObservabilityConfig;
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default local control socket bind address.
pub const DEFAULT_LOCAL_BIND_ADDRESS: &str = "127.0.0.1:12301";

/// Default health/metrics endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "127.0.0.1:12302";

/// Default keepalive ping period in seconds.
pub const DEFAULT_PING_SECONDS: u64 = 30;

/// Smallest accepted keepalive ping period in seconds.
pub const MIN_PING_SECONDS: u64 = 30;

/// Default per-device registration tick in seconds.
pub const DEFAULT_REGISTRATION_INTERVAL_SECONDS: u64 = 20;

/// Default control-link retry delay in seconds (fixed, not exponential).
pub const DEFAULT_RECONNECT_DELAY_SECONDS: u64 = 10;

/// Default hub tick in seconds.
pub const DEFAULT_HUB_TICK_SECONDS: u64 = 60;

/// Default connect/read timeout of the built-in probe in milliseconds.
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3000;

/// Default ICE server list.
pub const DEFAULT_ICE_SERVERS: &str = "stun:stun.l.google.com:19302";

/// Default gateway instance ID prefix.
pub const DEFAULT_GATEWAY_ID_PREFIX: &str = "gw";

/// One STUN/TURN server handed to the media engine.
#[derive(Clone, PartialEq, Eq)]
pub struct IceServer {
    pub uri: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for IceServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IceServer")
            .field("uri", &self.uri)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Gateway configuration.
#[derive(Clone)]
pub struct Config {
    /// Control server base URL (`ws://` or `wss://`), without trailing slash.
    pub server_url: String,

    /// SQLite database holding device records and settings.
    pub db_path: PathBuf,

    /// Recording root; each device records under `<rec_dir>/<id>`.
    pub rec_dir: PathBuf,

    /// Login credential seed, used when storage has no room token yet.
    pub room_token: Option<SecretString>,

    /// Local control socket bind address (default: "127.0.0.1:12301").
    pub local_bind_address: String,

    /// Health endpoint bind address (default: "127.0.0.1:12302").
    pub health_bind_address: String,

    /// Keepalive ping period for every socket.
    pub ping_period: Duration,

    /// Per-device periodic registration tick.
    pub registration_interval: Duration,

    /// Fixed delay between control-link attempts.
    pub reconnect_delay: Duration,

    /// Hub periodic tick.
    pub hub_tick: Duration,

    /// Connect/read timeout of the built-in probe.
    pub probe_timeout: Duration,

    /// STUN/TURN servers.
    pub ice_servers: Vec<IceServer>,

    /// Unique identifier for this gateway instance.
    pub gateway_id: String,

    /// Log filter and format.
    pub observability: ObservabilityConfig,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("server_url", &self.server_url)
            .field("db_path", &self.db_path)
            .field("rec_dir", &self.rec_dir)
            .field(
                "room_token",
                &self.room_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("local_bind_address", &self.local_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("ping_period", &self.ping_period)
            .field("registration_interval", &self.registration_interval)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("hub_tick", &self.hub_tick)
            .field("probe_timeout", &self.probe_timeout)
            .field("ice_servers", &self.ice_servers)
            .field("gateway_id", &self.gateway_id)
            .field("observability", &self.observability)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let server_url = required(vars, "GATEWAY_SERVER_URL")?
            .trim_end_matches('/')
            .to_string();
        if !(server_url.starts_with("ws://") || server_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(format!(
                "GATEWAY_SERVER_URL must start with ws:// or wss://, got {server_url}"
            )));
        }

        let db_path = PathBuf::from(required(vars, "GATEWAY_DB_PATH")?);
        let rec_dir = PathBuf::from(required(vars, "GATEWAY_REC_DIR")?);

        let room_token = vars
            .get("GATEWAY_ROOM_TOKEN")
            .filter(|s| !s.is_empty())
            .map(|s| SecretString::from(s.clone()));

        let local_bind_address = vars
            .get("GATEWAY_LOCAL_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LOCAL_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("GATEWAY_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let ping_seconds = parse_u64(vars, "GATEWAY_PING_SECONDS", DEFAULT_PING_SECONDS)?;
        if ping_seconds < MIN_PING_SECONDS {
            return Err(ConfigError::InvalidValue(format!(
                "GATEWAY_PING_SECONDS must be at least {MIN_PING_SECONDS}, got {ping_seconds}"
            )));
        }

        let registration_interval = Duration::from_secs(non_zero(
            "GATEWAY_REGISTRATION_INTERVAL_SECONDS",
            parse_u64(
                vars,
                "GATEWAY_REGISTRATION_INTERVAL_SECONDS",
                DEFAULT_REGISTRATION_INTERVAL_SECONDS,
            )?,
        )?);

        let reconnect_delay = Duration::from_secs(parse_u64(
            vars,
            "GATEWAY_RECONNECT_DELAY_SECONDS",
            DEFAULT_RECONNECT_DELAY_SECONDS,
        )?);

        let hub_tick = Duration::from_secs(non_zero(
            "GATEWAY_HUB_TICK_SECONDS",
            parse_u64(vars, "GATEWAY_HUB_TICK_SECONDS", DEFAULT_HUB_TICK_SECONDS)?,
        )?);

        let probe_timeout = Duration::from_millis(non_zero(
            "GATEWAY_PROBE_TIMEOUT_MS",
            parse_u64(vars, "GATEWAY_PROBE_TIMEOUT_MS", DEFAULT_PROBE_TIMEOUT_MS)?,
        )?);

        let ice_servers = parse_ice_servers(
            vars.get("GATEWAY_ICE_SERVERS")
                .map_or(DEFAULT_ICE_SERVERS, String::as_str),
        )?;

        let gateway_id = vars.get("GATEWAY_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_GATEWAY_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        let observability = ObservabilityConfig {
            log_level: vars
                .get("GATEWAY_LOG_LEVEL")
                .cloned()
                .unwrap_or_else(|| common::config::DEFAULT_LOG_LEVEL.to_string()),
            json_logs: vars
                .get("GATEWAY_LOG_JSON")
                .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1"),
        };

        Ok(Config {
            server_url,
            db_path,
            rec_dir,
            room_token,
            local_bind_address,
            health_bind_address,
            ping_period: Duration::from_secs(ping_seconds),
            registration_interval,
            reconnect_delay,
            hub_tick,
            probe_timeout,
            ice_servers,
            gateway_id,
            observability,
        })
    }

    /// URL of the control link.
    pub fn control_url(&self) -> String {
        format!("{}/one/ctrl", self.server_url)
    }

    /// URL of a signaling socket towards `receiver`.
    pub fn signaling_url(&self, receiver: &str) -> String {
        format!("{}/one/signaling/{receiver}", self.server_url)
    }

    /// Recording prefix handed to the media engine for a device.
    pub fn record_prefix(&self, device_id: &str) -> PathBuf {
        self.rec_dir.join(device_id)
    }

    /// Host part (`host[:port]`) of the control server URL.
    pub fn server_host(&self) -> &str {
        let rest = self
            .server_url
            .split_once("://")
            .map_or(self.server_url.as_str(), |(_, rest)| rest);
        rest.split('/').next().unwrap_or(rest)
    }
}

fn required<'a>(vars: &'a HashMap<String, String>, key: &str) -> Result<&'a str, ConfigError> {
    vars.get(key)
        .filter(|v| !v.is_empty())
        .map(String::as_str)
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn parse_u64(vars: &HashMap<String, String>, key: &str, default: u64) -> Result<u64, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key} must be an integer, got {raw}"))),
    }
}

fn non_zero(key: &str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue(format!("{key} must be positive")));
    }
    Ok(value)
}

/// Parse `uri[|user|pass]` entries separated by commas.
fn parse_ice_servers(raw: &str) -> Result<Vec<IceServer>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.split('|');
            let uri = parts.next().unwrap_or_default().to_string();
            if !(uri.starts_with("stun:") || uri.starts_with("turn:") || uri.starts_with("turns:"))
            {
                return Err(ConfigError::InvalidValue(format!(
                    "GATEWAY_ICE_SERVERS entry must be a stun:/turn: URI, got {uri}"
                )));
            }
            Ok(IceServer {
                uri,
                username: parts.next().unwrap_or_default().to_string(),
                password: parts.next().unwrap_or_default().to_string(),
            })
        })
        .collect()
}
