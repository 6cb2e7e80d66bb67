//! Konfiguration aus Umgebungsvariablen
//!
//! Jeder Wert hat einen Default; ungültige Werte führen zu einem Fehler
//! statt stillschweigend den Default zu verwenden.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

// ============================================================================
// DEFAULTS
// ============================================================================

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8787";
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;
pub const DEFAULT_SETUP_TIMEOUT_SECS: u64 = 45;

/// Öffentliche STUN Server (kostenlos, reichen für die meisten Verbindungen)
pub const DEFAULT_STUN_URLS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

// ============================================================================
// RELAY CONFIG
// ============================================================================

/// Konfiguration des Relay-Servers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// Länge der Sende-Queue pro Verbindung; bei Überlauf wird verworfen
    pub outbound_queue: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8787)),
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = parse_or(&lookup, "RELAY_BIND_ADDR", DEFAULT_BIND_ADDR.parse().ok())?;
        let outbound_queue = parse_or(&lookup, "RELAY_OUTBOUND_QUEUE", Some(DEFAULT_OUTBOUND_QUEUE))?;

        if outbound_queue == Some(0) {
            return Err(ConfigError::Invalid {
                key: "RELAY_OUTBOUND_QUEUE",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            bind_addr: bind_addr.unwrap_or_else(|| RelayConfig::default().bind_addr),
            outbound_queue: outbound_queue.unwrap_or(DEFAULT_OUTBOUND_QUEUE),
        })
    }
}

// ============================================================================
// CALL CONFIG
// ============================================================================

/// Konfiguration der clientseitigen Call Engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallConfig {
    /// `None` = kein Timeout für `calling`/`ringing`
    pub setup_timeout: Option<Duration>,
    pub stun_urls: Vec<String>,
    pub recordings_dir: PathBuf,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            setup_timeout: Some(Duration::from_secs(DEFAULT_SETUP_TIMEOUT_SECS)),
            stun_urls: DEFAULT_STUN_URLS.iter().map(|s| s.to_string()).collect(),
            recordings_dir: default_recordings_dir(),
        }
    }
}

impl CallConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = CallConfig::default();

        let timeout_secs: u64 = parse_or(
            &lookup,
            "CALL_SETUP_TIMEOUT_SECS",
            Some(DEFAULT_SETUP_TIMEOUT_SECS),
        )?
        .unwrap_or(DEFAULT_SETUP_TIMEOUT_SECS);

        let stun_urls = match lookup("STUN_URLS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            None => defaults.stun_urls,
        };

        let recordings_dir = lookup("RECORDINGS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.recordings_dir);

        Ok(Self {
            setup_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            stun_urls,
            recordings_dir,
        })
    }
}

/// Download-Verzeichnis des Benutzers, sonst das aktuelle Verzeichnis
fn default_recordings_dir() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Option<T>,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

// ============================================================================
// TESTS
// ============================================================================
