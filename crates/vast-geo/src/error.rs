//! Error types for the geolocation cache.

use thiserror::Error;

/// Result type alias for geolocation operations.
pub type GeoResult<T> = Result<T, GeoError>;

/// Errors that can occur while loading or querying the geolocation cache.
#[derive(Debug, Error)]
pub enum GeoError {
    /// The MaxMind credential string is not of the form `USERID:KEY`.
    #[error("invalid MaxMind auth {0:?}: specify user id and license key separated with \":\"")]
    InvalidCredentials(String),

    /// The first entry of the geolocation skip list could not be parsed.
    #[error("invalid skip network {entry:?}: {source}")]
    InvalidSkipNet {
        entry: String,
        source: ipnet::AddrParseError,
    },

    /// Reading or writing the persisted cache file failed.
    #[error("cache file error: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted cache file is not valid JSON.
    #[error("cache file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// The upstream HTTP request failed outright (connect, timeout, decode).
    #[error("geolocation request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream rejected our credentials (401) or the account is out of
    /// funds (402). Callers treat this as sticky until restart.
    #[error("geolocation service rejected credentials (HTTP {0})")]
    AuthRejected(u16),

    /// Any other non-200 upstream status.
    #[error("geolocation service returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },
}

impl GeoError {
    /// True for the auth failures that permanently disable upstream lookups.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthRejected(_))
    }
}
