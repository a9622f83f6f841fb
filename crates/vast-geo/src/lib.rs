//! IP geolocation cache backed by the MaxMind GeoIP2 web service.
//!
//! The cache maps IP address literals to a [`GeoLocation`], refreshing
//! entries through the paid web service at most once per TTL window. Entries
//! are persisted to a state file so restarts do not re-bill every lookup.
//!
//! Lookups for addresses that can never have a useful public location
//! (private ranges, CGNAT, multicast, operator-configured skip networks) are
//! answered negatively without touching the upstream service.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

mod error;
mod maxmind;

pub use error::{GeoError, GeoResult};

/// Name of the persisted cache file inside the state directory.
pub const CACHE_FILE_NAME: &str = ".vastai_geo_cache";

/// How long a cached location stays valid, in seconds.
const ENTRY_TTL_SECS: i64 = 7 * 24 * 3600;
/// Upper bound of the per-entry random expiry jitter, so entries do not all
/// expire in the same cycle.
const ENTRY_TTL_JITTER_SECS: i64 = 3 * 3600;

fn entry_ttl() -> chrono::Duration {
    chrono::Duration::seconds(ENTRY_TTL_SECS)
}

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// A resolved geographic location for one IP address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    /// ISO country code.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub country: String,
    /// Human-readable place name ("City, Subdivision, ...").
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub lat: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub long: f64,
    /// Accuracy radius in kilometers.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub accuracy: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub isp: String,
    /// Set only when it differs from the ISP.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub organization: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

/// One cached lookup result. `location` is `None` for negative answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoCacheEntry {
    pub expires: DateTime<Utc>,
    pub location: Option<GeoLocation>,
}

impl GeoCacheEntry {
    fn expired(&self) -> bool {
        self.expires < Utc::now()
    }
}

/// On-disk representation of the cache.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    entries: HashMap<String, GeoCacheEntry>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, GeoCacheEntry>,
    /// Set after a 401/402 from upstream; no further calls until restart.
    failed: bool,
}

/// TTL-expiring, disk-persisted IP geolocation cache.
pub struct GeoCache {
    cache_path: PathBuf,
    user: String,
    pass: String,
    skip_nets: Vec<IpNet>,
    client: reqwest::Client,
    inner: Mutex<Inner>,
}

impl GeoCache {
    /// Loads the cache from `state_dir`, parsing MaxMind credentials of the
    /// form `USERID:KEY` and an optional comma-separated skip list of IPs
    /// and CIDR networks.
    ///
    /// # Errors
    ///
    /// Fails on malformed credentials, an unreadable or corrupt cache file,
    /// or when the first skip-list entry does not parse. Later skip-list
    /// entries degrade gracefully with an error log.
    pub fn open(state_dir: &Path, credentials: &str, skip_list: &str) -> GeoResult<Self> {
        let (user, pass) = credentials
            .split_once(':')
            .filter(|(user, pass)| !user.is_empty() && !pass.is_empty())
            .ok_or_else(|| GeoError::InvalidCredentials(credentials.to_string()))?;

        let cache_path = state_dir.join(CACHE_FILE_NAME);
        let mut entries = match fs::read(&cache_path) {
            Ok(bytes) => serde_json::from_slice::<CacheFile>(&bytes)?.entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        entries.retain(|_, entry| !entry.expired());
        info!(count = entries.len(), path = %cache_path.display(), "loaded geolocation cache");

        let skip_nets = parse_skip_list(skip_list)?;
        if !skip_nets.is_empty() {
            info!(?skip_nets, "will skip geolocation for configured networks");
        }

        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()?;

        Ok(Self {
            cache_path,
            user: user.to_string(),
            pass: pass.to_string(),
            skip_nets,
            client,
            inner: Mutex::new(Inner {
                entries,
                failed: false,
            }),
        })
    }

    /// Looks up the location for an IP literal.
    ///
    /// Returns `None` for unparseable or non-routable addresses, skip-listed
    /// networks, negative upstream answers, and any upstream failure. A
    /// successful upstream answer is cached with a jittered TTL.
    pub async fn locate(&self, ip: &str) -> Option<GeoLocation> {
        let parsed: IpAddr = match ip.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(ip, "invalid IP address");
                return None;
            }
        };
        if !is_public_unicast(parsed) {
            warn!(ip, "IP address from an invalid range");
            return None;
        }
        if self.skip_nets.iter().any(|net| net.contains(&parsed)) {
            info!(ip, "skipped geolocation for IP");
            return None;
        }

        {
            let inner = self.inner.lock();
            if let Some(entry) = inner.entries.get(ip) {
                if !entry.expired() {
                    return entry.location.clone();
                }
            }
            if inner.failed {
                return None;
            }
        }

        match maxmind::query(&self.client, &self.user, &self.pass, ip).await {
            Ok(Some(location)) => {
                self.inner.lock().entries.insert(
                    ip.to_string(),
                    GeoCacheEntry {
                        expires: jittered_expiry(),
                        location: Some(location.clone()),
                    },
                );
                Some(location)
            }
            // Negative answer: valid, but not worth a cache slot.
            Ok(None) => None,
            Err(err) => {
                if err.is_auth_failure() {
                    error!(%err, "disabling geolocation lookups until restart");
                    self.inner.lock().failed = true;
                } else {
                    error!(ip, %err, "geolocation lookup failed");
                }
                None
            }
        }
    }

    /// Purges expired entries and writes the cache atomically with mode 0600.
    pub fn save(&self) -> GeoResult<()> {
        let file = {
            let mut inner = self.inner.lock();
            inner.entries.retain(|_, entry| !entry.expired());
            CacheFile {
                entries: inner.entries.clone(),
            }
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let tmp = self.cache_path.with_extension("tmp");
        fs::write(&tmp, &json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, &self.cache_path)?;
        Ok(())
    }

    /// Number of cached entries, expired ones included.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True when the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn jittered_expiry() -> DateTime<Utc> {
    let jitter = rand::thread_rng().gen_range(0..ENTRY_TTL_JITTER_SECS);
    Utc::now() + entry_ttl() + chrono::Duration::seconds(jitter)
}

fn parse_skip_list(skip_list: &str) -> GeoResult<Vec<IpNet>> {
    let mut nets = Vec::new();
    for entry in skip_list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let parsed = entry
            .parse::<IpNet>()
            .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from));
        match parsed {
            Ok(net) => nets.push(net),
            Err(_) if nets.is_empty() => {
                return Err(GeoError::InvalidSkipNet {
                    entry: entry.to_string(),
                    source: entry.parse::<IpNet>().unwrap_err(),
                })
            }
            Err(err) => error!(entry, %err, "ignoring unparseable skip network"),
        }
    }
    Ok(nets)
}

/// Whether an address is a globally routable unicast address worth asking
/// the geolocation service about.
fn is_public_unicast(ip: IpAddr) -> bool {
    if ip.is_unspecified() || ip.is_loopback() || ip.is_multicast() {
        return false;
    }
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            // CGNAT 100.64.0.0/10
            let cgnat = octets[0] == 100 && (octets[1] & 0b1100_0000) == 64;
            !(v4.is_private() || v4.is_link_local() || v4.is_broadcast() || cgnat)
        }
        IpAddr::V6(v6) => {
            let seg0 = v6.segments()[0];
            let unique_local = (seg0 & 0xfe00) == 0xfc00;
            let link_local = (seg0 & 0xffc0) == 0xfe80;
            !(unique_local || link_local)
        }
    }
}
