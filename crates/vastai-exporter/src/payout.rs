//! Monotone payout tracking with restart-safe persistence.
//!
//! The upstream `current.total` balance dips while a payout settles, which
//! would make the pending-payout gauge saw-tooth. The tracker only publishes
//! strictly monotone changes and persists the last published values so a
//! restart does not regress the series either.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Name of the persisted payout file inside the state directory.
pub const PAYOUT_FILE_NAME: &str = ".vastai_last_payouts";

/// The account's payout state as published to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutInfo {
    pub paid_out: f64,
    pub pending_payout: f64,
    #[serde(default)]
    pub last_payout_time: f64,
}

/// Keeps the last published [`PayoutInfo`] and decides whether a freshly
/// fetched one may be published.
#[derive(Debug)]
pub struct PayoutTracker {
    path: PathBuf,
    last: Option<PayoutInfo>,
}

impl PayoutTracker {
    /// Loads the last persisted payout state from `state_dir`. A missing or
    /// unreadable file just means nothing has been published yet.
    pub fn load(state_dir: &Path) -> Self {
        let path = state_dir.join(PAYOUT_FILE_NAME);
        let last = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(info) => Some(info),
                Err(err) => {
                    warn!(path = %path.display(), %err, "ignoring corrupt payout state");
                    None
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(path = %path.display(), %err, "could not read payout state");
                None
            }
        };
        Self { path, last }
    }

    /// The last published values, if any. Used to seed the gauges at
    /// startup, before the first poll.
    pub fn last(&self) -> Option<PayoutInfo> {
        self.last
    }

    /// Applies a freshly fetched payout state.
    ///
    /// Returns the values to publish when they advanced (first observation,
    /// pending payout grew, or a payout completed); `None` means consumers
    /// keep showing the previously published values.
    pub fn apply(&mut self, new: PayoutInfo) -> Option<PayoutInfo> {
        let advanced = match self.last {
            None => true,
            Some(prev) => new.pending_payout > prev.pending_payout || new.paid_out > prev.paid_out,
        };
        if !advanced {
            debug!("pending payout did not advance; keeping published values");
            return None;
        }

        self.last = Some(new);
        if let Err(err) = self.store(&new) {
            warn!(path = %self.path.display(), %err, "could not persist payout state");
        }
        Some(new)
    }

    fn store(&self, info: &PayoutInfo) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(info).map_err(std::io::Error::other)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, &self.path)
    }
}
