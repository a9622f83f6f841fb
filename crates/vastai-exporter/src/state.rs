//! Shared state between the refresh loop and the HTTP handlers.

use std::sync::Arc;

use parking_lot::RwLock;

use vast_market::OfferCache;

use crate::metrics::{AccountMetrics, GlobalMetrics};

/// Everything a request handler may touch.
///
/// The offer snapshot is swapped wholesale each cycle: the refresh loop
/// builds a fresh [`OfferCache`] and replaces the `Arc`, handlers clone the
/// `Arc` once at the start of a request. A reader therefore never observes a
/// mix of fields from two cycles.
pub struct AppState {
    snapshot: RwLock<Arc<OfferCache>>,
    pub global: GlobalMetrics,
    /// Present only when an API key is configured.
    pub account: Option<AccountMetrics>,
}

impl AppState {
    pub fn new(global: GlobalMetrics, account: Option<AccountMetrics>) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(OfferCache::new())),
            global,
            account,
        }
    }

    /// Publishes a new snapshot for readers.
    pub fn publish(&self, cache: OfferCache) {
        *self.snapshot.write() = Arc::new(cache);
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<OfferCache> {
        self.snapshot.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vast_market::{NoLocations, OfferSnapshot};

    #[test]
    fn publish_swaps_the_snapshot() {
        let state = AppState::new(GlobalMetrics::new(), None);
        let before = state.snapshot();
        assert!(before.machines.is_empty());

        let mut cache = OfferCache::new();
        cache.update_from(
            OfferSnapshot {
                ts: Utc::now(),
                offers: Some(Vec::new()),
            },
            &NoLocations,
        );
        state.publish(cache);

        let after = state.snapshot();
        assert!(after.ts > before.ts);
        // the old Arc is still a valid, consistent snapshot
        assert!(before.machines.is_empty());
    }
}
