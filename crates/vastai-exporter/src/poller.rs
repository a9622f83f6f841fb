//! The refresh loop: fetch, reconcile, aggregate, publish.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use vast_geo::GeoCache;
use vast_market::{OfferCache, OfferSnapshot, RawOffers, ResolvedLocations};

use crate::api::{ApiSnapshot, VastClient};
use crate::payout::PayoutTracker;
use crate::state::AppState;

/// Pause between successive upstream requests within one cycle, out of
/// politeness to the marketplace API.
const API_CALL_GAP: Duration = Duration::from_secs(5);

/// Owns everything a refresh cycle mutates: the master offer cache, the
/// geolocation cache, and the payout tracker. HTTP handlers only ever see
/// the snapshots published into [`AppState`].
pub struct Poller {
    client: VastClient,
    master_url: Option<String>,
    geo: Option<GeoCache>,
    cache: OfferCache,
    tracker: PayoutTracker,
    state: Arc<AppState>,
}

impl Poller {
    pub fn new(
        client: VastClient,
        master_url: Option<String>,
        geo: Option<GeoCache>,
        tracker: PayoutTracker,
        state: Arc<AppState>,
    ) -> Self {
        Self {
            client,
            master_url,
            geo,
            cache: OfferCache::new(),
            tracker,
            state,
        }
    }

    /// First fetch after startup. Unlike regular cycles this one is
    /// all-or-nothing: offers are required, and with an API key the account
    /// views are too. A process that cannot see its data should exit.
    pub async fn bootstrap(&mut self) -> anyhow::Result<()> {
        let mut snapshot = self.fetch().await;

        let locations = self.resolve_locations(&snapshot.offers).await;
        let offers = OfferSnapshot {
            ts: snapshot.ts,
            offers: snapshot.offers.take(),
        };
        self.cache.initial_update_from(offers, &locations)?;
        self.save_geo();

        self.state.publish(self.cache.clone());
        self.state.global.update_from(&self.cache);

        if let Some(account) = &self.state.account {
            if snapshot.machines.is_none()
                || snapshot.instances.is_none()
                || snapshot.payouts.is_none()
            {
                anyhow::bail!("could not read all required data from Vast.ai");
            }
            // Persisted values seed the gauges so a restart does not zero
            // the payout series before the first poll settles.
            if let Some(last) = self.tracker.last() {
                account.set_payouts(last);
            }
            account.update_from(&snapshot, &self.cache);
            if let Some(payouts) = snapshot.payouts {
                if let Some(published) = self.tracker.apply(payouts) {
                    account.set_payouts(published);
                }
            }
            info!(
                raw_offers = self.cache.raw_offers.len(),
                machines = snapshot.machines.as_ref().map(Vec::len).unwrap_or(0),
                instances = snapshot.instances.as_ref().map(Vec::len).unwrap_or(0),
                "initial account data loaded"
            );
        }

        info!(
            raw_offers = self.cache.raw_offers.len(),
            whole_machines = self.cache.whole_machine_raw_offers.len(),
            "initial offer data loaded"
        );
        Ok(())
    }

    /// Runs refresh cycles forever. Cycles never overlap: the interval
    /// elapses between the end of one cycle and the start of the next.
    pub async fn run(mut self, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            self.cycle().await;
        }
    }

    async fn cycle(&mut self) {
        let mut snapshot = self.fetch().await;

        let locations = self.resolve_locations(&snapshot.offers).await;
        self.cache.update_from(
            OfferSnapshot {
                ts: snapshot.ts,
                offers: snapshot.offers.take(),
            },
            &locations,
        );
        self.save_geo();

        self.state.publish(self.cache.clone());
        self.state.global.update_from(&self.cache);

        if let Some(account) = &self.state.account {
            account.update_from(&snapshot, &self.cache);
            if let Some(payouts) = snapshot.payouts {
                if let Some(published) = self.tracker.apply(payouts) {
                    account.set_payouts(published);
                }
            }
        }
    }

    /// Fetches all upstream views for one cycle. Each failed fetch logs and
    /// leaves its sub-view empty; downstream state for that view is then
    /// left unchanged.
    async fn fetch(&self) -> ApiSnapshot {
        let mut snapshot = ApiSnapshot::empty();

        let offers = match &self.master_url {
            Some(master) => self.client.fetch_offers_from_master(master).await,
            None => self.client.fetch_offers().await,
        };
        match offers {
            Ok((ts, offers)) => {
                snapshot.ts = ts;
                snapshot.offers = Some(offers);
            }
            Err(err) => error!(%err, "could not fetch offers"),
        }

        if self.client.has_api_key() {
            tokio::time::sleep(API_CALL_GAP).await;
            match self.client.fetch_machines().await {
                Ok(machines) => snapshot.machines = Some(machines),
                Err(err) => error!(%err, "could not fetch machines"),
            }

            tokio::time::sleep(API_CALL_GAP).await;
            match self.client.fetch_instances().await {
                Ok(instances) => snapshot.instances = Some(instances),
                Err(err) => error!(%err, "could not fetch instances"),
            }

            tokio::time::sleep(API_CALL_GAP).await;
            match self.client.fetch_payouts().await {
                Ok(payouts) => snapshot.payouts = Some(payouts),
                Err(err) => error!(%err, "could not fetch payouts"),
            }
        }

        snapshot
    }

    /// Resolves the distinct public IPs of this cycle's offers through the
    /// geolocation cache, ahead of the synchronous reconciliation.
    async fn resolve_locations(&self, offers: &Option<RawOffers>) -> ResolvedLocations {
        let mut resolved = ResolvedLocations::new();
        let (Some(geo), Some(offers)) = (&self.geo, offers) else {
            return resolved;
        };

        let ips: BTreeSet<&str> = offers.iter().filter_map(|o| o.public_ipaddr()).collect();
        for ip in ips {
            if let Some(location) = geo.locate(ip).await {
                resolved.insert(ip, location);
            }
        }
        resolved
    }

    fn save_geo(&self) {
        if let Some(geo) = &self.geo {
            if let Err(err) = geo.save() {
                warn!(%err, "could not save geolocation cache");
            }
        }
    }
}
