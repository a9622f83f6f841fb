//! The reconciled offer snapshot and its JSON projections.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::MarketError;
use crate::hosts::{collect_hosts, Host, HostMapItem};
use crate::raw::{validate, RawOffer, RawOffers};
use crate::reconcile::{collect_whole_machines, LocateIp};
use crate::stats::{group_by_gpu, gpu_info, stats3, GpuInfo, OfferStats3};
use crate::typed::{decode, TypedOffers};

/// What one poll produced for the reconciler: a timestamp and, when the
/// fetch succeeded, the normalized raw offer list.
#[derive(Debug, Clone)]
pub struct OfferSnapshot {
    pub ts: DateTime<Utc>,
    pub offers: Option<RawOffers>,
}

/// Three consistent views over one cycle's offers: validated fragments,
/// reconstructed whole machines, and the typed projection.
///
/// The cache itself is not synchronized; the owner updates it in place each
/// cycle and publishes clones behind an atomically swapped pointer.
#[derive(Debug, Clone)]
pub struct OfferCache {
    pub raw_offers: RawOffers,
    pub whole_machine_raw_offers: RawOffers,
    pub machines: TypedOffers,
    pub ts: DateTime<Utc>,
    retain_failed: bool,
}

impl Default for OfferCache {
    fn default() -> Self {
        Self::new()
    }
}

impl OfferCache {
    /// An empty cache that retains the previous record of machines failing
    /// reconciliation.
    pub fn new() -> Self {
        Self::with_retention(true)
    }

    /// An empty cache with an explicit retention policy for machines that
    /// fail reconciliation mid-cycle.
    pub fn with_retention(retain_failed: bool) -> Self {
        Self {
            raw_offers: RawOffers::new(),
            whole_machine_raw_offers: RawOffers::new(),
            machines: TypedOffers::new(),
            ts: DateTime::UNIX_EPOCH,
            retain_failed,
        }
    }

    /// Rebuilds the three views from a poll result.
    ///
    /// Always advances `ts`; a snapshot without offers (a failed fetch)
    /// leaves the previous views untouched. Calling this twice with the same
    /// snapshot yields identical views.
    pub fn update_from(&mut self, snapshot: OfferSnapshot, locator: &impl LocateIp) {
        self.ts = snapshot.ts;
        if let Some(offers) = snapshot.offers {
            self.raw_offers = validate(offers);
            self.whole_machine_raw_offers = collect_whole_machines(
                &self.raw_offers,
                &self.whole_machine_raw_offers,
                self.retain_failed,
                locator,
            );
            self.machines = decode(&self.whole_machine_raw_offers);
        }
    }

    /// Like [`Self::update_from`], but the very first snapshot must carry
    /// offers; a process that cannot see the marketplace should not start.
    pub fn initial_update_from(
        &mut self,
        snapshot: OfferSnapshot,
        locator: &impl LocateIp,
    ) -> Result<(), MarketError> {
        if snapshot.offers.is_none() {
            return Err(MarketError::NoInitialData);
        }
        self.update_from(snapshot, locator);
        Ok(())
    }

    /// JSON body for `/offers`: every validated raw fragment.
    pub fn offers_json(&self) -> Result<String, MarketError> {
        self.raw_offers_json("/offers", "", &self.raw_offers)
    }

    /// JSON body for `/machines`: one record per reconstructed machine.
    pub fn machines_json(&self) -> Result<String, MarketError> {
        self.raw_offers_json(
            "/machines",
            "Sorted from newest to oldest.",
            &self.whole_machine_raw_offers,
        )
    }

    fn raw_offers_json(
        &self,
        url: &str,
        note: &str,
        offers: &[RawOffer],
    ) -> Result<String, MarketError> {
        #[derive(Serialize)]
        struct Envelope<'a> {
            url: &'a str,
            timestamp: DateTime<Utc>,
            count: usize,
            #[serde(skip_serializing_if = "str::is_empty")]
            note: &'a str,
            offers: &'a [RawOffer],
        }
        Ok(serde_json::to_string_pretty(&Envelope {
            url,
            timestamp: self.ts,
            count: offers.len(),
            note,
            offers,
        })?)
    }

    /// JSON body for `/gpu-stats`: per-model price statistics and
    /// capability summaries, most offered models first.
    pub fn gpu_stats_json(&self) -> Result<String, MarketError> {
        #[derive(Serialize)]
        struct Model {
            name: String,
            stats: OfferStats3,
            info: GpuInfo,
        }
        #[derive(Serialize)]
        struct Envelope<'a> {
            url: &'a str,
            timestamp: DateTime<Utc>,
            note: &'a str,
            models: Vec<Model>,
        }

        let mut models: Vec<Model> = group_by_gpu(&self.machines)
            .into_iter()
            .filter_map(|(name, offers)| {
                let info = gpu_info(&offers)?;
                Some(Model {
                    name,
                    stats: stats3(&offers, false),
                    info,
                })
            })
            .collect();
        models.sort_by(|a, b| {
            b.stats
                .all
                .all
                .count
                .cmp(&a.stats.all.all.count)
                .then_with(|| a.name.cmp(&b.name))
        });

        Ok(serde_json::to_string_pretty(&Envelope {
            url: "/gpu-stats",
            timestamp: self.ts,
            note: "Sorted from most to least popular.",
            models,
        })?)
    }

    /// JSON body for `/hosts`: host-level aggregation.
    pub fn hosts_json(&self) -> Result<String, MarketError> {
        #[derive(Serialize)]
        struct Envelope<'a> {
            url: &'a str,
            timestamp: DateTime<Utc>,
            count: usize,
            note: &'a str,
            hosts: Vec<Host>,
        }
        let hosts = collect_hosts(&self.whole_machine_raw_offers);
        Ok(serde_json::to_string_pretty(&Envelope {
            url: "/hosts",
            timestamp: self.ts,
            count: hosts.len(),
            note: "Sorted by total TFLOPS (largest first). \
                   Hosts with multiple geo locations are split into multiple records.",
            hosts,
        })?)
    }

    /// JSON body for `/host-map-data`: one item per located host.
    pub fn host_map_json(&self) -> Result<String, MarketError> {
        #[derive(Serialize)]
        struct Envelope {
            items: Vec<HostMapItem>,
        }
        let items = collect_hosts(&self.whole_machine_raw_offers)
            .iter()
            .filter_map(Host::map_item)
            .collect();
        Ok(serde_json::to_string_pretty(&Envelope { items })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::tests::offer;
    use crate::reconcile::NoLocations;
    use serde_json::json;

    fn fragment(machine_id: i64, id: i64, size: i64, frac: f64) -> RawOffer {
        offer(json!({
            "machine_id": machine_id,
            "id": id,
            "num_gpus": size,
            "gpu_frac": frac,
            "gpu_ids": (0..size).collect::<Vec<i64>>(),
        }))
    }

    fn sample_offers() -> RawOffers {
        vec![
            fragment(1, 10, 2, 1.0),
            fragment(2, 20, 4, 1.0),
            fragment(2, 21, 2, 0.5),
        ]
    }

    fn snapshot(offers: Option<RawOffers>) -> OfferSnapshot {
        OfferSnapshot {
            ts: "2024-05-01T12:00:00Z".parse().unwrap(),
            offers,
        }
    }

    #[test]
    fn initial_update_requires_offers() {
        let mut cache = OfferCache::new();
        assert!(matches!(
            cache.initial_update_from(snapshot(None), &NoLocations),
            Err(MarketError::NoInitialData)
        ));
        assert!(cache
            .initial_update_from(snapshot(Some(Vec::new())), &NoLocations)
            .is_ok());
        assert!(cache.machines.is_empty());
    }

    #[test]
    fn update_without_offers_keeps_views_but_advances_ts() {
        let mut cache = OfferCache::new();
        cache.update_from(snapshot(Some(sample_offers())), &NoLocations);
        assert_eq!(cache.machines.len(), 2);

        let later = OfferSnapshot {
            ts: "2024-05-01T12:01:00Z".parse().unwrap(),
            offers: None,
        };
        cache.update_from(later.clone(), &NoLocations);
        assert_eq!(cache.machines.len(), 2);
        assert_eq!(cache.ts, later.ts);
    }

    #[test]
    fn repeated_update_is_deterministic() {
        let mut cache = OfferCache::new();
        cache.update_from(snapshot(Some(sample_offers())), &NoLocations);
        let first = cache.machines_json().unwrap();
        cache.update_from(snapshot(Some(sample_offers())), &NoLocations);
        let second = cache.machines_json().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn failed_machine_is_retained_across_cycles() {
        let mut cache = OfferCache::new();
        cache.update_from(snapshot(Some(sample_offers())), &NoLocations);

        // machine 2 loses its whole-machine fragment
        let broken = vec![fragment(1, 10, 2, 1.0), fragment(2, 21, 2, 0.5)];
        cache.update_from(snapshot(Some(broken.clone())), &NoLocations);
        let ids: Vec<i64> = cache
            .whole_machine_raw_offers
            .iter()
            .map(|o| o.machine_id().unwrap())
            .collect();
        assert_eq!(ids, vec![2, 1]);

        let mut dropping = OfferCache::with_retention(false);
        dropping.update_from(snapshot(Some(sample_offers())), &NoLocations);
        dropping.update_from(snapshot(Some(broken)), &NoLocations);
        let ids: Vec<i64> = dropping
            .whole_machine_raw_offers
            .iter()
            .map(|o| o.machine_id().unwrap())
            .collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn offers_envelope_shape() {
        let mut cache = OfferCache::new();
        cache.update_from(snapshot(Some(sample_offers())), &NoLocations);

        let body: serde_json::Value =
            serde_json::from_str(&cache.offers_json().unwrap()).unwrap();
        assert_eq!(body["url"], "/offers");
        assert_eq!(body["count"], 3);
        assert_eq!(body["offers"].as_array().unwrap().len(), 3);
        assert!(body.get("note").is_none());
        assert_eq!(body["timestamp"], "2024-05-01T12:00:00Z");
    }

    #[test]
    fn machines_envelope_is_sorted_newest_first() {
        let mut cache = OfferCache::new();
        cache.update_from(snapshot(Some(sample_offers())), &NoLocations);

        let body: serde_json::Value =
            serde_json::from_str(&cache.machines_json().unwrap()).unwrap();
        assert_eq!(body["url"], "/machines");
        assert_eq!(body["note"], "Sorted from newest to oldest.");
        let machines = body["offers"].as_array().unwrap();
        assert_eq!(machines[0]["machine_id"], 2);
        assert_eq!(machines[1]["machine_id"], 1);
    }

    #[test]
    fn gpu_stats_envelope_sorts_by_popularity() {
        let mut offers = sample_offers();
        offers.push(offer(json!({
            "machine_id": 3,
            "id": 30,
            "gpu_name": "A100 SXM4",
            "num_gpus": 8,
            "gpu_frac": 1.0,
            "gpu_ids": [0, 1, 2, 3, 4, 5, 6, 7],
        })));
        let mut cache = OfferCache::new();
        cache.update_from(snapshot(Some(offers)), &NoLocations);

        let body: serde_json::Value =
            serde_json::from_str(&cache.gpu_stats_json().unwrap()).unwrap();
        let models = body["models"].as_array().unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0]["name"], "A100 SXM4");
        assert_eq!(models[0]["stats"]["all"]["all"]["count"], 8);
        assert!(models[0]["info"]["vram"].is_number());
    }

    #[test]
    fn hosts_and_map_envelopes() {
        let mut cache = OfferCache::new();
        cache.update_from(snapshot(Some(sample_offers())), &NoLocations);

        let body: serde_json::Value =
            serde_json::from_str(&cache.hosts_json().unwrap()).unwrap();
        assert_eq!(body["url"], "/hosts");
        assert!(body["count"].as_u64().unwrap() >= 1);

        // no geolocation -> nothing to draw on the map
        let map: serde_json::Value =
            serde_json::from_str(&cache.host_map_json().unwrap()).unwrap();
        assert_eq!(map["items"].as_array().unwrap().len(), 0);
    }
}
