//! Whole-machine reconstruction from fragmented bundle offers.
//!
//! A physical host shows up on the marketplace as many overlapping offers,
//! one per rentable sub-slice. This module groups the fragments per machine,
//! finds the canonical whole-machine record (`gpu_frac == 1`), infers the
//! minimum rentable chunk size, and derives utilization by diffing free GPU
//! identifiers against the machine's full set.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use vast_geo::GeoLocation;

use crate::raw::{RawOffer, RawOffers};

/// Source of IP geolocations for offer enrichment.
///
/// The reconciler is synchronous; callers resolve locations ahead of time
/// (typically from the geolocation cache) and hand them in through this
/// trait.
pub trait LocateIp {
    fn locate(&self, ip: &str) -> Option<GeoLocation>;
}

/// A pre-resolved IP → location table.
#[derive(Debug, Clone, Default)]
pub struct ResolvedLocations(HashMap<String, GeoLocation>);

impl ResolvedLocations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ip: impl Into<String>, location: GeoLocation) {
        self.0.insert(ip.into(), location);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl LocateIp for ResolvedLocations {
    fn locate(&self, ip: &str) -> Option<GeoLocation> {
        self.0.get(ip).cloned()
    }
}

/// Locator that knows nothing; used when geolocation is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLocations;

impl LocateIp for NoLocations {
    fn locate(&self, _ip: &str) -> Option<GeoLocation> {
        None
    }
}

/// Per-offer view of a fragment during reconciliation.
struct Chunk<'a> {
    offer: &'a RawOffer,
    offer_id: i64,
    size: i64,
    frac: f64,
    rentable: bool,
    dlperf: f64,
    gpu_ids: BTreeSet<i64>,
}

/// Compact fragment summary embedded into the whole-machine record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub size: i64,
    #[serde(rename = "offerId")]
    pub offer_id: i64,
    pub rentable: bool,
    pub gpu_ids: Vec<i64>,
}

/// Fields that only make sense on fragments and are not carried over to the
/// reconstructed whole-machine record.
const FRAGMENT_ONLY_FIELDS: &[&str] = &[
    "gpu_frac",            // always 1.0 for whole machines
    "rentable",            // only meaningful per fragment
    "bundle_id",
    "bundled_results",
    "cpu_cores_effective", // equals cpu_cores for whole machines
    "hostname",            // always null
    "id",                  // only meaningful per fragment
    "ask_contract_id",     // equals id
    "instance",
    "search",
    "time_remaining",      // always null
    "time_remaining_isbid",
    "gpu_ids",             // replaced by the derived sorted list
];

/// Reconstructs one enriched record per physical machine from validated
/// fragments.
///
/// Machines whose fragment set has zero or multiple whole-machine offers are
/// skipped for this cycle; when `retain_failed` is set, their record from
/// `prev` (the previous cycle's output) is carried over instead.
///
/// The result is sorted by machine id, newest (largest) first.
pub fn collect_whole_machines(
    offers: &RawOffers,
    prev: &RawOffers,
    retain_failed: bool,
    locator: &impl LocateIp,
) -> RawOffers {
    let prev_by_machine: HashMap<i64, &RawOffer> = prev
        .iter()
        .filter_map(|offer| offer.machine_id().map(|id| (id, offer)))
        .collect();

    let mut grouped: BTreeMap<i64, Vec<&RawOffer>> = BTreeMap::new();
    for offer in offers {
        if let Some(machine_id) = offer.machine_id() {
            grouped.entry(machine_id).or_default().push(offer);
        }
    }

    let mut result: RawOffers = Vec::with_capacity(grouped.len());
    for (machine_id, group) in &grouped {
        match reconcile_machine(*machine_id, group, locator) {
            Some(record) => result.push(record),
            None => {
                if retain_failed {
                    if let Some(prior) = prev_by_machine.get(machine_id) {
                        warn!(machine_id, "retaining previous record for machine");
                        result.push((*prior).clone());
                    }
                }
            }
        }
    }

    result.sort_by_key(|offer| std::cmp::Reverse(offer.machine_id().unwrap_or(0)));
    result
}

fn reconcile_machine(
    machine_id: i64,
    group: &[&RawOffer],
    locator: &impl LocateIp,
) -> Option<RawOffer> {
    // Collect chunks from smallest to largest; the offer id tie-break keeps
    // the order stable across cycles.
    let mut chunks: Vec<Chunk<'_>> = group
        .iter()
        .copied()
        .map(|offer| Chunk {
            offer,
            offer_id: offer.id().unwrap_or(0),
            size: offer.num_gpus().unwrap_or(0),
            frac: offer.gpu_frac().unwrap_or(0.0),
            rentable: offer.rentable().unwrap_or(false),
            dlperf: offer.dlperf().unwrap_or(0.0),
            gpu_ids: offer.gpu_ids().into_iter().collect(),
        })
        .collect();
    chunks.sort_by_key(|chunk| chunk.size * 1_000_000_000_000 + chunk.offer_id);

    // Exactly one fragment must cover the whole machine.
    let whole_chunks: Vec<usize> = chunks
        .iter()
        .enumerate()
        .filter(|(_, chunk)| chunk.frac == 1.0)
        .map(|(i, _)| i)
        .collect();
    let whole = match whole_chunks.as_slice() {
        [index] => &chunks[*index],
        [] => {
            warn!(machine_id, "offer list inconsistency: machine has no whole-machine offer");
            return None;
        }
        _ => {
            warn!(machine_id, "offer list inconsistency: machine listed multiple times");
            return None;
        }
    };

    let free_gpu_ids: BTreeSet<i64> = chunks
        .iter()
        .filter(|chunk| chunk.rentable)
        .flat_map(|chunk| chunk.gpu_ids.iter().copied())
        .collect();
    let total_gpus = whole.size;
    let used_gpus = total_gpus - free_gpu_ids.len() as i64;

    // Min chunk size. When the machine size is not a multiple of the real
    // min chunk there is a single smaller remainder chunk in front:
    //   [1 2 2 2 3 4 7] -> 2,  [3 4 7] -> 4,  [1 3 3 3 4 7] -> 3
    // Sets like [2 4 6 8 10] stay ambiguous; the sum check below flags them.
    let mut min_chunk_size = chunks[0].size;
    if chunks.len() >= 3 && chunks[0].size != chunks[1].size {
        min_chunk_size = chunks[1].size;
    }

    // Non-dividable chunks must sum up to the machine size.
    let chunk_gpus: i64 = chunks
        .iter()
        .filter(|chunk| chunk.size <= min_chunk_size)
        .map(|chunk| chunk.size)
        .sum();
    if chunk_gpus != total_gpus {
        let sizes: Vec<i64> = chunks.iter().map(|chunk| chunk.size).collect();
        let offer_ids: Vec<i64> = chunks.iter().map(|chunk| chunk.offer_id).collect();
        warn!(
            machine_id,
            ?sizes,
            ?offer_ids,
            "offer list inconsistency: weird chunk set"
        );
    }

    let summaries: Vec<ChunkSummary> = chunks
        .iter()
        .map(|chunk| ChunkSummary {
            size: chunk.size,
            offer_id: chunk.offer_id,
            rentable: chunk.rentable,
            gpu_ids: chunk.gpu_ids.iter().copied().collect(),
        })
        .collect();

    let mut record = RawOffer::default();
    record.0.insert("num_gpus_rented".into(), Value::from(used_gpus));
    record.0.insert("min_chunk".into(), Value::from(min_chunk_size));
    record.0.insert(
        "chunks".into(),
        serde_json::to_value(&summaries).unwrap_or(Value::Null),
    );
    record.0.insert(
        "gpu_ids".into(),
        Value::from(whole.gpu_ids.iter().copied().collect::<Vec<i64>>()),
    );

    for (key, value) in &whole.offer.0 {
        if !FRAGMENT_ONLY_FIELDS.contains(&key.as_str()) {
            record.0.insert(key.clone(), value.clone());
        }
    }

    if let Some(ip) = whole.offer.public_ipaddr() {
        if let Some(location) = locator.locate(ip) {
            record.0.insert(
                "location".into(),
                serde_json::to_value(&location).unwrap_or(Value::Null),
            );
        }
    }

    // Internet speed is the best measurement across fragments; a machine
    // with no positive measurement gets explicit nulls.
    let max_up = group
        .iter()
        .filter_map(|offer| offer.get_f64("inet_up"))
        .fold(0.0_f64, f64::max);
    let max_down = group
        .iter()
        .filter_map(|offer| offer.get_f64("inet_down"))
        .fold(0.0_f64, f64::max);
    if max_up > 0.0 && max_down > 0.0 {
        record.0.insert("inet_up".into(), finite_number(machine_id, "inet_up", max_up));
        record
            .0
            .insert("inet_down".into(), finite_number(machine_id, "inet_down", max_down));
    } else {
        record.0.insert("inet_up".into(), Value::Null);
        record.0.insert("inet_down".into(), Value::Null);
    }

    // Whole-machine dlperf extrapolated from the average per-GPU score of
    // the minimal chunks.
    let (dlperf_sum, dlperf_gpus) = chunks
        .iter()
        .filter(|chunk| chunk.size <= min_chunk_size)
        .fold((0.0, 0.0), |(sum, count), chunk| {
            (sum + chunk.dlperf, count + chunk.size as f64)
        });
    let dlperf_per_gpu = dlperf_sum / dlperf_gpus;
    record.0.insert(
        "dlperf_chunk".into(),
        finite_number(machine_id, "dlperf_chunk", dlperf_per_gpu * total_gpus as f64),
    );

    Some(record)
}

/// Converts a derived float into a JSON number, replacing NaN and ±Inf with
/// null so no degenerate numeric ever reaches a consumer.
fn finite_number(machine_id: i64, key: &str, value: f64) -> Value {
    match serde_json::Number::from_f64(value) {
        Some(number) if value.is_finite() => Value::Number(number),
        _ => {
            warn!(machine_id, key, value, "non-finite value replaced with null");
            Value::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::tests::offer;
    use serde_json::json;

    struct Fragment {
        id: i64,
        size: i64,
        frac: f64,
        rentable: bool,
        gpu_ids: Vec<i64>,
        dlperf: f64,
    }

    fn fragment(id: i64, size: i64, frac: f64, rentable: bool, gpu_ids: &[i64]) -> Fragment {
        Fragment {
            id,
            size,
            frac,
            rentable,
            gpu_ids: gpu_ids.to_vec(),
            dlperf: 10.0 * size as f64,
        }
    }

    fn machine(machine_id: i64, fragments: &[Fragment]) -> RawOffers {
        fragments
            .iter()
            .map(|f| {
                offer(json!({
                    "machine_id": machine_id,
                    "id": f.id,
                    "num_gpus": f.size,
                    "gpu_frac": f.frac,
                    "rentable": f.rentable,
                    "gpu_ids": f.gpu_ids,
                    "dlperf": f.dlperf,
                }))
            })
            .collect()
    }

    fn collect(offers: &RawOffers) -> RawOffers {
        collect_whole_machines(offers, &Vec::new(), true, &NoLocations)
    }

    /// Seven-GPU machine with two rented GPUs and a remainder chunk of one.
    fn seven_gpu_machine() -> RawOffers {
        machine(
            42,
            &[
                fragment(1, 1, 1.0 / 7.0, true, &[0]),
                fragment(2, 2, 2.0 / 7.0, false, &[1, 2]),
                fragment(3, 2, 2.0 / 7.0, true, &[3, 4]),
                fragment(4, 2, 2.0 / 7.0, true, &[5, 6]),
                fragment(5, 3, 3.0 / 7.0, false, &[0, 1, 2]),
                fragment(6, 4, 4.0 / 7.0, true, &[3, 4, 5, 6]),
                fragment(7, 7, 1.0, false, &[0, 1, 2, 3, 4, 5, 6]),
            ],
        )
    }

    #[test]
    fn remainder_chunk_is_detected() {
        let result = collect(&seven_gpu_machine());
        assert_eq!(result.len(), 1);
        let record = &result[0];
        assert_eq!(record.get_i64("min_chunk"), Some(2));
        assert_eq!(record.num_gpus_rented(), Some(2));
        assert_eq!(record.gpu_ids(), vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn rented_count_plus_free_union_covers_machine() {
        let result = collect(&seven_gpu_machine());
        let record = &result[0];
        let chunks: Vec<ChunkSummary> =
            serde_json::from_value(record.get("chunks").unwrap().clone()).unwrap();
        let free: BTreeSet<i64> = chunks
            .iter()
            .filter(|chunk| chunk.rentable)
            .flat_map(|chunk| chunk.gpu_ids.iter().copied())
            .collect();
        assert_eq!(
            record.num_gpus_rented().unwrap() + free.len() as i64,
            record.num_gpus().unwrap()
        );
    }

    #[test]
    fn min_chunk_without_remainder() {
        let result = collect(&machine(
            7,
            &[
                fragment(1, 3, 3.0 / 7.0, true, &[0, 1, 2]),
                fragment(2, 4, 4.0 / 7.0, true, &[3, 4, 5, 6]),
                fragment(3, 7, 1.0, true, &[0, 1, 2, 3, 4, 5, 6]),
            ],
        ));
        assert_eq!(result[0].get_i64("min_chunk"), Some(4));
    }

    #[test]
    fn min_chunk_with_remainder_of_one() {
        let result = collect(&machine(
            7,
            &[
                fragment(1, 1, 1.0 / 7.0, true, &[6]),
                fragment(2, 3, 3.0 / 7.0, true, &[0, 1, 2]),
                fragment(3, 3, 3.0 / 7.0, true, &[3, 4, 5]),
                fragment(4, 3, 3.0 / 7.0, false, &[0, 1, 2]),
                fragment(5, 4, 4.0 / 7.0, true, &[3, 4, 5, 6]),
                fragment(6, 7, 1.0, true, &[0, 1, 2, 3, 4, 5, 6]),
            ],
        ));
        assert_eq!(result[0].get_i64("min_chunk"), Some(3));
    }

    #[test]
    fn single_whole_chunk_machine() {
        let rentable = collect(&machine(9, &[fragment(1, 4, 1.0, true, &[0, 1, 2, 3])]));
        assert_eq!(rentable[0].num_gpus_rented(), Some(0));
        assert_eq!(rentable[0].get_i64("min_chunk"), Some(4));

        let rented = collect(&machine(9, &[fragment(1, 4, 1.0, false, &[0, 1, 2, 3])]));
        assert_eq!(rented[0].num_gpus_rented(), Some(4));
    }

    #[test]
    fn ambiguous_chunk_set_is_not_dropped() {
        let result = collect(&machine(
            11,
            &[
                fragment(1, 2, 2.0 / 6.0, true, &[0, 1]),
                fragment(2, 4, 4.0 / 6.0, true, &[2, 3, 4, 5]),
                fragment(3, 6, 1.0, true, &[0, 1, 2, 3, 4, 5]),
            ],
        ));
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn zero_or_multiple_whole_chunks_skips_machine() {
        let none = machine(13, &[fragment(1, 2, 0.5, true, &[0, 1])]);
        assert!(collect(&none).is_empty());

        let mut double = machine(13, &[fragment(1, 4, 1.0, true, &[0, 1, 2, 3])]);
        double.extend(machine(13, &[fragment(2, 4, 1.0, true, &[0, 1, 2, 3])]));
        assert!(collect(&double).is_empty());
    }

    #[test]
    fn failed_machine_retains_previous_record() {
        let prev = collect(&machine(13, &[fragment(1, 4, 1.0, true, &[0, 1, 2, 3])]));
        assert_eq!(prev.len(), 1);

        let broken = machine(13, &[fragment(1, 2, 0.5, true, &[0, 1])]);
        let retained = collect_whole_machines(&broken, &prev, true, &NoLocations);
        assert_eq!(retained, prev);

        let dropped = collect_whole_machines(&broken, &prev, false, &NoLocations);
        assert!(dropped.is_empty());
    }

    #[test]
    fn fragment_only_fields_are_stripped() {
        let offers = machine(5, &[fragment(1, 2, 1.0, true, &[0, 1])]);
        let result = collect(&offers);
        let record = &result[0];
        for field in ["gpu_frac", "rentable", "id", "bundle_id", "hostname"] {
            assert!(record.get(field).is_none(), "{field} should be stripped");
        }
        assert_eq!(record.machine_id(), Some(5));
        assert_eq!(record.gpu_name(), Some("RTX 3090"));
    }

    #[test]
    fn dlperf_extrapolates_from_minimal_chunks() {
        // min chunks: [1]@10 and [2]@20 twice -> 70 dlperf over 7 GPUs
        let result = collect(&seven_gpu_machine());
        let dlperf_chunk = result[0].get_f64("dlperf_chunk").unwrap();
        assert!((dlperf_chunk - 70.0).abs() < 1e-9);
    }

    #[test]
    fn inet_speed_is_max_over_fragments_or_null() {
        let mut offers = machine(
            6,
            &[
                fragment(1, 1, 0.5, true, &[0]),
                fragment(2, 2, 1.0, true, &[0, 1]),
            ],
        );
        offers[0].0.insert("inet_up".into(), json!(250.0));
        offers[0].0.insert("inet_down".into(), json!(800.0));
        offers[1].0.insert("inet_up".into(), json!(100.0));
        offers[1].0.insert("inet_down".into(), json!(900.0));

        let record = &collect(&offers)[0];
        assert_eq!(record.get_f64("inet_up"), Some(250.0));
        assert_eq!(record.get_f64("inet_down"), Some(900.0));

        let mut no_up = machine(6, &[fragment(1, 2, 1.0, true, &[0, 1])]);
        no_up[0].0.insert("inet_up".into(), json!(0.0));
        no_up[0].0.insert("inet_down".into(), json!(500.0));
        let record = &collect(&no_up)[0];
        assert_eq!(record.get("inet_up"), Some(&Value::Null));
        assert_eq!(record.get("inet_down"), Some(&Value::Null));
    }

    #[test]
    fn location_is_attached_from_locator() {
        let mut offers = machine(8, &[fragment(1, 2, 1.0, true, &[0, 1])]);
        offers[0]
            .0
            .insert("public_ipaddr".into(), json!("203.0.113.5"));

        let mut locations = ResolvedLocations::new();
        locations.insert(
            "203.0.113.5",
            GeoLocation {
                country: "IS".into(),
                location: "Reykjavik".into(),
                lat: 64.1466,
                long: -21.9426,
                ..GeoLocation::default()
            },
        );

        let record = &collect_whole_machines(&offers, &Vec::new(), true, &locations)[0];
        let location: GeoLocation =
            serde_json::from_value(record.get("location").unwrap().clone()).unwrap();
        assert_eq!(location.country, "IS");

        let record = &collect(&offers)[0];
        assert!(record.get("location").is_none());
    }

    #[test]
    fn output_is_sorted_by_machine_id_descending() {
        let mut offers = machine(1, &[fragment(1, 2, 1.0, true, &[0, 1])]);
        offers.extend(machine(3, &[fragment(2, 2, 1.0, true, &[0, 1])]));
        offers.extend(machine(2, &[fragment(3, 2, 1.0, true, &[0, 1])]));
        let ids: Vec<i64> = collect(&offers)
            .iter()
            .map(|o| o.machine_id().unwrap())
            .collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn non_finite_dlperf_becomes_null() {
        // Whole chunk with zero GPUs forces a 0/0 division.
        let offers = machine(4, &[fragment(1, 0, 1.0, true, &[])]);
        let record = &collect(&offers)[0];
        assert_eq!(record.get("dlperf_chunk"), Some(&Value::Null));
    }
}
