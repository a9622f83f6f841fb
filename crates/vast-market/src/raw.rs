//! Untyped marketplace offer records.
//!
//! The upstream bundle payload has a loose, evolving shape, so offers are
//! kept as string-keyed JSON bags and only the consumed fields get typed
//! accessors. The typed projection for downstream consumers lives in
//! [`crate::typed`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// A single rentable sub-slice of a physical machine, as advertised by the
/// marketplace bundles endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawOffer(pub Map<String, Value>);

/// A list of raw offers.
pub type RawOffers = Vec<RawOffer>;

/// Fields the upstream includes but nothing downstream consumes. Stripped
/// once at ingest to keep the JSON surfaces lean.
const IGNORABLE_FIELDS: &[&str] = &[
    "external",
    "webpage",
    "logo",
    "pending_count",
    "inet_down_billed",
    "inet_up_billed",
    "storage_total_cost",
    "dph_total",
    "rented",
    "is_bid",
];

impl RawOffer {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get_f64(key).map(|v| v as i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn machine_id(&self) -> Option<i64> {
        self.get_i64("machine_id")
    }

    /// The offer id; only meaningful on fragments, never on reconstructed
    /// whole-machine records.
    pub fn id(&self) -> Option<i64> {
        self.get_i64("id")
    }

    pub fn gpu_name(&self) -> Option<&str> {
        self.get_str("gpu_name")
    }

    pub fn num_gpus(&self) -> Option<i64> {
        self.get_i64("num_gpus")
    }

    pub fn num_gpus_rented(&self) -> Option<i64> {
        self.get_i64("num_gpus_rented")
    }

    pub fn gpu_frac(&self) -> Option<f64> {
        self.get_f64("gpu_frac")
    }

    pub fn rentable(&self) -> Option<bool> {
        self.get_bool("rentable")
    }

    pub fn dlperf(&self) -> Option<f64> {
        self.get_f64("dlperf")
    }

    pub fn verified(&self) -> bool {
        self.get_bool("verified").unwrap_or(false)
    }

    pub fn datacenter(&self) -> bool {
        self.get_i64("hosting_type").unwrap_or(0) > 0
    }

    pub fn static_ip(&self) -> bool {
        self.get_bool("static_ip").unwrap_or(false)
    }

    pub fn public_ipaddr(&self) -> Option<&str> {
        self.get_str("public_ipaddr").filter(|ip| !ip.is_empty())
    }

    /// Price of one GPU of the bundle, in integer cents. Integer cents keep
    /// downstream aggregation free of float accumulation error.
    pub fn price_per_gpu(&self) -> Option<i64> {
        let dph_base = self.get_f64("dph_base")?;
        let num_gpus = self.get_f64("num_gpus")?;
        Some((dph_base / num_gpus * 100.0) as i64)
    }

    /// The physical GPU identifiers covered by this fragment, sorted.
    pub fn gpu_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .get("gpu_ids")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_f64).map(|v| v as i64).collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// One-time cleanup applied to every offer at ingest: drop fields nothing
    /// consumes, trim stray whitespace from the public IP, and collapse the
    /// upstream verification string into a boolean.
    pub fn normalize(&mut self) {
        for field in IGNORABLE_FIELDS {
            self.0.remove(*field);
        }
        if let Some(ip) = self.get_str("public_ipaddr").map(str::trim).map(String::from) {
            self.0.insert("public_ipaddr".to_string(), Value::String(ip));
        }
        let verified = self.get_str("verification") == Some("verified");
        self.0.insert("verified".to_string(), Value::Bool(verified));
    }

    /// Whether the offer carries every required field with the right type.
    fn has_required_fields(&self) -> bool {
        self.get_f64("machine_id").is_some()
            && self.get_str("gpu_name").is_some()
            && self.get_f64("num_gpus").is_some()
            && self.get_f64("dph_base").is_some()
            && self.get_bool("rentable").is_some()
            && self.get_f64("gpu_frac").is_some()
    }
}

/// Drops fragments missing any required field, logging each offender.
pub fn validate(offers: RawOffers) -> RawOffers {
    offers
        .into_iter()
        .filter(|offer| {
            if offer.has_required_fields() {
                true
            } else {
                warn!(
                    offer = %serde_json::to_string(offer).unwrap_or_default(),
                    "offer is missing required fields"
                );
                false
            }
        })
        .collect()
}
