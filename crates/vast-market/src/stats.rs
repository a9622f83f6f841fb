//! Price statistics over typed offer lists.
//!
//! A price stream expands each offer into `num_gpus` copies of its per-GPU
//! price (in cents), so every statistic is weighted by GPU capacity rather
//! than by offer count.

use std::collections::BTreeMap;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::typed::{
    filter_available, filter_rented, filter_unverified, filter_verified, TypedOffer, TypedOffers,
};

/// Width of one price histogram bucket, in cents.
const PRICE_BUCKET_CENTS: i64 = 5;

/// Statistics over one price stream. Prices are integer cents; the median
/// and percentiles are NaN when the stream is empty.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferStats {
    pub count: usize,
    pub median: f64,
    pub percentile_low: f64,
    pub percentile_high: f64,
    /// GPU count per price bucket, keyed by the bucket's upper bound in
    /// cents. Only non-empty buckets are present.
    pub count_by_price_range: BTreeMap<i64, usize>,
}

/// Stats split by host verification status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfferStats2 {
    pub verified: OfferStats,
    pub unverified: OfferStats,
    pub all: OfferStats,
}

/// Stats split by rental status, then by verification status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfferStats3 {
    pub rented: OfferStats2,
    pub available: OfferStats2,
    pub all: OfferStats2,
}

/// Capability summary for one GPU model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuInfo {
    pub vram: f64,
    pub dlperf: f64,
    pub tflops: f64,
}

/// Groups offers by GPU model name.
pub fn group_by_gpu(offers: &[TypedOffer]) -> BTreeMap<String, TypedOffers> {
    let mut grouped: BTreeMap<String, TypedOffers> = BTreeMap::new();
    for offer in offers {
        if !offer.gpu_name.is_empty() {
            grouped.entry(offer.gpu_name.clone()).or_default().push(offer.clone());
        }
    }
    grouped
}

/// Expands offers into a per-GPU price stream, in cents.
///
/// In `per_dlperf` mode the stream carries the price of 100 DLPerf points
/// instead; offers without a usable DLPerf score are left out.
fn price_stream(offers: &[TypedOffer], per_dlperf: bool) -> Vec<f64> {
    let mut prices = Vec::new();
    for offer in offers {
        let price = if per_dlperf {
            if offer.dlperf_per_gpu_chunk <= 0.0 || !offer.dlperf_per_gpu_chunk.is_finite() {
                continue;
            }
            (offer.price_per_gpu as f64 * 100.0 / offer.dlperf_per_gpu_chunk).floor()
        } else {
            offer.price_per_gpu as f64
        };
        for _ in 0..offer.num_gpus {
            prices.push(price);
        }
    }
    prices
}

/// Nearest-rank percentile of a sorted, non-empty sample.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil().max(1.0) as usize;
    sorted[rank.min(sorted.len()) - 1]
}

/// Computes [`OfferStats`] over a set of offers.
pub fn stats(offers: &[TypedOffer], per_dlperf: bool) -> OfferStats {
    let mut prices = price_stream(offers, per_dlperf);
    prices.sort_by(f64::total_cmp);

    let mut result = OfferStats {
        count: prices.len(),
        median: f64::NAN,
        percentile_low: f64::NAN,
        percentile_high: f64::NAN,
        count_by_price_range: BTreeMap::new(),
    };
    if prices.is_empty() {
        return result;
    }

    result.median = percentile(&prices, 50.0);
    result.percentile_low = percentile(&prices, 10.0);
    result.percentile_high = percentile(&prices, 90.0);
    for price in &prices {
        let upper = ((price / PRICE_BUCKET_CENTS as f64).ceil() * PRICE_BUCKET_CENTS as f64) as i64;
        *result.count_by_price_range.entry(upper).or_default() += 1;
    }
    result
}

/// Stats over {verified, unverified, all}.
pub fn stats2(offers: &[TypedOffer], per_dlperf: bool) -> OfferStats2 {
    OfferStats2 {
        verified: stats(&filter_verified(offers), per_dlperf),
        unverified: stats(&filter_unverified(offers), per_dlperf),
        all: stats(offers, per_dlperf),
    }
}

/// Stats over {rented, available, all} × {verified, unverified, all}.
pub fn stats3(offers: &[TypedOffer], per_dlperf: bool) -> OfferStats3 {
    OfferStats3 {
        rented: stats2(&filter_rented(offers), per_dlperf),
        available: stats2(&filter_available(offers), per_dlperf),
        all: stats2(offers, per_dlperf),
    }
}

/// Capability summary for a group of same-model offers.
///
/// VRAM is the maximum seen; DLPerf and TFLOPS use the 90th percentile so a
/// few overclocked outliers do not define the model.
pub fn gpu_info(offers: &[TypedOffer]) -> Option<GpuInfo> {
    if offers.is_empty() {
        return None;
    }

    let vram = offers.iter().map(|o| o.vram).fold(f64::MIN, f64::max);

    let mut dlperf: Vec<f64> = offers.iter().map(|o| o.dlperf_per_gpu_chunk).collect();
    dlperf.sort_by(f64::total_cmp);
    let mut tflops: Vec<f64> = offers.iter().map(|o| o.tflops_per_gpu).collect();
    tflops.sort_by(f64::total_cmp);

    Some(GpuInfo {
        vram,
        dlperf: percentile(&dlperf, 90.0),
        tflops: percentile(&tflops, 90.0),
    })
}

// NaN percentiles would serialize as the literal `null` (or fail outright),
// so the JSON form suppresses them and converts cents to dollars.
impl Serialize for OfferStats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut fields = 1;
        if !self.median.is_nan() {
            fields += 1;
        }
        let both_percentiles = !self.percentile_low.is_nan() && !self.percentile_high.is_nan();
        if both_percentiles {
            fields += 2;
        }

        let mut state = serializer.serialize_struct("OfferStats", fields)?;
        state.serialize_field("count", &self.count)?;
        if !self.median.is_nan() {
            state.serialize_field("price_median", &(self.median / 100.0))?;
        }
        if both_percentiles {
            state.serialize_field("price_10th_percentile", &(self.percentile_low / 100.0))?;
            state.serialize_field("price_90th_percentile", &(self.percentile_high / 100.0))?;
        }
        state.end()
    }
}
