//! Per-model price statistics shared by both collectors.

use std::collections::HashSet;

use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use vast_market::{group_by_gpu, stats3, OfferStats, TypedOffer};

use super::{FloatGauge, PriceRangeLabels, StatsLabels, VerifiedRentedLabels};

/// Upper bound (exclusive) of the published price buckets, in cents.
const MAX_BUCKET_CENTS: i64 = 200;
/// Bucket step, in cents.
const BUCKET_STEP_CENTS: i64 = 5;

/// Price gauges per GPU model, with verification and rental status labels,
/// plus marketplace-wide price-per-100-DLPerf gauges.
#[derive(Clone)]
pub struct PriceStatsMetrics {
    median_dollars: Family<StatsLabels, FloatGauge>,
    p10_dollars: Family<StatsLabels, FloatGauge>,
    p90_dollars: Family<StatsLabels, FloatGauge>,
    gpu_count: Family<StatsLabels, Gauge>,
    gpu_count_by_price: Family<PriceRangeLabels, Gauge>,
    per_dlperf_median_dollars: Family<VerifiedRentedLabels, FloatGauge>,
    per_dlperf_p10_dollars: Family<VerifiedRentedLabels, FloatGauge>,
    per_dlperf_p90_dollars: Family<VerifiedRentedLabels, FloatGauge>,
}

impl PriceStatsMetrics {
    /// Creates the families and registers them with the given registry.
    pub fn register(registry: &mut Registry) -> Self {
        let median_dollars = Family::<StatsLabels, FloatGauge>::default();
        registry.register(
            "ondemand_price_median_dollars",
            "Median on-demand price among same-model GPUs",
            median_dollars.clone(),
        );

        let p10_dollars = Family::<StatsLabels, FloatGauge>::default();
        registry.register(
            "ondemand_price_10th_percentile_dollars",
            "10th percentile of on-demand prices among same-model GPUs",
            p10_dollars.clone(),
        );

        let p90_dollars = Family::<StatsLabels, FloatGauge>::default();
        registry.register(
            "ondemand_price_90th_percentile_dollars",
            "90th percentile of on-demand prices among same-model GPUs",
            p90_dollars.clone(),
        );

        let gpu_count = Family::<StatsLabels, Gauge>::default();
        registry.register(
            "gpu_count",
            "Number of GPUs offered on site",
            gpu_count.clone(),
        );

        let gpu_count_by_price = Family::<PriceRangeLabels, Gauge>::default();
        registry.register(
            "gpu_count_by_ondemand_price",
            "Number of GPUs offered on site, grouped by price ranges",
            gpu_count_by_price.clone(),
        );

        let per_dlperf_median_dollars = Family::<VerifiedRentedLabels, FloatGauge>::default();
        registry.register(
            "ondemand_price_per_100dlperf_median_dollars",
            "Median on-demand price of 100 DLPerf points",
            per_dlperf_median_dollars.clone(),
        );

        let per_dlperf_p10_dollars = Family::<VerifiedRentedLabels, FloatGauge>::default();
        registry.register(
            "ondemand_price_per_100dlperf_10th_percentile_dollars",
            "10th percentile of on-demand prices of 100 DLPerf points",
            per_dlperf_p10_dollars.clone(),
        );

        let per_dlperf_p90_dollars = Family::<VerifiedRentedLabels, FloatGauge>::default();
        registry.register(
            "ondemand_price_per_100dlperf_90th_percentile_dollars",
            "90th percentile of on-demand prices of 100 DLPerf points",
            per_dlperf_p90_dollars.clone(),
        );

        Self {
            median_dollars,
            p10_dollars,
            p90_dollars,
            gpu_count,
            gpu_count_by_price,
            per_dlperf_median_dollars,
            per_dlperf_p10_dollars,
            per_dlperf_p90_dollars,
        }
    }

    /// Recomputes every price gauge from the current machine list.
    ///
    /// With a `gpu_filter`, per-model gauges are limited to those models
    /// (the account collector only reports models its machines carry); the
    /// price-per-DLPerf gauges always cover the whole list. Families are
    /// rebuilt wholesale so stale models and NaN cells disappear.
    pub fn update(&self, machines: &[TypedOffer], gpu_filter: Option<&HashSet<String>>) {
        self.median_dollars.clear();
        self.p10_dollars.clear();
        self.p90_dollars.clear();
        self.gpu_count.clear();
        self.gpu_count_by_price.clear();

        for (gpu_name, offers) in group_by_gpu(machines) {
            if let Some(filter) = gpu_filter {
                if !filter.contains(&gpu_name) {
                    continue;
                }
            }
            let stats = stats3(&offers, false);
            // Counts only make sense on the definite rental cells; the "any"
            // and column totals would double-count GPUs.
            self.update_cell(&gpu_name, "yes", "yes", &stats.rented.verified, true);
            self.update_cell(&gpu_name, "no", "yes", &stats.rented.unverified, true);
            self.update_cell(&gpu_name, "any", "yes", &stats.rented.all, false);
            self.update_cell(&gpu_name, "yes", "no", &stats.available.verified, true);
            self.update_cell(&gpu_name, "no", "no", &stats.available.unverified, true);
            self.update_cell(&gpu_name, "any", "no", &stats.available.all, false);
            self.update_cell(&gpu_name, "yes", "any", &stats.all.verified, false);
            self.update_cell(&gpu_name, "no", "any", &stats.all.unverified, false);
            self.update_cell(&gpu_name, "any", "any", &stats.all.all, false);
        }

        self.per_dlperf_median_dollars.clear();
        self.per_dlperf_p10_dollars.clear();
        self.per_dlperf_p90_dollars.clear();

        let dlperf = stats3(machines, true);
        let cells = [
            ("yes", "yes", &dlperf.rented.verified),
            ("no", "yes", &dlperf.rented.unverified),
            ("any", "yes", &dlperf.rented.all),
            ("yes", "no", &dlperf.available.verified),
            ("no", "no", &dlperf.available.unverified),
            ("any", "no", &dlperf.available.all),
            ("yes", "any", &dlperf.all.verified),
            ("no", "any", &dlperf.all.unverified),
            ("any", "any", &dlperf.all.all),
        ];
        for (verified, rented, stats) in cells {
            let labels = VerifiedRentedLabels {
                verified: verified.to_string(),
                rented: rented.to_string(),
            };
            if !stats.median.is_nan() {
                self.per_dlperf_median_dollars
                    .get_or_create(&labels)
                    .set(stats.median / 100.0);
            }
            if !stats.percentile_low.is_nan() && !stats.percentile_high.is_nan() {
                self.per_dlperf_p10_dollars
                    .get_or_create(&labels)
                    .set(stats.percentile_low / 100.0);
                self.per_dlperf_p90_dollars
                    .get_or_create(&labels)
                    .set(stats.percentile_high / 100.0);
            }
        }
    }

    fn update_cell(
        &self,
        gpu_name: &str,
        verified: &str,
        rented: &str,
        stats: &OfferStats,
        need_count: bool,
    ) {
        let labels = StatsLabels {
            gpu_name: gpu_name.to_string(),
            verified: verified.to_string(),
            rented: rented.to_string(),
        };

        if need_count {
            self.gpu_count.get_or_create(&labels).set(stats.count as i64);
        }
        if !stats.median.is_nan() {
            self.median_dollars
                .get_or_create(&labels)
                .set(stats.median / 100.0);
        }
        if !stats.percentile_low.is_nan() && !stats.percentile_high.is_nan() {
            self.p10_dollars
                .get_or_create(&labels)
                .set(stats.percentile_low / 100.0);
            self.p90_dollars
                .get_or_create(&labels)
                .set(stats.percentile_high / 100.0);
        }

        if need_count && !stats.count_by_price_range.is_empty() {
            let min_upper = *stats.count_by_price_range.keys().next().unwrap();
            let max_upper = *stats.count_by_price_range.keys().next_back().unwrap();
            let mut upper = BUCKET_STEP_CENTS;
            while upper < MAX_BUCKET_CENTS {
                if upper >= min_upper && upper <= max_upper {
                    let count = stats.count_by_price_range.get(&upper).copied().unwrap_or(0);
                    let labels = PriceRangeLabels {
                        gpu_name: gpu_name.to_string(),
                        verified: verified.to_string(),
                        rented: rented.to_string(),
                        upper: format!("{:.2}", upper as f64 / 100.0),
                    };
                    self.gpu_count_by_price.get_or_create(&labels).set(count as i64);
                }
                upper += BUCKET_STEP_CENTS;
            }
        }
    }
}
