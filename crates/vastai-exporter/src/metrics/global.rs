//! Marketplace-wide collector.

use std::sync::Arc;

use parking_lot::RwLock;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use tracing::error;

use vast_market::{group_by_gpu, gpu_info, OfferCache};

use super::{FloatGauge, GpuModelLabels, PriceStatsMetrics};

/// Global price statistics and per-model capability gauges.
#[derive(Clone)]
pub struct GlobalMetrics {
    registry: Arc<RwLock<Registry>>,
    price_stats: PriceStatsMetrics,
    gpu_vram_gigabytes: Family<GpuModelLabels, FloatGauge>,
    gpu_teraflops: Family<GpuModelLabels, FloatGauge>,
    gpu_dlperf_score: Family<GpuModelLabels, FloatGauge>,
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("vastai");

        let price_stats = PriceStatsMetrics::register(&mut registry);

        let gpu_vram_gigabytes = Family::<GpuModelLabels, FloatGauge>::default();
        registry.register(
            "gpu_vram_gigabytes",
            "VRAM amount of the GPU model",
            gpu_vram_gigabytes.clone(),
        );

        let gpu_teraflops = Family::<GpuModelLabels, FloatGauge>::default();
        registry.register(
            "gpu_teraflops",
            "TFLOPS performance of the GPU model",
            gpu_teraflops.clone(),
        );

        let gpu_dlperf_score = Family::<GpuModelLabels, FloatGauge>::default();
        registry.register(
            "gpu_dlperf_score",
            "DLPerf score of the GPU model",
            gpu_dlperf_score.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            price_stats,
            gpu_vram_gigabytes,
            gpu_teraflops,
            gpu_dlperf_score,
        }
    }

    /// Recomputes all gauges from the current snapshot.
    pub fn update_from(&self, cache: &OfferCache) {
        self.price_stats.update(&cache.machines, None);

        self.gpu_vram_gigabytes.clear();
        self.gpu_teraflops.clear();
        self.gpu_dlperf_score.clear();
        for (gpu_name, offers) in group_by_gpu(&cache.machines) {
            if let Some(info) = gpu_info(&offers) {
                let labels = GpuModelLabels { gpu_name };
                self.gpu_vram_gigabytes.get_or_create(&labels).set(info.vram);
                self.gpu_teraflops.get_or_create(&labels).set(info.tflops);
                self.gpu_dlperf_score.get_or_create(&labels).set(info.dlperf);
            }
        }
    }

    /// Prometheus text exposition of the whole registry.
    pub fn encode(&self) -> String {
        let registry = self.registry.read();
        let mut out = String::new();
        if let Err(err) = encode(&mut out, &registry) {
            error!(%err, "failed to encode global metrics");
            return String::new();
        }
        out
    }
}
