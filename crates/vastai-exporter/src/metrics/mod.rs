//! Prometheus projection of the engine's outputs.
//!
//! Two collectors share the per-model price statistics: the global one
//! covers the whole marketplace, the account one adds the operator's own
//! machines, instances, and payouts. Each owns its registry so `/metrics`
//! and `/metrics/global` can be scraped independently.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::gauge::Gauge;
use std::sync::atomic::AtomicU64;

mod account;
mod global;
mod price_stats;

pub use account::AccountMetrics;
pub use global::GlobalMetrics;
pub use price_stats::PriceStatsMetrics;

/// Gauge carrying a float value (dollars, scores, timestamps).
pub(crate) type FloatGauge = Gauge<f64, AtomicU64>;

/// Content type served for metric expositions.
pub const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Labels of the per-model price statistics cells.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatsLabels {
    pub gpu_name: String,
    /// "yes", "no", or "any".
    pub verified: String,
    /// "yes", "no", or "any".
    pub rented: String,
}

/// [`StatsLabels`] plus the upper bucket bound in dollars.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PriceRangeLabels {
    pub gpu_name: String,
    pub verified: String,
    pub rented: String,
    /// Bucket upper bound formatted as dollars, e.g. "0.25".
    pub upper: String,
}

/// Labels of the marketplace-wide price-per-DLPerf statistics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct VerifiedRentedLabels {
    pub verified: String,
    pub rented: String,
}

/// Per-GPU-model capability labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct GpuModelLabels {
    pub gpu_name: String,
}

/// Labels of per-machine account metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MachineLabels {
    pub machine_id: String,
}

/// Static description of one machine.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MachineInfoLabels {
    pub machine_id: String,
    pub hostname: String,
    pub gpu_name: String,
}

/// Machine internet speed, split by direction ("up"/"down").
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MachineInetLabels {
    pub machine_id: String,
    pub direction: String,
}

/// Rental counters per machine, type, and status.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MachineRentalLabels {
    pub machine_id: String,
    /// "ondemand", "bid", "default", or "my".
    pub rental_type: String,
    /// "running" or "stopped".
    pub rental_status: String,
}

/// GPU usage counters per machine and rental type.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MachineUsedGpuLabels {
    pub machine_id: String,
    pub rental_type: String,
}

/// Labels of per-instance account metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InstanceLabels {
    pub instance_id: String,
    pub machine_id: String,
    pub rental_type: String,
}

/// Static description of one instance.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InstanceInfoLabels {
    pub instance_id: String,
    pub machine_id: String,
    pub rental_type: String,
    pub docker_image: String,
    pub gpu_name: String,
}
