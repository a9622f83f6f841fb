//! Account-scoped collector: the operator's machines, instances, and
//! payouts, on top of the shared price statistics.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tracing::error;

use vast_market::OfferCache;

use crate::api::{ApiSnapshot, Instance, Machine};
use crate::payout::PayoutInfo;

use super::{
    FloatGauge, InstanceInfoLabels, InstanceLabels, MachineInetLabels, MachineInfoLabels,
    MachineLabels, MachineRentalLabels, MachineUsedGpuLabels, PriceStatsMetrics,
};

/// Metrics scoped to the operator's account.
#[derive(Clone)]
pub struct AccountMetrics {
    registry: Arc<RwLock<Registry>>,
    price_stats: PriceStatsMetrics,

    pending_payout_dollars: FloatGauge,
    paid_out_dollars: FloatGauge,
    last_payout_time: FloatGauge,

    machine_info: Family<MachineInfoLabels, Gauge>,
    machine_is_verified: Family<MachineLabels, Gauge>,
    machine_is_listed: Family<MachineLabels, Gauge>,
    machine_is_online: Family<MachineLabels, Gauge>,
    machine_reliability: Family<MachineLabels, FloatGauge>,
    machine_inet_bps: Family<MachineInetLabels, FloatGauge>,
    machine_per_gpu_teraflops: Family<MachineLabels, FloatGauge>,
    machine_per_gpu_dlperf_score: Family<MachineLabels, FloatGauge>,
    machine_ondemand_price_per_gpu_dollars: Family<MachineLabels, FloatGauge>,
    machine_gpu_count: Family<MachineLabels, Gauge>,
    machine_rentals_count: Family<MachineRentalLabels, Gauge>,
    machine_used_gpu_count: Family<MachineUsedGpuLabels, Gauge>,

    instance_info: Family<InstanceInfoLabels, Gauge>,
    instance_is_running: Family<InstanceLabels, Gauge>,
    instance_my_bid_per_gpu_dollars: Family<InstanceLabels, FloatGauge>,
    instance_min_bid_per_gpu_dollars: Family<InstanceLabels, FloatGauge>,
    instance_start_timestamp: Family<InstanceLabels, FloatGauge>,
    instance_gpu_count: Family<InstanceLabels, Gauge>,
    instance_gpu_fraction: Family<InstanceLabels, FloatGauge>,
}

impl Default for AccountMetrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! register_family {
    ($registry:expr, $name:literal, $help:literal, $ty:ty) => {{
        let family = <$ty>::default();
        $registry.register($name, $help, family.clone());
        family
    }};
}

impl AccountMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("vastai");

        let price_stats = PriceStatsMetrics::register(&mut registry);

        let pending_payout_dollars = FloatGauge::default();
        registry.register(
            "pending_payout_dollars",
            "Pending payout (minus service fees)",
            pending_payout_dollars.clone(),
        );
        let paid_out_dollars = FloatGauge::default();
        registry.register(
            "paid_out_dollars",
            "All-time paid out amount (minus service fees)",
            paid_out_dollars.clone(),
        );
        let last_payout_time = FloatGauge::default();
        registry.register(
            "last_payout_time",
            "Unix timestamp of last completed payout",
            last_payout_time.clone(),
        );

        let machine_info = register_family!(
            registry,
            "machine_info",
            "Machine info",
            Family<MachineInfoLabels, Gauge>
        );
        let machine_is_verified = register_family!(
            registry,
            "machine_is_verified",
            "Is machine verified (1) or not (0)",
            Family<MachineLabels, Gauge>
        );
        let machine_is_listed = register_family!(
            registry,
            "machine_is_listed",
            "Is machine listed (1) or not (0)",
            Family<MachineLabels, Gauge>
        );
        let machine_is_online = register_family!(
            registry,
            "machine_is_online",
            "Is machine online (1) or not (0)",
            Family<MachineLabels, Gauge>
        );
        let machine_reliability = register_family!(
            registry,
            "machine_reliability",
            "Reliability indicator (0.0-1.0)",
            Family<MachineLabels, FloatGauge>
        );
        let machine_inet_bps = register_family!(
            registry,
            "machine_inet_bps",
            "Measured internet speed, download or upload (direction = 'up'/'down')",
            Family<MachineInetLabels, FloatGauge>
        );
        let machine_per_gpu_teraflops = register_family!(
            registry,
            "machine_per_gpu_teraflops",
            "Performance in TFLOPS per GPU",
            Family<MachineLabels, FloatGauge>
        );
        let machine_per_gpu_dlperf_score = register_family!(
            registry,
            "machine_per_gpu_dlperf_score",
            "DLPerf score per GPU",
            Family<MachineLabels, FloatGauge>
        );
        let machine_ondemand_price_per_gpu_dollars = register_family!(
            registry,
            "machine_ondemand_price_per_gpu_dollars",
            "Machine on-demand price per GPU/hour",
            Family<MachineLabels, FloatGauge>
        );
        let machine_gpu_count = register_family!(
            registry,
            "machine_gpu_count",
            "Number of GPUs",
            Family<MachineLabels, Gauge>
        );
        let machine_rentals_count = register_family!(
            registry,
            "machine_rentals_count",
            "Count of current rentals (rental_type = 'ondemand'/'bid'/'default'/'my', rental_status = 'running'/'stopped')",
            Family<MachineRentalLabels, Gauge>
        );
        let machine_used_gpu_count = register_family!(
            registry,
            "machine_used_gpu_count",
            "Number of GPUs running jobs (rental_type = 'ondemand'/'bid'/'default'/'my')",
            Family<MachineUsedGpuLabels, Gauge>
        );

        let instance_info = register_family!(
            registry,
            "instance_info",
            "Instance info",
            Family<InstanceInfoLabels, Gauge>
        );
        let instance_is_running = register_family!(
            registry,
            "instance_is_running",
            "Is instance running (1) or stopped/outbid/initializing (0)",
            Family<InstanceLabels, Gauge>
        );
        let instance_my_bid_per_gpu_dollars = register_family!(
            registry,
            "instance_my_bid_per_gpu_dollars",
            "My bid on this instance per GPU/hour",
            Family<InstanceLabels, FloatGauge>
        );
        let instance_min_bid_per_gpu_dollars = register_family!(
            registry,
            "instance_min_bid_per_gpu_dollars",
            "Min bid to outbid this instance per GPU/hour (makes sense if rental_type = 'default'/'bid')",
            Family<InstanceLabels, FloatGauge>
        );
        let instance_start_timestamp = register_family!(
            registry,
            "instance_start_timestamp",
            "Unix timestamp when instance was started",
            Family<InstanceLabels, FloatGauge>
        );
        let instance_gpu_count = register_family!(
            registry,
            "instance_gpu_count",
            "Number of GPUs assigned to this instance",
            Family<InstanceLabels, Gauge>
        );
        let instance_gpu_fraction = register_family!(
            registry,
            "instance_gpu_fraction",
            "Number of GPUs assigned to this instance divided by total number of GPUs on the host",
            Family<InstanceLabels, FloatGauge>
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            price_stats,
            pending_payout_dollars,
            paid_out_dollars,
            last_payout_time,
            machine_info,
            machine_is_verified,
            machine_is_listed,
            machine_is_online,
            machine_reliability,
            machine_inet_bps,
            machine_per_gpu_teraflops,
            machine_per_gpu_dlperf_score,
            machine_ondemand_price_per_gpu_dollars,
            machine_gpu_count,
            machine_rentals_count,
            machine_used_gpu_count,
            instance_info,
            instance_is_running,
            instance_my_bid_per_gpu_dollars,
            instance_min_bid_per_gpu_dollars,
            instance_start_timestamp,
            instance_gpu_count,
            instance_gpu_fraction,
        }
    }

    /// Sets the three payout gauges to the tracker's published values.
    pub fn set_payouts(&self, info: PayoutInfo) {
        self.pending_payout_dollars.set(info.pending_payout);
        self.paid_out_dollars.set(info.paid_out);
        self.last_payout_time.set(info.last_payout_time);
    }

    /// Recomputes the machine and instance gauges from a poll result and the
    /// current offer snapshot. A snapshot without machine data leaves
    /// everything untouched for this cycle.
    pub fn update_from(&self, snapshot: &ApiSnapshot, cache: &OfferCache) {
        let Some(machines) = &snapshot.machines else {
            return;
        };

        let my_gpus: HashSet<String> = machines
            .iter()
            .map(|machine| machine.gpu_name().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        self.price_stats.update(&cache.machines, Some(&my_gpus));

        self.clear_machine_families();
        for machine in machines {
            self.update_machine(machine, snapshot.instances.as_deref(), cache);
        }

        if let Some(instances) = &snapshot.instances {
            let gpu_totals: HashMap<i64, i64> = machines
                .iter()
                .map(|machine| (machine.id, machine.num_gpus))
                .collect();
            self.clear_instance_families();
            for instance in instances {
                if gpu_totals.contains_key(&instance.machine_id) {
                    self.update_instance(instance, &gpu_totals);
                }
            }
        }
    }

    fn clear_machine_families(&self) {
        self.machine_info.clear();
        self.machine_is_verified.clear();
        self.machine_is_listed.clear();
        self.machine_is_online.clear();
        self.machine_reliability.clear();
        self.machine_inet_bps.clear();
        self.machine_per_gpu_teraflops.clear();
        self.machine_per_gpu_dlperf_score.clear();
        self.machine_ondemand_price_per_gpu_dollars.clear();
        self.machine_gpu_count.clear();
        self.machine_rentals_count.clear();
        self.machine_used_gpu_count.clear();
    }

    fn clear_instance_families(&self) {
        self.instance_info.clear();
        self.instance_is_running.clear();
        self.instance_my_bid_per_gpu_dollars.clear();
        self.instance_min_bid_per_gpu_dollars.clear();
        self.instance_start_timestamp.clear();
        self.instance_gpu_count.clear();
        self.instance_gpu_fraction.clear();
    }

    fn update_machine(&self, machine: &Machine, instances: Option<&[Instance]>, cache: &OfferCache) {
        let labels = MachineLabels {
            machine_id: machine.id.to_string(),
        };

        self.machine_info
            .get_or_create(&MachineInfoLabels {
                machine_id: machine.id.to_string(),
                hostname: machine.hostname().to_string(),
                gpu_name: machine.gpu_name().to_string(),
            })
            .set(1);
        self.machine_is_verified
            .get_or_create(&labels)
            .set(machine.is_verified() as i64);
        self.machine_is_listed
            .get_or_create(&labels)
            .set(machine.listed as i64);
        self.machine_is_online
            .get_or_create(&labels)
            .set((machine.timeout == 0.0) as i64);
        self.machine_reliability
            .get_or_create(&labels)
            .set(machine.reliability);

        for (direction, mbps) in [("up", machine.inet_up), ("down", machine.inet_down)] {
            self.machine_inet_bps
                .get_or_create(&MachineInetLabels {
                    machine_id: machine.id.to_string(),
                    direction: direction.to_string(),
                })
                .set(mbps * 1e6);
        }

        if machine.num_gpus > 0 {
            self.machine_per_gpu_teraflops
                .get_or_create(&labels)
                .set(machine.total_flops / machine.num_gpus as f64);
        }

        // The per-GPU DLPerf score comes from the public offer list.
        let dlperf = cache
            .machines
            .iter()
            .find(|offer| offer.machine_id == machine.id)
            .map(|offer| offer.dlperf_per_gpu_chunk)
            .unwrap_or(0.0);
        if dlperf > 0.0 {
            self.machine_per_gpu_dlperf_score
                .get_or_create(&labels)
                .set(dlperf);
        }

        self.machine_ondemand_price_per_gpu_dollars
            .get_or_create(&labels)
            .set(machine.listed_gpu_cost);
        self.machine_gpu_count
            .get_or_create(&labels)
            .set(machine.num_gpus);

        // Split the four upstream rental counters into type x status cells.
        let ondemand_running = machine.current_rentals_running_on_demand;
        let ondemand_stopped = machine.current_rentals_on_demand - ondemand_running;
        let bid_running = machine.current_rentals_running - ondemand_running;
        let bid_stopped =
            machine.current_rentals_resident - machine.current_rentals_on_demand - bid_running;
        for (rental_type, rental_status, count) in [
            ("ondemand", "running", ondemand_running),
            ("ondemand", "stopped", ondemand_stopped),
            ("bid", "running", bid_running),
            ("bid", "stopped", bid_stopped),
        ] {
            self.set_rentals(machine.id, rental_type, rental_status, count);
        }

        let Some(instances) = instances else {
            return;
        };

        let mut default_running = 0;
        let mut default_stopped = 0;
        let mut my_running = 0;
        let mut my_stopped = 0;
        let mut default_used_gpus = 0;
        let mut my_used_gpus = 0;
        for instance in instances {
            if instance.machine_id != machine.id {
                continue;
            }
            match (instance.is_default_job(), instance.is_running()) {
                (true, true) => {
                    default_running += 1;
                    default_used_gpus += instance.num_gpus;
                }
                (true, false) => default_stopped += 1,
                (false, true) => {
                    my_running += 1;
                    my_used_gpus += instance.num_gpus;
                }
                (false, false) => my_stopped += 1,
            }
        }
        self.set_rentals(machine.id, "default", "running", default_running);
        self.set_rentals(machine.id, "default", "stopped", default_stopped);
        self.set_rentals(machine.id, "my", "running", my_running);
        self.set_rentals(machine.id, "my", "stopped", my_stopped);

        let occupancy = machine.gpu_occupancy();
        let ondemand_gpus = occupancy.matches('D').count() as i64;
        let bid_gpus = occupancy.matches('I').count() as i64;
        for (rental_type, count) in [
            ("default", default_used_gpus),
            ("my", my_used_gpus),
            ("bid", bid_gpus),
            ("ondemand", ondemand_gpus),
        ] {
            self.machine_used_gpu_count
                .get_or_create(&MachineUsedGpuLabels {
                    machine_id: machine.id.to_string(),
                    rental_type: rental_type.to_string(),
                })
                .set(count);
        }
    }

    fn set_rentals(&self, machine_id: i64, rental_type: &str, rental_status: &str, count: i64) {
        self.machine_rentals_count
            .get_or_create(&MachineRentalLabels {
                machine_id: machine_id.to_string(),
                rental_type: rental_type.to_string(),
                rental_status: rental_status.to_string(),
            })
            .set(count);
    }

    fn update_instance(&self, instance: &Instance, gpu_totals: &HashMap<i64, i64>) {
        let labels = InstanceLabels {
            instance_id: instance.id.to_string(),
            machine_id: instance.machine_id.to_string(),
            rental_type: instance.rental_type().to_string(),
        };

        self.instance_info
            .get_or_create(&InstanceInfoLabels {
                instance_id: instance.id.to_string(),
                machine_id: instance.machine_id.to_string(),
                rental_type: instance.rental_type().to_string(),
                docker_image: instance.image_uuid.clone().unwrap_or_default(),
                gpu_name: instance.gpu_name.clone().unwrap_or_default(),
            })
            .set(1);
        self.instance_is_running
            .get_or_create(&labels)
            .set(instance.is_running() as i64);
        self.instance_my_bid_per_gpu_dollars
            .get_or_create(&labels)
            .set(instance.dph_base);
        self.instance_min_bid_per_gpu_dollars
            .get_or_create(&labels)
            .set(instance.min_bid);
        self.instance_start_timestamp
            .get_or_create(&labels)
            .set(instance.start_date);
        self.instance_gpu_count
            .get_or_create(&labels)
            .set(instance.num_gpus);
        if let Some(total) = gpu_totals.get(&instance.machine_id) {
            if *total > 0 {
                self.instance_gpu_fraction
                    .get_or_create(&labels)
                    .set(instance.num_gpus as f64 / *total as f64);
            }
        }
    }

    /// Prometheus text exposition of the whole registry.
    pub fn encode(&self) -> String {
        let registry = self.registry.read();
        let mut out = String::new();
        if let Err(err) = encode(&mut out, &registry) {
            error!(%err, "failed to encode account metrics");
            return String::new();
        }
        out
    }
}
