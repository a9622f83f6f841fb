//! Strongly-typed projection of whole-machine records.

use tracing::warn;

use crate::raw::RawOffers;

/// One reconstructed machine, reduced to the fields the statistics engine
/// and the exporters consume.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedOffer {
    pub machine_id: i64,
    pub gpu_name: String,
    pub num_gpus: i64,
    pub num_gpus_rented: i64,
    /// Price of one GPU per hour, in integer cents.
    pub price_per_gpu: i64,
    pub verified: bool,
    pub datacenter: bool,
    pub static_ip: bool,
    /// Per-GPU VRAM in GiB, rounded up.
    pub vram: f64,
    /// Per-GPU DLPerf extrapolated from minimal chunks.
    pub dlperf_per_gpu_chunk: f64,
    /// Per-GPU DLPerf as reported on the whole-machine offer.
    pub dlperf_per_gpu_whole: f64,
    pub tflops_per_gpu: f64,
}

/// A list of typed offers.
pub type TypedOffers = Vec<TypedOffer>;

/// Projects whole-machine records into [`TypedOffer`]s.
///
/// Records without a GPU model name or a positive GPU count carry no usable
/// signal and are skipped.
pub fn decode(offers: &RawOffers) -> TypedOffers {
    let mut result = Vec::with_capacity(offers.len());
    for offer in offers {
        let gpu_name = offer.gpu_name().unwrap_or_default();
        if gpu_name.is_empty() {
            continue;
        }
        let num_gpus = offer.num_gpus().unwrap_or(0);
        if num_gpus < 1 {
            warn!(
                machine_id = offer.machine_id().unwrap_or(0),
                "skipping machine without GPUs"
            );
            continue;
        }
        let gpus = num_gpus as f64;

        let vram = offer.get_f64("gpu_ram").unwrap_or(0.0);
        let dlperf = offer.get_f64("dlperf").unwrap_or(0.0);
        let dlperf_chunk = offer.get_f64("dlperf_chunk").unwrap_or(0.0);
        let tflops = offer.get_f64("total_flops").unwrap_or(0.0);

        result.push(TypedOffer {
            machine_id: offer.machine_id().unwrap_or(0),
            gpu_name: gpu_name.to_string(),
            num_gpus,
            num_gpus_rented: offer.num_gpus_rented().unwrap_or(0),
            price_per_gpu: offer.price_per_gpu().unwrap_or(0),
            verified: offer.verified(),
            datacenter: offer.datacenter(),
            static_ip: offer.static_ip(),
            vram: (vram / 1024.0).ceil(),
            dlperf_per_gpu_chunk: dlperf_chunk / gpus,
            dlperf_per_gpu_whole: dlperf / gpus,
            tflops_per_gpu: tflops / gpus,
        });
    }
    result
}

/// Offers on verified hosts.
pub fn filter_verified(offers: &[TypedOffer]) -> TypedOffers {
    offers.iter().filter(|o| o.verified).cloned().collect()
}

/// Offers on unverified hosts.
pub fn filter_unverified(offers: &[TypedOffer]) -> TypedOffers {
    offers.iter().filter(|o| !o.verified).cloned().collect()
}

/// The rented share of each machine; `num_gpus` is replaced with the rented
/// GPU count so price streams weight by occupied capacity.
pub fn filter_rented(offers: &[TypedOffer]) -> TypedOffers {
    offers
        .iter()
        .filter(|o| o.num_gpus_rented > 0)
        .map(|o| TypedOffer {
            num_gpus: o.num_gpus_rented,
            ..o.clone()
        })
        .collect()
}

/// The free share of each machine; `num_gpus` becomes the unrented count.
pub fn filter_available(offers: &[TypedOffer]) -> TypedOffers {
    offers
        .iter()
        .filter(|o| o.num_gpus_rented < o.num_gpus)
        .map(|o| TypedOffer {
            num_gpus: o.num_gpus - o.num_gpus_rented,
            ..o.clone()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::tests::offer;
    use serde_json::json;

    fn typed(fields: serde_json::Value) -> TypedOffer {
        let raw = offer(fields);
        let decoded = decode(&vec![raw]);
        assert_eq!(decoded.len(), 1);
        decoded.into_iter().next().unwrap()
    }

    #[test]
    fn decode_projects_all_fields() {
        let o = typed(json!({
            "machine_id": 7,
            "num_gpus": 4,
            "num_gpus_rented": 1,
            "dph_base": 1.2,
            "verified": true,
            "hosting_type": 1,
            "static_ip": true,
            "gpu_ram": 24576.0,
            "dlperf": 400.0,
            "dlperf_chunk": 380.0,
            "total_flops": 140.0,
        }));
        assert_eq!(o.machine_id, 7);
        assert_eq!(o.num_gpus, 4);
        assert_eq!(o.num_gpus_rented, 1);
        assert_eq!(o.price_per_gpu, 30);
        assert!(o.verified && o.datacenter && o.static_ip);
        assert_eq!(o.vram, 24.0);
        assert_eq!(o.dlperf_per_gpu_whole, 100.0);
        assert_eq!(o.dlperf_per_gpu_chunk, 95.0);
        assert_eq!(o.tflops_per_gpu, 35.0);
    }

    #[test]
    fn vram_rounds_up_to_whole_gigabytes() {
        let o = typed(json!({"gpu_ram": 11264.5}));
        assert_eq!(o.vram, 12.0);
    }

    #[test]
    fn decode_skips_unusable_records() {
        let unnamed = offer(json!({"gpu_name": ""}));
        assert!(decode(&vec![unnamed]).is_empty());

        let empty = offer(json!({"num_gpus": 0}));
        assert!(decode(&vec![empty]).is_empty());
    }

    #[test]
    fn rented_filter_replaces_gpu_count() {
        let offers = vec![
            typed(json!({"num_gpus": 8, "num_gpus_rented": 3})),
            typed(json!({"num_gpus": 4, "num_gpus_rented": 0})),
        ];
        let rented = filter_rented(&offers);
        assert_eq!(rented.len(), 1);
        assert_eq!(rented[0].num_gpus, 3);
    }

    #[test]
    fn available_filter_subtracts_rented() {
        let offers = vec![
            typed(json!({"num_gpus": 8, "num_gpus_rented": 3})),
            typed(json!({"num_gpus": 4, "num_gpus_rented": 4})),
        ];
        let available = filter_available(&offers);
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].num_gpus, 5);
    }

    #[test]
    fn rented_available_partition_is_complete() {
        let offers = vec![typed(json!({"num_gpus": 8, "num_gpus_rented": 3}))];
        let rented: i64 = filter_rented(&offers).iter().map(|o| o.num_gpus).sum();
        let available: i64 = filter_available(&offers).iter().map(|o| o.num_gpus).sum();
        assert_eq!(rented + available, 8);
    }

    #[test]
    fn verification_filters_partition() {
        let offers = vec![
            typed(json!({"verified": true})),
            typed(json!({"verified": false})),
        ];
        assert_eq!(filter_verified(&offers).len(), 1);
        assert_eq!(filter_unverified(&offers).len(), 1);
    }
}
