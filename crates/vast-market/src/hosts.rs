//! Host-level aggregation of whole-machine records.
//!
//! A host is a marketplace account operating machines in one physical place.
//! Machines are regrouped by (host id, location fingerprint); a host with
//! machines in several sites intentionally yields several records.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use vast_geo::GeoLocation;

use crate::raw::RawOffers;

/// GPU count per model name.
pub type GpuCounts = BTreeMap<String, i64>;

/// Aggregated capacity of one host at one location.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Host {
    pub host_id: i64,
    pub machine_ids: Vec<i64>,
    pub ip_addresses: Vec<String>,
    pub gpus: GpuCounts,
    pub tflops: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inet_up: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inet_down: Option<f64>,
}

/// One host rendered for the world map.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostMapItem {
    /// Formatted GPU inventory, e.g. `"4x RTX 3090, 2x A100 SXM4"`.
    pub gpus: String,
    pub host_id: String,
    pub machine_ids: String,
    pub ip_addresses: String,
    pub tflops: f64,
    /// Square root of the TFLOPS total, a convenient marker radius.
    pub tflops_sqrt: f64,
    pub location: GeoLocation,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub connection: String,
}

struct HostBuilder {
    host_id: i64,
    machine_ids: Vec<i64>,
    ip_addresses: Vec<String>,
    gpus: GpuCounts,
    tflops: f64,
    location: Option<GeoLocation>,
    inet_up: f64,
    inet_down: f64,
}

/// Regroups whole-machine records into host records, sorted by total TFLOPS
/// descending.
pub fn collect_hosts(whole_machines: &RawOffers) -> Vec<Host> {
    let mut merged: HashMap<String, HostBuilder> = HashMap::new();

    for offer in whole_machines {
        let host_id = offer.get_i64("host_id").unwrap_or(0);
        let location = offer
            .get("location")
            .and_then(|v| serde_json::from_value::<GeoLocation>(v.clone()).ok())
            .filter(|loc| loc.lat != 0.0 || loc.long != 0.0);

        let key = match &location {
            Some(loc) => format!("{host_id}:{:.3}:{:.3}:{}", loc.lat, loc.long, loc.isp),
            None => host_id.to_string(),
        };

        let entry = merged.entry(key).or_insert_with(|| HostBuilder {
            host_id,
            machine_ids: Vec::new(),
            ip_addresses: Vec::new(),
            gpus: GpuCounts::new(),
            tflops: 0.0,
            location: location.clone(),
            inet_up: 0.0,
            inet_down: 0.0,
        });

        if let Some(machine_id) = offer.machine_id() {
            entry.machine_ids.push(machine_id);
        }
        if let Some(ip) = offer.public_ipaddr() {
            entry.ip_addresses.push(ip.to_string());
        }
        if let (Some(name), Some(count)) = (offer.gpu_name(), offer.num_gpus()) {
            *entry.gpus.entry(name.to_string()).or_default() += count;
        }
        entry.tflops += offer.get_f64("total_flops").unwrap_or(0.0);
        entry.inet_up = entry.inet_up.max(offer.get_f64("inet_up").unwrap_or(0.0));
        entry.inet_down = entry.inet_down.max(offer.get_f64("inet_down").unwrap_or(0.0));
    }

    let mut hosts: Vec<Host> = merged
        .into_values()
        .map(|mut builder| {
            builder.machine_ids.sort_unstable();
            builder.machine_ids.dedup();
            builder.ip_addresses.sort_unstable();
            builder.ip_addresses.dedup();
            Host {
                host_id: builder.host_id,
                machine_ids: builder.machine_ids,
                ip_addresses: builder.ip_addresses,
                gpus: builder.gpus,
                tflops: builder.tflops,
                location: builder.location,
                inet_up: (builder.inet_up > 0.0).then_some(builder.inet_up),
                inet_down: (builder.inet_down > 0.0).then_some(builder.inet_down),
            }
        })
        .collect();

    hosts.sort_by(|a, b| b.tflops.total_cmp(&a.tflops).then(a.host_id.cmp(&b.host_id)));
    hosts
}

impl Host {
    /// Projects the host into its map representation; hosts without a
    /// location have nowhere to be drawn.
    pub fn map_item(&self) -> Option<HostMapItem> {
        let location = self.location.clone()?;
        let connection = match (self.inet_down, self.inet_up) {
            (Some(down), Some(up)) => format!("↓ {down:.0} ↑ {up:.0} Mb/s"),
            _ => String::new(),
        };
        Some(HostMapItem {
            gpus: format_gpus(&self.gpus),
            host_id: self.host_id.to_string(),
            machine_ids: join_ints(&self.machine_ids),
            ip_addresses: self.ip_addresses.join(", "),
            tflops: self.tflops,
            tflops_sqrt: self.tflops.sqrt(),
            location,
            connection,
        })
    }
}

/// Renders GPU counts as `"4x RTX 3090, 2x A100 SXM4"`, most numerous
/// first, ties broken by name.
pub fn format_gpus(gpus: &GpuCounts) -> String {
    let mut entries: Vec<(&String, &i64)> = gpus.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
    entries
        .iter()
        .map(|(name, count)| format!("{count}x {name}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_ints(values: &[i64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::tests::offer;
    use serde_json::json;

    fn record(machine_id: i64, host_id: i64, fields: serde_json::Value) -> crate::raw::RawOffer {
        let mut o = offer(json!({
            "machine_id": machine_id,
            "host_id": host_id,
            "total_flops": 100.0,
            "public_ipaddr": format!("203.0.113.{machine_id}"),
        }));
        for (k, v) in fields.as_object().unwrap().clone() {
            o.0.insert(k, v);
        }
        o
    }

    fn oslo() -> serde_json::Value {
        json!({"country": "NO", "location": "Oslo", "lat": 59.913, "long": 10.739, "isp": "Telenor"})
    }

    #[test]
    fn machines_of_one_host_merge() {
        let offers = vec![
            record(1, 77, json!({"location": oslo(), "num_gpus": 4, "gpu_name": "RTX 3090"})),
            record(2, 77, json!({"location": oslo(), "num_gpus": 2, "gpu_name": "A100 SXM4"})),
            record(3, 77, json!({"location": oslo(), "num_gpus": 4, "gpu_name": "RTX 3090"})),
        ];
        let hosts = collect_hosts(&offers);
        assert_eq!(hosts.len(), 1);
        let host = &hosts[0];
        assert_eq!(host.host_id, 77);
        assert_eq!(host.machine_ids, vec![1, 2, 3]);
        assert_eq!(host.gpus, GpuCounts::from([("RTX 3090".into(), 8), ("A100 SXM4".into(), 2)]));
        assert_eq!(host.tflops, 300.0);
    }

    #[test]
    fn host_with_two_sites_splits() {
        let mut berlin = oslo();
        berlin["lat"] = json!(52.52);
        berlin["long"] = json!(13.405);
        let offers = vec![
            record(1, 77, json!({"location": oslo()})),
            record(2, 77, json!({"location": berlin})),
        ];
        assert_eq!(collect_hosts(&offers).len(), 2);
    }

    #[test]
    fn hosts_without_location_group_by_id_only() {
        let offers = vec![
            record(1, 77, json!({})),
            record(2, 77, json!({})),
            record(3, 88, json!({})),
        ];
        let hosts = collect_hosts(&offers);
        assert_eq!(hosts.len(), 2);
    }

    #[test]
    fn zero_coordinates_count_as_no_location() {
        let mut nowhere = oslo();
        nowhere["lat"] = json!(0.0);
        nowhere["long"] = json!(0.0);
        let offers = vec![record(1, 77, json!({"location": nowhere}))];
        let hosts = collect_hosts(&offers);
        assert!(hosts[0].location.is_none());
    }

    #[test]
    fn duplicate_machine_ids_and_ips_dedup() {
        let offers = vec![
            record(1, 77, json!({"public_ipaddr": "203.0.113.9"})),
            record(1, 77, json!({"public_ipaddr": "203.0.113.9"})),
        ];
        let host = &collect_hosts(&offers)[0];
        assert_eq!(host.machine_ids, vec![1]);
        assert_eq!(host.ip_addresses, vec!["203.0.113.9"]);
    }

    #[test]
    fn output_sorted_by_tflops_descending() {
        let offers = vec![
            record(1, 1, json!({"total_flops": 50.0})),
            record(2, 2, json!({"total_flops": 500.0})),
            record(3, 3, json!({"total_flops": 200.0})),
        ];
        let ids: Vec<i64> = collect_hosts(&offers).iter().map(|h| h.host_id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn inet_speeds_take_max_and_omit_nonpositive() {
        let offers = vec![
            record(1, 77, json!({"inet_up": 100.0, "inet_down": 700.0})),
            record(2, 77, json!({"inet_up": 300.0, "inet_down": 500.0})),
        ];
        let host = &collect_hosts(&offers)[0];
        assert_eq!(host.inet_up, Some(300.0));
        assert_eq!(host.inet_down, Some(700.0));

        let silent = vec![record(1, 78, json!({}))];
        let host = &collect_hosts(&silent)[0];
        assert_eq!(host.inet_up, None);
        assert_eq!(host.inet_down, None);
    }

    #[test]
    fn gpu_string_sorts_by_count_then_name() {
        let gpus = GpuCounts::from([
            ("RTX 3090".to_string(), 4),
            ("A100 SXM4".to_string(), 2),
            ("RTX 4090".to_string(), 4),
        ]);
        assert_eq!(format_gpus(&gpus), "4x RTX 3090, 4x RTX 4090, 2x A100 SXM4");
    }

    #[test]
    fn map_item_requires_location() {
        let offers = vec![
            record(1, 77, json!({"location": oslo(), "inet_up": 120.0, "inet_down": 850.0, "total_flops": 144.0})),
            record(2, 88, json!({})),
        ];
        let hosts = collect_hosts(&offers);
        let items: Vec<HostMapItem> = hosts.iter().filter_map(Host::map_item).collect();
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.host_id, "77");
        assert_eq!(item.tflops_sqrt, 12.0);
        assert_eq!(item.connection, "↓ 850 ↑ 120 Mb/s");
        assert_eq!(item.machine_ids, "1");
    }
}
