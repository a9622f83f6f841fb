//! Offer reconciliation engine for the Vast.ai GPU marketplace.
//!
//! The marketplace advertises every rentable sub-slice of a physical host as
//! a separate "bundle" offer, so a single machine shows up as many
//! overlapping fragments. This crate rebuilds a coherent picture from that
//! fragment soup:
//!
//! - [`raw`] keeps offers as untyped JSON bags with typed accessors and
//!   handles ingest validation,
//! - [`reconcile`] reconstructs one enriched record per physical machine,
//!   inferring chunk sizes and GPU utilization,
//! - [`typed`] projects machines into a strongly-typed list,
//! - [`stats`] computes capacity-weighted price statistics over it,
//! - [`hosts`] regroups machines into per-host, per-location records,
//! - [`cache`] ties the three views together into one consistent snapshot
//!   with JSON projections for the HTTP surfaces.

#![forbid(unsafe_code)]

pub mod cache;
pub mod error;
pub mod hosts;
pub mod raw;
pub mod reconcile;
pub mod stats;
pub mod typed;

pub use cache::{OfferCache, OfferSnapshot};
pub use error::MarketError;
pub use hosts::{collect_hosts, format_gpus, GpuCounts, Host, HostMapItem};
pub use raw::{RawOffer, RawOffers};
pub use reconcile::{LocateIp, NoLocations, ResolvedLocations};
pub use stats::{group_by_gpu, gpu_info, stats, stats2, stats3, GpuInfo, OfferStats, OfferStats2, OfferStats3};
pub use typed::{TypedOffer, TypedOffers};
