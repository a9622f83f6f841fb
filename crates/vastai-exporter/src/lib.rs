//! Prometheus exporter and JSON API for the Vast.ai GPU marketplace.
//!
//! The binary polls the marketplace on a fixed interval, feeds the offer
//! reconciliation engine in [`vast_market`], and serves the results on two
//! surfaces: Prometheus metric expositions and a handful of JSON endpoints.

#![forbid(unsafe_code)]

pub mod api;
pub mod config;
pub mod metrics;
pub mod payout;
pub mod poller;
pub mod server;
pub mod state;

pub use api::{ApiSnapshot, VastClient};
pub use config::Cli;
pub use payout::{PayoutInfo, PayoutTracker};
pub use poller::Poller;
pub use server::create_router;
pub use state::AppState;
