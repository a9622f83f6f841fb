//! Vast.ai marketplace API client.
//!
//! All reads go through one [`VastClient`]: offer bundles (optionally from a
//! peer exporter in master mode), the account's machines and instances, and
//! the invoice list the payout tracker feeds on.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use vast_market::RawOffers;

use crate::payout::PayoutInfo;

const DEFAULT_BASE_URL: &str = "https://console.vast.ai/api/v0";

/// Bundle search filter: on-demand offers from real hosts, one fragment per
/// rentable chunk.
const BUNDLES_QUERY: &str =
    r#"{"external":{"eq":"false"},"type":"on-demand","disable_bundling":true}"#;

/// Budget for one marketplace API call.
const API_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget for one peer-exporter call.
const MASTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from upstream fetches.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned HTTP {status}")]
    BadStatus { url: String, status: u16 },

    #[error("not a Vast.ai exporter URL: {0}")]
    NotAnExporter(String),
}

/// Everything one poll cycle fetched. Each sub-view is `None` when its fetch
/// failed or was not attempted, leaving the corresponding downstream view
/// unchanged for the cycle.
#[derive(Debug, Clone)]
pub struct ApiSnapshot {
    /// When the offers were observed; inherited from the peer exporter in
    /// master mode.
    pub ts: DateTime<Utc>,
    pub offers: Option<RawOffers>,
    pub machines: Option<Vec<Machine>>,
    pub instances: Option<Vec<Instance>>,
    pub payouts: Option<PayoutInfo>,
}

impl ApiSnapshot {
    /// An empty snapshot stamped with the current time.
    pub fn empty() -> Self {
        Self {
            ts: Utc::now(),
            offers: None,
            machines: None,
            instances: None,
            payouts: None,
        }
    }
}

/// One of the account's machines, as reported by the machines endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Machine {
    pub id: i64,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub verification: Option<String>,
    #[serde(default)]
    pub listed: bool,
    /// Zero means the machine is reachable.
    #[serde(default)]
    pub timeout: f64,
    #[serde(default, rename = "reliability2")]
    pub reliability: f64,
    #[serde(default)]
    pub listed_gpu_cost: f64,
    #[serde(default)]
    pub current_rentals_on_demand: i64,
    #[serde(default)]
    pub current_rentals_resident: i64,
    #[serde(default)]
    pub current_rentals_running: i64,
    #[serde(default)]
    pub current_rentals_running_on_demand: i64,
    #[serde(default)]
    pub inet_down: f64,
    #[serde(default)]
    pub inet_up: f64,
    #[serde(default)]
    pub num_gpus: i64,
    #[serde(default)]
    pub gpu_name: Option<String>,
    #[serde(default)]
    pub total_flops: f64,
    /// One letter per GPU: 'D' on-demand rental, 'I' interruptible bid,
    /// 'x' idle.
    #[serde(default)]
    pub gpu_occupancy: Option<String>,
}

impl Machine {
    pub fn hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or("")
    }

    pub fn gpu_name(&self) -> &str {
        self.gpu_name.as_deref().unwrap_or("")
    }

    pub fn is_verified(&self) -> bool {
        self.verification.as_deref() == Some("verified")
    }

    pub fn gpu_occupancy(&self) -> &str {
        self.gpu_occupancy.as_deref().unwrap_or("")
    }
}

/// One of the account's rental instances.
#[derive(Debug, Clone, Deserialize)]
pub struct Instance {
    pub id: i64,
    pub machine_id: i64,
    #[serde(default)]
    pub actual_status: Option<String>,
    #[serde(default)]
    pub dph_base: f64,
    #[serde(default)]
    pub min_bid: f64,
    #[serde(default)]
    pub image_uuid: Option<String>,
    #[serde(default)]
    pub start_date: f64,
    #[serde(default)]
    pub is_bid: bool,
    #[serde(default)]
    pub bundle_id: Option<i64>,
    #[serde(default)]
    pub num_gpus: i64,
    #[serde(default)]
    pub gpu_name: Option<String>,
}

impl Instance {
    /// The host's background job, identified by the missing bundle id.
    pub fn is_default_job(&self) -> bool {
        self.bundle_id.is_none()
    }

    pub fn is_running(&self) -> bool {
        self.actual_status.as_deref() == Some("running")
    }

    pub fn rental_type(&self) -> &'static str {
        if self.is_default_job() {
            "default"
        } else if self.is_bid {
            "bid"
        } else {
            "ondemand"
        }
    }
}

#[derive(Debug, Deserialize)]
struct BundlesResponse {
    offers: RawOffers,
}

#[derive(Debug, Deserialize)]
struct MachinesResponse {
    machines: Vec<Machine>,
}

#[derive(Debug, Deserialize)]
struct InstancesResponse {
    instances: Vec<Instance>,
}

/// The `/offers` envelope served by a peer exporter.
#[derive(Debug, Deserialize)]
struct OffersFeed {
    url: String,
    timestamp: DateTime<Utc>,
    offers: Option<RawOffers>,
}

#[derive(Debug, Default, Deserialize)]
struct InvoicesResponse {
    #[serde(default)]
    current: CurrentBalance,
    #[serde(default)]
    invoices: Vec<Invoice>,
}

#[derive(Debug, Default, Deserialize)]
struct CurrentBalance {
    #[serde(default)]
    total: f64,
}

#[derive(Debug, Default, Deserialize)]
struct Invoice {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    amount: Option<String>,
    #[serde(default)]
    timestamp: f64,
}

/// HTTP client for the marketplace and for peer exporters.
pub struct VastClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl VastClient {
    pub fn new(api_key: Option<String>) -> Result<Self, ApiError> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(API_TIMEOUT).build()?,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
        })
    }

    #[cfg(test)]
    fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: None,
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn key_query(&self) -> Vec<(&'static str, String)> {
        match &self.api_key {
            Some(key) => vec![("api_key", key.clone())],
            None => Vec::new(),
        }
    }

    /// Fetches the raw bundle list and normalizes each offer at ingest.
    /// The snapshot timestamp is the local fetch time.
    pub async fn fetch_offers(&self) -> Result<(DateTime<Utc>, RawOffers), ApiError> {
        let ts = Utc::now();
        let url = format!("{}/bundles/", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("q", BUNDLES_QUERY)])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ApiError::BadStatus {
                url,
                status: resp.status().as_u16(),
            });
        }
        let mut body: BundlesResponse = resp.json().await?;
        for offer in &mut body.offers {
            offer.normalize();
        }
        Ok((ts, body.offers))
    }

    /// Fetches pre-reconciled offers from a peer exporter's `/offers`
    /// endpoint, inheriting its timestamp.
    pub async fn fetch_offers_from_master(
        &self,
        master_url: &str,
    ) -> Result<(DateTime<Utc>, RawOffers), ApiError> {
        let url = format!("{}/offers", master_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .timeout(MASTER_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ApiError::BadStatus {
                url,
                status: resp.status().as_u16(),
            });
        }
        let feed: OffersFeed = resp.json().await?;
        if feed.url != "/offers" {
            return Err(ApiError::NotAnExporter(master_url.to_string()));
        }
        Ok((feed.timestamp, feed.offers.unwrap_or_default()))
    }

    pub async fn fetch_machines(&self) -> Result<Vec<Machine>, ApiError> {
        let url = format!("{}/machines/", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&self.key_query())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ApiError::BadStatus {
                url,
                status: resp.status().as_u16(),
            });
        }
        let body: MachinesResponse = resp.json().await?;
        Ok(body.machines)
    }

    pub async fn fetch_instances(&self) -> Result<Vec<Instance>, ApiError> {
        let url = format!("{}/instances/", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&self.key_query())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ApiError::BadStatus {
                url,
                status: resp.status().as_u16(),
            });
        }
        let body: InstancesResponse = resp.json().await?;
        Ok(body.instances)
    }

    /// Fetches the invoice list and folds it into a [`PayoutInfo`].
    ///
    /// Paid-out totals are summed in integer cents so thousands of small
    /// invoices cannot accumulate float error.
    pub async fn fetch_payouts(&self) -> Result<PayoutInfo, ApiError> {
        let url = format!("{}/users/current/invoices/", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&self.key_query())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ApiError::BadStatus {
                url,
                status: resp.status().as_u16(),
            });
        }
        let body: InvoicesResponse = resp.json().await?;

        let mut paid_out_cents: i64 = 0;
        let mut last_payout_time: f64 = 0.0;
        for invoice in &body.invoices {
            if invoice.kind.as_deref() == Some("payment") {
                let amount: f64 = invoice
                    .amount
                    .as_deref()
                    .and_then(|a| a.parse().ok())
                    .unwrap_or(0.0);
                paid_out_cents += (amount * 100.0).round() as i64;
                last_payout_time = last_payout_time.max(invoice.timestamp);
            }
        }

        Ok(PayoutInfo {
            paid_out: paid_out_cents as f64 / 100.0,
            pending_payout: body.current.total,
            last_payout_time,
        })
    }
}
