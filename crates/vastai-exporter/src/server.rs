//! HTTP surface: JSON endpoints, metric expositions, and the index page.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, Router};
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use vast_market::MarketError;

use crate::metrics::METRICS_CONTENT_TYPE;
use crate::state::AppState;

/// Builds the exporter's router. Responses are gzip-compressed whenever the
/// client accepts it.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/offers", get(offers))
        .route("/machines", get(machines))
        .route("/hosts", get(hosts))
        .route("/gpu-stats", get(gpu_stats))
        .route("/host-map-data", get(host_map_data))
        .route("/metrics", get(metrics))
        .route("/metrics/global", get(metrics_global))
        .with_state(state)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
}

fn json_response(body: Result<String, MarketError>) -> Response {
    match body {
        Ok(json) => (
            [(header::CONTENT_TYPE, "application/json")],
            json,
        )
            .into_response(),
        Err(err) => {
            error!(%err, "could not serialize response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn offers(State(state): State<Arc<AppState>>) -> Response {
    json_response(state.snapshot().offers_json())
}

async fn machines(State(state): State<Arc<AppState>>) -> Response {
    json_response(state.snapshot().machines_json())
}

async fn hosts(State(state): State<Arc<AppState>>) -> Response {
    json_response(state.snapshot().hosts_json())
}

async fn gpu_stats(State(state): State<Arc<AppState>>) -> Response {
    json_response(state.snapshot().gpu_stats_json())
}

async fn host_map_data(State(state): State<Arc<AppState>>) -> Response {
    json_response(state.snapshot().host_map_json())
}

/// Account metrics when an API key is configured, global otherwise.
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let body = match &state.account {
        Some(account) => account.encode(),
        None => state.global.encode(),
    };
    ([(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)], body).into_response()
}

async fn metrics_global(State(state): State<Arc<AppState>>) -> Response {
    (
        [(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)],
        state.global.encode(),
    )
        .into_response()
}

async fn index(State(state): State<Arc<AppState>>) -> Html<String> {
    let mut page = String::from(
        "<html><head><title>Vast.ai Exporter</title></head><body><h1>Vast.ai Exporter</h1>",
    );
    if state.account.is_some() {
        page.push_str(
            "<a href=\"metrics\">Account stats</a><br>\
             <a href=\"metrics/global\">Per-model stats on GPUs</a><br><br>",
        );
    } else {
        page.push_str("<a href=\"metrics\">Per-model stats on GPUs</a><br><br>");
    }
    page.push_str(
        "<a href=\"offers\">JSON list of offers</a><br>\
         <a href=\"machines\">JSON list of machines</a><br>\
         <a href=\"hosts\">JSON list of hosts</a><br>\
         <a href=\"gpu-stats\">JSON per-model stats on GPUs</a><br>\
         <a href=\"host-map-data\">JSON data for the host map</a><br>\
         </body></html>",
    );
    Html(page)
}
