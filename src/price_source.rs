// =============================================================================
// PriceSource — current-price lookups with snapshot + aggregate fallback
// =============================================================================
//
// Grounded on `verification_worker.py::_get_price` / `_get_price_from_aggs`:
// try a live snapshot first, fall back to the most recent minute aggregate,
// and never let a network/parse error escape as an exception — absent price
// is a valid, expected outcome the caller treats as "retry next pass."
//
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{instrument, warn};

/// Narrow contract for fetching a current price.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// A single numeric current price, or `None` if it could not be
    /// determined within the call's timeout.
    async fn get_price(&self, symbol: &str) -> Option<f64>;

    /// Batched variant amortizing network cost; default impl just calls
    /// `get_price` per symbol, which is semantically equivalent (spec §4.4).
    async fn get_prices(&self, symbols: &[String]) -> HashMap<String, f64> {
        let mut out = HashMap::new();
        for symbol in symbols {
            if let Some(price) = self.get_price(symbol).await {
                out.insert(symbol.clone(), price);
            }
        }
        out
    }
}

/// Production adapter: snapshot endpoint with minute-aggregate fallback.
pub struct HttpPriceSource {
    client: reqwest::Client,
    snapshot_base_url: String,
    aggs_base_url: String,
    api_key: String,
}

impl HttpPriceSource {
    pub fn new(snapshot_base_url: impl Into<String>, aggs_base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client builds"),
            snapshot_base_url: snapshot_base_url.into(),
            aggs_base_url: aggs_base_url.into(),
            api_key: api_key.into(),
        }
    }

    #[instrument(skip(self), name = "price_source::snapshot")]
    async fn snapshot_price(&self, symbol: &str) -> Option<f64> {
        let url = format!(
            "{}/v2/snapshot/locale/us/markets/stocks/tickers/{symbol}?apiKey={}",
            self.snapshot_base_url, self.api_key
        );

        let response = self.client.get(&url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let data: JsonValue = response.json().await.ok()?;

        let ticker = data.get("ticker")?;
        let last_trade_price = ticker
            .get("lastTrade")
            .and_then(|t| t.get("p"))
            .and_then(|v| v.as_f64());
        let day_close = ticker
            .get("day")
            .and_then(|d| d.get("c"))
            .and_then(|v| v.as_f64());

        last_trade_price.or(day_close).filter(|p| *p > 0.0)
    }

    #[instrument(skip(self), name = "price_source::aggs_fallback")]
    async fn aggs_price(&self, symbol: &str) -> Option<f64> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let from_ms = now_ms - 300_000;

        let url = format!(
            "{}/v2/aggs/ticker/{symbol}/range/1/minute/{from_ms}/{now_ms}?adjusted=true&sort=desc&limit=1&apiKey={}",
            self.aggs_base_url, self.api_key
        );

        let response = self.client.get(&url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let data: JsonValue = response.json().await.ok()?;
        data.get("results")?
            .as_array()?
            .first()?
            .get("c")?
            .as_f64()
            .filter(|p| *p > 0.0)
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn get_price(&self, symbol: &str) -> Option<f64> {
        if let Some(price) = self.snapshot_price(symbol).await {
            return Some(price);
        }
        warn!(symbol, "snapshot price unavailable, falling back to aggregates");
        self.aggs_price(symbol).await
    }
}

/// Deterministic in-memory price source for tests.
#[derive(Default, Clone)]
pub struct SimulatedPriceSource {
    prices: std::sync::Arc<parking_lot::RwLock<HashMap<String, f64>>>,
}

impl SimulatedPriceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.write().insert(symbol.to_string(), price);
    }
}

#[async_trait]
impl PriceSource for SimulatedPriceSource {
    async fn get_price(&self, symbol: &str) -> Option<f64> {
        self.prices.read().get(symbol).copied()
    }
}
