// =============================================================================
// MatcherClient — adapter to the external nearest-neighbor pattern matcher
// =============================================================================
//
// The nearest-neighbor index itself is out of scope; this module defines the
// narrow async contract ScanEngine calls through, an HTTP-backed production
// implementation (in the style of the teacher's `BinanceClient`), and a
// deterministic in-memory implementation for tests.
//
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::instrument;

use crate::error::MatcherError;

/// Forecast block returned by a successful search.
#[derive(Debug, Clone, Deserialize)]
pub struct Forecast {
    pub prob_up: f64,
    pub prob_down: f64,
    pub mean_return: f64,
    pub n_neighbors: i64,
    /// 10th percentile return ("worst case" in the original source).
    pub p10: Option<f64>,
    /// 90th percentile return ("best case" in the original source).
    pub p90: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Neighbor {
    pub distance: f64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HistoricalContext {
    #[serde(default)]
    pub pattern_prices: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStatus {
    Success,
    Error,
    #[serde(other)]
    Other,
}

/// Raw result from a `Search` call, mirroring the shape the original source's
/// matcher library returns.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchResult {
    pub status: SearchStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub forecast: Option<Forecast>,
    #[serde(default)]
    pub neighbors: Vec<Neighbor>,
    #[serde(default)]
    pub historical_context: HistoricalContext,
}

impl SearchResult {
    /// Distance to the closest neighbor, if any were returned.
    pub fn nearest_distance(&self) -> Option<f64> {
        self.neighbors.first().map(|n| n.distance)
    }

    /// The most recent price in the query pattern's context, from which
    /// price-at-scan is read. Never fabricated (spec §9's price_at_scan==0
    /// resolution): an empty or non-positive tail yields `None`.
    pub fn price_at_scan(&self) -> Option<f64> {
        self.historical_context
            .pattern_prices
            .last()
            .copied()
            .filter(|p| *p > 0.0)
    }
}

/// Narrow contract to the external pattern-matching engine.
#[async_trait]
pub trait PatternMatcher: Send + Sync {
    async fn search(&self, symbol: &str, k: u32, cross_asset: bool) -> Result<SearchResult, MatcherError>;
}

/// Production adapter: calls a configured HTTP endpoint.
pub struct HttpPatternMatcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPatternMatcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .expect("reqwest client builds"),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PatternMatcher for HttpPatternMatcher {
    #[instrument(skip(self), name = "matcher::search")]
    async fn search(&self, symbol: &str, k: u32, cross_asset: bool) -> Result<SearchResult, MatcherError> {
        let url = format!("{}/search", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol.to_string()),
                ("k", k.to_string()),
                ("cross_asset", cross_asset.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MatcherError::MatcherStatus(format!(
                "matcher endpoint returned {status}"
            )));
        }

        let result: SearchResult = response.json().await?;

        match result.status {
            SearchStatus::Error => Err(MatcherError::MatcherStatus(
                result.error.clone().unwrap_or_else(|| "unknown error".to_string()),
            )),
            SearchStatus::Other => Err(MatcherError::NoData {
                symbol: symbol.to_string(),
            }),
            SearchStatus::Success => {
                if result.forecast.is_none() {
                    return Err(MatcherError::NoData {
                        symbol: symbol.to_string(),
                    });
                }
                Ok(result)
            }
        }
    }
}

/// Deterministic in-memory matcher for tests and offline development.
///
/// Fixtures are registered per-symbol; an unregistered symbol yields
/// `MatcherError::NoData`.
#[derive(Default)]
pub struct SimulatedMatcher {
    fixtures: HashMap<String, SearchResult>,
}

impl SimulatedMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fixture(mut self, symbol: &str, result: SearchResult) -> Self {
        self.fixtures.insert(symbol.to_string(), result);
        self
    }

    pub fn with_error(mut self, symbol: &str, reason: &str) -> Self {
        self.fixtures.insert(
            symbol.to_string(),
            SearchResult {
                status: SearchStatus::Error,
                error: Some(reason.to_string()),
                forecast: None,
                neighbors: Vec::new(),
                historical_context: HistoricalContext::default(),
            },
        );
        self
    }
}

#[async_trait]
impl PatternMatcher for SimulatedMatcher {
    async fn search(&self, symbol: &str, _k: u32, _cross_asset: bool) -> Result<SearchResult, MatcherError> {
        match self.fixtures.get(symbol) {
            None => Err(MatcherError::NoData {
                symbol: symbol.to_string(),
            }),
            Some(result) => match result.status {
                SearchStatus::Error => Err(MatcherError::MatcherStatus(
                    result.error.clone().unwrap_or_else(|| "simulated error".to_string()),
                )),
                SearchStatus::Other => Err(MatcherError::NoData {
                    symbol: symbol.to_string(),
                }),
                SearchStatus::Success => Ok(result.clone()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forecast(prob_up: f64, prob_down: f64, mean_return: f64) -> Forecast {
        Forecast {
            prob_up,
            prob_down,
            mean_return,
            n_neighbors: 50,
            p10: Some(-0.5),
            p90: Some(1.4),
        }
    }

    #[tokio::test]
    async fn simulated_matcher_returns_fixture() {
        let matcher = SimulatedMatcher::new().with_fixture(
            "AAA",
            SearchResult {
                status: SearchStatus::Success,
                error: None,
                forecast: Some(forecast(0.7, 0.3, 0.8)),
                neighbors: vec![Neighbor { distance: 0.12 }],
                historical_context: HistoricalContext {
                    pattern_prices: vec![99.0, 100.0],
                },
            },
        );

        let result = matcher.search("AAA", 50, false).await.unwrap();
        assert_eq!(result.price_at_scan(), Some(100.0));
        assert_eq!(result.nearest_distance(), Some(0.12));
    }

    #[tokio::test]
    async fn simulated_matcher_unknown_symbol_is_no_data() {
        let matcher = SimulatedMatcher::new();
        let err = matcher.search("ZZZ", 50, false).await.unwrap_err();
        assert!(matches!(err, MatcherError::NoData { .. }));
    }

    #[tokio::test]
    async fn simulated_matcher_error_fixture_surfaces_matcher_status() {
        let matcher = SimulatedMatcher::new().with_error("ZZZ", "index unavailable");
        let err = matcher.search("ZZZ", 50, false).await.unwrap_err();
        assert!(matches!(err, MatcherError::MatcherStatus(_)));
    }

    #[test]
    fn price_at_scan_never_fabricates_zero_price() {
        let result = SearchResult {
            status: SearchStatus::Success,
            error: None,
            forecast: Some(forecast(0.6, 0.4, 0.1)),
            neighbors: vec![Neighbor { distance: 0.2 }],
            historical_context: HistoricalContext {
                pattern_prices: vec![0.0],
            },
        };
        assert_eq!(result.price_at_scan(), None);
    }
}
