// =============================================================================
// Error taxonomy
// =============================================================================
//
// Library-level errors that callers pattern-match on use `thiserror`; errors
// that only ever get logged or turned into an HTTP response use `anyhow`
// further up the stack (see api::rest).
//
// =============================================================================

use thiserror::Error;

use crate::types::FailureCode;

/// Errors surfaced by `PredictionStore`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("prediction {0} not found")]
    PredictionNotFound(String),

    #[error("duplicate id {0}")]
    DuplicateId(String),

    #[error("prediction {0} already verified")]
    AlreadyVerified(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors surfaced by a `PatternMatcher` implementation.
#[derive(Debug, Error)]
pub enum MatcherError {
    #[error("no forecast available for {symbol}")]
    NoData { symbol: String },

    #[error("matcher returned an error status: {0}")]
    MatcherStatus(String),

    #[error("matcher request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl MatcherError {
    pub fn failure_code(&self) -> FailureCode {
        match self {
            Self::NoData { .. } => FailureCode::NoData,
            Self::MatcherStatus(_) => FailureCode::Matcher,
            Self::Transport(_) => FailureCode::Matcher,
        }
    }
}

/// Errors surfaced by a `PriceSource` implementation.
#[derive(Debug, Error)]
pub enum PriceError {
    #[error("no price available for {symbol} at {when}")]
    Unavailable { symbol: String, when: String },

    #[error("price request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl PriceError {
    pub fn failure_code(&self) -> FailureCode {
        FailureCode::Price
    }
}

/// Errors that can occur while scanning a single symbol. Every variant maps
/// onto a `FailureCode` so the scan engine can record a row in `failures`.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("{symbol} is closed for trading on this day")]
    Weekend { symbol: String },

    #[error(transparent)]
    Matcher(#[from] MatcherError),

    #[error(transparent)]
    Price(#[from] PriceError),

    #[error("unexpected error scanning {symbol}: {reason}")]
    Unknown { symbol: String, reason: String },
}

impl ScanError {
    pub fn failure_code(&self) -> FailureCode {
        match self {
            Self::Weekend { .. } => FailureCode::Weekend,
            Self::Matcher(e) => e.failure_code(),
            Self::Price(e) => e.failure_code(),
            Self::Unknown { .. } => FailureCode::Unknown,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Self::Weekend { symbol } => symbol,
            Self::Matcher(MatcherError::NoData { symbol }) => symbol,
            Self::Matcher(_) => "",
            Self::Price(PriceError::Unavailable { symbol, .. }) => symbol,
            Self::Price(_) => "",
            Self::Unknown { symbol, .. } => symbol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_error_maps_to_expected_failure_codes() {
        let e = ScanError::Weekend { symbol: "BTCUSDT".into() };
        assert_eq!(e.failure_code(), FailureCode::Weekend);

        let e = ScanError::Matcher(MatcherError::NoData { symbol: "ETHUSDT".into() });
        assert_eq!(e.failure_code(), FailureCode::NoData);

        let e = ScanError::Unknown { symbol: "SOLUSDT".into(), reason: "boom".into() };
        assert_eq!(e.failure_code(), FailureCode::Unknown);
    }
}
