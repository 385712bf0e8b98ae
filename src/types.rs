// =============================================================================
// Shared types used across the pattern-realtime engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Status of a batch scan job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(format!("invalid job status: {other}")),
        }
    }
}

/// Directional bias of a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    UP,
    DOWN,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UP => write!(f, "UP"),
            Self::DOWN => write!(f, "DOWN"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UP" => Ok(Self::UP),
            "DOWN" => Ok(Self::DOWN),
            other => Err(format!("invalid direction: {other}")),
        }
    }
}

/// Per-symbol failure taxonomy. Variants are idiomatic PascalCase in Rust;
/// `rename_all` recovers the SCREAMING_SNAKE_CASE wire contract spec.md
/// requires, the same split `JobStatus` and `SortBy` use in this file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    Weekend,
    NoData,
    Price,
    Matcher,
    Unknown,
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Weekend => write!(f, "WEEKEND"),
            Self::NoData => write!(f, "NO_DATA"),
            Self::Price => write!(f, "PRICE"),
            Self::Matcher => write!(f, "MATCHER"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl std::str::FromStr for FailureCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WEEKEND" => Ok(Self::Weekend),
            "NO_DATA" => Ok(Self::NoData),
            "PRICE" => Ok(Self::Price),
            "MATCHER" => Ok(Self::Matcher),
            _ => Ok(Self::Unknown),
        }
    }
}

impl FailureCode {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Weekend => "scan attempted on a non-trading day",
            Self::NoData => "matcher returned no forecast for this symbol",
            Self::Price => "could not determine price at scan or horizon time",
            Self::Matcher => "matcher signaled an error status",
            Self::Unknown => "uncaught error",
        }
    }
}

/// Sort key accepted by `GET /pattern-realtime/job/{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    Edge,
    ProbUp,
    MeanReturn,
    Symbol,
}

impl Default for SortBy {
    fn default() -> Self {
        Self::Edge
    }
}

/// Round a value to 4 decimal places, the wire-precision contract used for
/// every probability, return, and PnL value.
pub fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}
