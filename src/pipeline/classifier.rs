//! Maps a failed attempt onto an error category and a retryable verdict.
//!
//! Precedence: transient status/network → invalid image → parsing → unknown.

use serde::Serialize;
use strum::Display;

use crate::services::meals::MealError;
use crate::services::vision::AnalysisError;

const RATE_LIMIT_STATUS: u16 = 429;
const TRANSIENT_STATUSES: [u16; 4] = [500, 502, 503, 504];
const TRANSIENT_NETWORK_CODES: [&str; 7] = [
    "ECONNRESET",
    "ECONNREFUSED",
    "ECONNABORTED",
    "ETIMEDOUT",
    "EPIPE",
    "ENOTFOUND",
    "EAI_AGAIN",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Network,
    RateLimit,
    InvalidImage,
    Parsing,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub retryable: bool,
}

impl Classification {
    const fn retryable(category: ErrorCategory) -> Self {
        Self { category, retryable: true }
    }

    const fn permanent(category: ErrorCategory) -> Self {
        Self { category, retryable: false }
    }
}

/// Classify an error raised by the vision collaborator.
pub fn classify(err: &AnalysisError) -> Classification {
    match err {
        AnalysisError::Http { status, .. } if *status == RATE_LIMIT_STATUS => {
            Classification::retryable(ErrorCategory::RateLimit)
        }
        AnalysisError::Http { status, .. } if TRANSIENT_STATUSES.contains(status) => {
            Classification::retryable(ErrorCategory::Network)
        }
        AnalysisError::Network { code, .. }
            if TRANSIENT_NETWORK_CODES.contains(&code.as_str()) =>
        {
            Classification::retryable(ErrorCategory::Network)
        }
        AnalysisError::Timeout(_) => Classification::retryable(ErrorCategory::Network),
        AnalysisError::InvalidImage(_) => Classification::permanent(ErrorCategory::InvalidImage),
        AnalysisError::Parse(_) => Classification::retryable(ErrorCategory::Parsing),
        AnalysisError::Http { .. } | AnalysisError::Network { .. } | AnalysisError::Other(_) => {
            Classification::retryable(ErrorCategory::Unknown)
        }
    }
}

/// Classify an error raised by the meal-persistence collaborator.
pub fn classify_persistence(err: &MealError) -> Classification {
    match err {
        MealError::Database(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) => {
            Classification::retryable(ErrorCategory::Network)
        }
        _ => Classification::retryable(ErrorCategory::Unknown),
    }
}
