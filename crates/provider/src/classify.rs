//! Classification of translation and monitoring API failures
//!
//! Distinguishes provider-side quota exhaustion (429 with a quota message)
//! from transient rate limiting, and flags credential rejections as permanent.

use crate::ErrorClassification;

/// Message fragments that mark a 429 as quota exhaustion rather than a
/// short-lived rate limit.
const QUOTA_PATTERNS: &[&str] = &[
    "quota exceeded",
    "user rate limit exceeded",
    "characters per month",
    "resource_exhausted",
];

/// Classify an upstream error by HTTP status and response body.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    match status {
        429 => {
            let lower = body.to_lowercase();
            if QUOTA_PATTERNS.iter().any(|p| lower.contains(p)) {
                ErrorClassification::QuotaExceeded
            } else {
                ErrorClassification::Transient
            }
        }
        400 | 401 | 403 => ErrorClassification::Permanent,
        _ => ErrorClassification::Transient,
    }
}
