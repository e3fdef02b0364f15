//! Default time-to-live policy per cache-key class.
//!
//! These are the fallback durations used when a caller doesn't override the
//! TTL explicitly; callers that need a shorter or longer freshness window
//! (backfills, intraday refreshes) pass their own duration straight to the
//! storage/tier layers instead of going through this table.

use std::time::Duration;

use crate::types::DataType;

/// Returns the default TTL for a cache-key class (spec §4.2.4).
#[must_use]
pub const fn default_ttl(data_type: DataType) -> Duration {
    match data_type {
        DataType::Ohlcv => Duration::from_secs(15 * 60),
        DataType::Indicator => Duration::from_secs(60 * 60),
        DataType::Fundamental => Duration::from_secs(6 * 60 * 60),
        DataType::Fx => Duration::from_secs(60 * 60),
        DataType::Analysis => Duration::from_secs(60 * 60),
        DataType::Unknown => Duration::from_secs(60 * 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ohlcv_ttl_is_fifteen_minutes() {
        assert_eq!(default_ttl(DataType::Ohlcv), Duration::from_secs(900));
    }

    #[test]
    fn fundamental_ttl_is_six_hours() {
        assert_eq!(default_ttl(DataType::Fundamental), Duration::from_secs(21_600));
    }

    #[test]
    fn indicator_fx_analysis_share_one_hour() {
        let hour = Duration::from_secs(3_600);
        assert_eq!(default_ttl(DataType::Indicator), hour);
        assert_eq!(default_ttl(DataType::Fx), hour);
        assert_eq!(default_ttl(DataType::Analysis), hour);
    }
}
