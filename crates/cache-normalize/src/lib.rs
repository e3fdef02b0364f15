#![doc(issue_tracker_base_url = "https://github.com/stockcache/fabric/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Converts raw upstream bars into the canonical, adjustment-consistent
//! sequence the storage and cache tiers persist.
//!
//! The pipeline is a pure function of its inputs: the same raw bars and the
//! same corporate-action set always produce the same normalized bars, and
//! normalizing an already-normalized sequence again is a no-op (the pipeline
//! never reads `adjusted_close` back out of its own output).

use cache_core::types::Bar;
use chrono::NaiveDate;
use tracing::{instrument, warn};

/// One corporate action affecting a symbol's adjustment factor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CorporateAction {
    /// Date the action takes effect.
    pub action_date: NaiveDate,
    /// Kind of action.
    pub action_type: ActionType,
    /// Cumulative split ratio as of this action (`1.0` for a pure dividend).
    pub split_ratio: f64,
    /// Dividend amount paid (`0.0` for a pure split).
    pub dividend_amount: f64,
    /// Price-space adjustment factor: `1 / split_ratio` for a split, `1.0`
    /// for a dividend (dividends adjust price history upstream of this
    /// pipeline; this pipeline only applies the split factor to price).
    pub adjustment_factor: f64,
}

/// The kind of corporate action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionType {
    /// A stock split (or reverse split).
    Split,
    /// A cash dividend.
    Dividend,
}

/// A single raw OHLCV observation as received from an upstream provider,
/// before adjustment.
#[derive(Clone, Debug, PartialEq)]
pub struct RawBar {
    /// Calendar date of the observation.
    pub date: NaiveDate,
    /// Raw opening price.
    pub open: f64,
    /// Raw high price.
    pub high: f64,
    /// Raw low price.
    pub low: f64,
    /// Raw closing price.
    pub close: f64,
    /// Raw trading volume.
    pub volume: f64,
    /// Trading currency.
    pub currency: String,
    /// Identifier of the upstream provider.
    pub data_source: String,
}

/// A validation problem found while normalizing a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizeIssue {
    /// Date of the bar the issue applies to.
    pub date: NaiveDate,
    /// Human-readable description.
    pub message: String,
}

/// Result of normalizing one batch: the bars ready to store, plus any
/// non-fatal warnings raised along the way.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizeOutcome {
    /// Normalized bars, in the same order as the input.
    pub bars: Vec<Bar>,
    /// Warnings raised during validation (did not fail the batch).
    pub warnings: Vec<NormalizeIssue>,
}

/// Normalizes `raw_bars` against `actions`, per bar in input order.
///
/// `actions` need not be pre-sorted; this function sorts its own copy
/// ascending by `action_date`.
///
/// # Errors
/// Returns every [`NormalizeIssue`] found as an error (not a warning) if the
/// batch fails validation: a negative price/volume, `low > high`, or a
/// non-positive `split_ratio`. The batch is all-or-nothing — either every
/// bar normalizes, or none are returned.
#[instrument(skip(raw_bars, actions), fields(bar_count = raw_bars.len(), action_count = actions.len()))]
pub fn normalize(raw_bars: &[RawBar], actions: &[CorporateAction]) -> Result<NormalizeOutcome, Vec<NormalizeIssue>> {
    let mut sorted_actions = actions.to_vec();
    sorted_actions.sort_by_key(|a| a.action_date);

    // Backward adjustment: a bar is adjusted by every action that takes
    // effect *after* its own date, so a historical pre-split price is
    // restated in today's share terms while the bar on (or after) the
    // action's own date is left alone. Computed in one reverse pass so each
    // action is folded in exactly once as bars walk back past its date.
    let mut price_factor = vec![1.0_f64; raw_bars.len()];
    let mut volume_factor = vec![1.0_f64; raw_bars.len()];
    {
        let mut remaining = sorted_actions.len();
        let mut cumulative_price = 1.0_f64;
        let mut cumulative_volume = 1.0_f64;
        for (i, raw) in raw_bars.iter().enumerate().rev() {
            while remaining > 0 && sorted_actions[remaining - 1].action_date > raw.date {
                remaining -= 1;
                cumulative_price *= sorted_actions[remaining].adjustment_factor;
                cumulative_volume *= sorted_actions[remaining].split_ratio;
            }
            price_factor[i] = cumulative_price;
            volume_factor[i] = cumulative_volume;
        }
    }

    let mut bars = Vec::with_capacity(raw_bars.len());
    let mut warnings = Vec::new();
    let mut errors = Vec::new();

    let mut action_idx = 0usize;
    let mut current: Option<CorporateAction> = None;

    for (i, raw) in raw_bars.iter().enumerate() {
        while action_idx < sorted_actions.len() && sorted_actions[action_idx].action_date <= raw.date {
            current = Some(sorted_actions[action_idx]);
            action_idx += 1;
        }

        // Metadata recorded on the bar: the action in effect as of this
        // bar's own date, independent of the backward price adjustment
        // above (which looks at actions still to come).
        let (split_ratio, dividend) = match current {
            Some(action) => (action.split_ratio, action.dividend_amount),
            None => (1.0, 0.0),
        };

        let open = round4(raw.open * price_factor[i]);
        let high = round4(raw.high * price_factor[i]);
        let low = round4(raw.low * price_factor[i]);
        let close = round4(raw.close * price_factor[i]);
        let adjusted_close = round4(raw.close);
        let volume = (raw.volume * volume_factor[i]).floor();

        if low > high {
            errors.push(NormalizeIssue {
                date: raw.date,
                message: format!("low ({low}) exceeds high ({high})"),
            });
        }
        if !(low <= close && close <= high) {
            warnings.push(NormalizeIssue {
                date: raw.date,
                message: format!("close ({close}) outside [low, high] ([{low}, {high}])"),
            });
        }
        if open < 0.0 || high < 0.0 || low < 0.0 || close < 0.0 || volume < 0.0 {
            errors.push(NormalizeIssue {
                date: raw.date,
                message: "negative price or volume".to_string(),
            });
        }
        if split_ratio <= 0.0 {
            errors.push(NormalizeIssue {
                date: raw.date,
                message: format!("non-positive split ratio ({split_ratio})"),
            });
        }

        bars.push(Bar {
            date: raw.date,
            open,
            high,
            low,
            close,
            volume,
            adjusted_close,
            split_ratio,
            dividend,
            currency: raw.currency.clone(),
            data_source: raw.data_source.clone(),
        });
    }

    if !errors.is_empty() {
        warn!(error_count = errors.len(), "normalization batch rejected");
        return Err(errors);
    }

    Ok(NormalizeOutcome { bars, warnings })
}

/// Rounds `value` to 4 decimal places using round-half-away-from-zero.
///
/// `f64::round()` already rounds halves away from zero, so this only needs
/// to scale, round, and rescale without introducing banker's rounding.
#[must_use]
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(date: NaiveDate, o: f64, h: f64, l: f64, c: f64, v: f64) -> RawBar {
        RawBar {
            date,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: v,
            currency: "USD".into(),
            data_source: "test".into(),
        }
    }

    #[test]
    fn round4_rounds_half_away_from_zero() {
        assert_eq!(round4(1.00005), 1.0001);
        assert_eq!(round4(-1.00005), -1.0001);
        assert_eq!(round4(1.23455), 1.2346);
    }

    #[test]
    fn no_actions_passes_through_unadjusted() {
        let bars = vec![raw(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), 10.0, 11.0, 9.0, 10.5, 1000.0)];
        let outcome = normalize(&bars, &[]).unwrap();
        assert_eq!(outcome.bars.len(), 1);
        assert_eq!(outcome.bars[0].close, 10.5);
        assert_eq!(outcome.bars[0].adjusted_close, 10.5);
        assert_eq!(outcome.bars[0].split_ratio, 1.0);
        assert_eq!(outcome.bars[0].volume, 1000.0);
    }

    #[test]
    fn split_backward_adjusts_bars_before_the_action_date() {
        // NVDA-style 4:1 split: closes of 600 and 605, split dated on the
        // second day. The pre-split day is restated in post-split terms
        // (close -> 150.0000, volume x4); the day the split already took
        // effect on is left untouched.
        let action = CorporateAction {
            action_date: NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
            action_type: ActionType::Split,
            split_ratio: 4.0,
            dividend_amount: 0.0,
            adjustment_factor: 0.25,
        };
        let bars = vec![
            raw(NaiveDate::from_ymd_opt(2024, 6, 9).unwrap(), 600.0, 600.0, 600.0, 600.0, 250_000.0),
            raw(NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(), 605.0, 605.0, 605.0, 605.0, 5_000_000.0),
        ];
        let outcome = normalize(&bars, &[action]).unwrap();

        assert_eq!(outcome.bars[0].close, 150.0);
        assert_eq!(outcome.bars[0].volume, 1_000_000.0);
        assert_eq!(outcome.bars[0].split_ratio, 1.0);

        assert_eq!(outcome.bars[1].close, 605.0);
        assert_eq!(outcome.bars[1].volume, 5_000_000.0);
        assert_eq!(outcome.bars[1].split_ratio, 4.0);
    }

    #[test]
    fn idempotent_on_its_own_output() {
        let action = CorporateAction {
            action_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            action_type: ActionType::Split,
            split_ratio: 2.0,
            dividend_amount: 0.0,
            adjustment_factor: 0.5,
        };
        let raw_bars = vec![raw(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), 50.0, 52.0, 48.0, 51.0, 2_000_000.0)];
        let first = normalize(&raw_bars, &[action]).unwrap();
        assert_eq!(first.bars[0].open, 25.0);

        let reinput: Vec<RawBar> = first
            .bars
            .iter()
            .map(|b| RawBar {
                date: b.date,
                open: b.open,
                high: b.high,
                low: b.low,
                close: b.adjusted_close,
                volume: b.volume,
                currency: b.currency.clone(),
                data_source: b.data_source.clone(),
            })
            .collect();
        let second = normalize(&reinput, &[]).unwrap();
        assert_eq!(first.bars[0].open, second.bars[0].open);
        assert_eq!(first.bars[0].adjusted_close, second.bars[0].adjusted_close);
    }

    #[test]
    fn low_above_high_is_rejected() {
        let bars = vec![raw(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), 10.0, 9.0, 11.0, 10.0, 100.0)];
        let errors = normalize(&bars, &[]).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("low"));
    }

    #[test]
    fn close_outside_range_warns_but_does_not_fail() {
        let bars = vec![raw(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), 10.0, 11.0, 9.0, 12.0, 100.0)];
        let outcome = normalize(&bars, &[]).unwrap();
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn non_positive_split_ratio_is_rejected() {
        let action = CorporateAction {
            action_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            action_type: ActionType::Split,
            split_ratio: 0.0,
            dividend_amount: 0.0,
            adjustment_factor: 1.0,
        };
        let bars = vec![raw(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), 10.0, 11.0, 9.0, 10.0, 100.0)];
        let errors = normalize(&bars, &[action]).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("split ratio")));
    }
}
