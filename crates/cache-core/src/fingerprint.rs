//! Canonical cache-key and uniqueness-key derivation.
//!
//! Two parameter sets that are structurally equal as mappings (regardless of
//! key insertion order) must produce byte-identical fingerprints. This
//! module is the single place that contract is implemented, so storage
//! uniqueness keys and in-process cache keys never drift apart.

use serde::Serialize;
use serde_json::Value;

use crate::types::DataType;

/// Computes the canonical parameter fingerprint for any serializable
/// parameter set.
///
/// Rules (spec §4.5):
/// - object keys are sorted lexicographically
/// - numbers are emitted without trailing zeros beyond significance
/// - booleans as `true`/`false`
/// - no insignificant whitespace
///
/// `serde_json::Value`'s default map (no `preserve_order` feature) is a
/// `BTreeMap`, so object keys already iterate in sorted order; this function
/// only needs to re-render numbers and strip whitespace.
pub fn parameter_fingerprint<T: Serialize>(params: &T) -> String {
    let value = serde_json::to_value(params).unwrap_or(Value::Null);
    canonical_json(&value)
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => canonical_number(n),
        Value::String(s) => serde_json::to_string(s).unwrap_or_default(),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        Value::Object(map) => {
            let rendered: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), canonical_json(v)))
                .collect();
            format!("{{{}}}", rendered.join(","))
        }
    }
}

/// Renders a JSON number trimming trailing fractional zeros, so `14.50` and
/// `14.5` (and `14.0` and `14`) fingerprint identically.
fn canonical_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    let f = n.as_f64().unwrap_or(0.0);
    if f.fract() == 0.0 && f.abs() < 1e15 {
        return format!("{}", f as i64);
    }
    let mut s = format!("{f}");
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    s
}

/// Builds the opaque composite cache key used across the fabric:
/// `"{class}:{symbol}:{range_start}:{range_end}[:{param_fingerprint}]"`.
///
/// `symbol` is expected already uppercased; ISO dates and uppercase symbols
/// never contain a colon, so component boundaries are unambiguous.
#[must_use]
pub fn cache_key(
    data_type: DataType,
    symbol: &str,
    range_start: &str,
    range_end: &str,
    param_fingerprint: Option<&str>,
) -> String {
    match param_fingerprint {
        Some(fp) => format!(
            "{}:{}:{}:{}:{}",
            data_type.key_class(),
            symbol,
            range_start,
            range_end,
            fp
        ),
        None => format!(
            "{}:{}:{}:{}",
            data_type.key_class(),
            symbol,
            range_start,
            range_end
        ),
    }
}

/// Builds the analysis cache key `"analyze:{symbol}"`, the one composite key
/// shape with no range component.
#[must_use]
pub fn analysis_cache_key(symbol: &str) -> String {
    format!("{}:{}", DataType::Analysis.key_class(), symbol)
}

/// Builds the FX cache key `"fx:{from}:{to}"`.
#[must_use]
pub fn fx_cache_key(from: &str, to: &str) -> String {
    format!("{}:{}:{}", DataType::Fx.key_class(), from, to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IndicatorParameters;

    #[test]
    fn fingerprints_are_order_independent() {
        // Both constructed the same way here, but the contract under test is
        // that BTreeMap-backed serialization makes field order irrelevant:
        // whichever field is set first, the rendered fingerprint is identical.
        let a = IndicatorParameters {
            period: Some(14),
            fast_period: None,
            slow_period: None,
            signal_period: None,
            std_dev: None,
        };
        let b = IndicatorParameters {
            std_dev: None,
            signal_period: None,
            slow_period: None,
            fast_period: None,
            period: Some(14),
        };
        assert_eq!(parameter_fingerprint(&a), parameter_fingerprint(&b));
    }

    #[test]
    fn fingerprints_trim_trailing_zeros() {
        let a = IndicatorParameters {
            std_dev: Some(2.0),
            ..Default::default()
        };
        let b = IndicatorParameters {
            std_dev: Some(2.00),
            ..Default::default()
        };
        assert_eq!(parameter_fingerprint(&a), parameter_fingerprint(&b));
        assert!(parameter_fingerprint(&a).contains("\"std_dev\":2"));
        assert!(!parameter_fingerprint(&a).contains("2.0"));
    }

    #[test]
    fn distinct_parameters_produce_distinct_fingerprints() {
        let a = IndicatorParameters {
            period: Some(14),
            ..Default::default()
        };
        let b = IndicatorParameters {
            period: Some(21),
            ..Default::default()
        };
        assert_ne!(parameter_fingerprint(&a), parameter_fingerprint(&b));
    }

    #[test]
    fn composite_cache_key_shape() {
        let key = cache_key(DataType::Ohlcv, "AAPL", "2024-01-01", "2024-01-31", None);
        assert_eq!(key, "ohlcv:AAPL:2024-01-01:2024-01-31");

        let key = cache_key(
            DataType::Indicator,
            "AAPL",
            "2024-01-01",
            "2024-01-31",
            Some("{\"period\":14}"),
        );
        assert_eq!(key, "indicators:AAPL:2024-01-01:2024-01-31:{\"period\":14}");
    }

    #[test]
    fn analysis_key_has_no_range() {
        assert_eq!(analysis_cache_key("MSFT"), "analyze:MSFT");
    }
}
