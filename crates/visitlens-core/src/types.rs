//! Core value types for VisitLens

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Text accepted by numeric coercion.
///
/// Shared verbatim with the query-pushdown renderer so that both backends
/// agree on which strings count as numbers. Surrounding space is the ASCII
/// set spelled out, since `\s` follows the database locale.
pub const NUMERIC_PATTERN: &str =
    r"^[ \t\n\v\f\r]*[-+]?([0-9]+\.?[0-9]*|\.[0-9]+)([eE][-+]?[0-9]+)?[ \t\n\v\f\r]*$";

/// Matches text holding at least one non-space character; shared with the renderer
pub const NON_BLANK_PATTERN: &str = r"[^ \t\n\v\f\r]";

static NUMERIC_TEXT: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(NUMERIC_PATTERN).ok());

/// Value produced by extraction, transformation and aggregation.
///
/// Serialized untagged so cached results and reports read as plain JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Boolean value
    Boolean(bool),
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit floating point
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Ordered list of values
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Convert an extracted JSON node. `null` is absent; objects keep their JSON text.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(FieldValue::Boolean(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(FieldValue::Integer(i)),
                None => n.as_f64().map(FieldValue::Float),
            },
            Value::String(s) => Some(FieldValue::String(s.clone())),
            Value::Array(items) => Some(FieldValue::List(
                items.iter().filter_map(FieldValue::from_json).collect(),
            )),
            Value::Object(_) => Some(FieldValue::String(value.to_string())),
        }
    }

    /// Get the type name of this field value
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Boolean(_) => "boolean",
            FieldValue::Integer(_) => "integer",
            FieldValue::Float(_) => "float",
            FieldValue::String(_) => "string",
            FieldValue::List(_) => "list",
        }
    }

    /// Numeric view of numeric variants only
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Numeric coercion used by sum/avg/min/max, histograms and numeric transforms.
    ///
    /// Numbers coerce directly, strings only when they match [`NUMERIC_PATTERN`].
    pub fn coerce_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) if v.is_finite() => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::String(s) => parse_numeric_text(s),
            _ => None,
        }
    }

    /// Try to get as string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Text form matching the relational store's JSON-to-text conversion.
    ///
    /// Numbers print as plain decimals with no trailing zeros, so `1.50`,
    /// `1.5` and `15e-1` all read `1.5` and `1e2` reads `100`.
    pub fn to_text(&self) -> String {
        match self {
            FieldValue::String(s) => s.clone(),
            FieldValue::Boolean(b) => b.to_string(),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Float(f) if *f == 0.0 => "0".to_string(),
            FieldValue::Float(f) => f.to_string(),
            FieldValue::List(_) => serde_json::to_string(self).unwrap_or_default(),
        }
    }

    /// Equality key for de-duplication.
    ///
    /// Lists have no key: they are not comparable for distinct counting.
    pub fn dedupe_key(&self) -> Option<String> {
        match self {
            FieldValue::List(_) => None,
            other => Some(format!("{}:{}", other.type_name(), other.to_text())),
        }
    }
}

/// Parse text under the shared numeric grammar.
pub fn parse_numeric_text(text: &str) -> Option<f64> {
    let matches = NUMERIC_TEXT.as_ref().is_some_and(|re| re.is_match(text));
    if !matches {
        return None;
    }
    text.trim_matches(is_space)
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// ASCII space as the shared patterns define it; U+00A0 and other Unicode
/// spaces are not space.
pub fn is_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\x0B' | '\x0C' | '\r')
}

/// True when the text holds a non-space character
pub fn is_non_blank(text: &str) -> bool {
    text.chars().any(|c| !is_space(c))
}

/// Round to two decimals, half away from zero, on the value's 15 significant
/// digit decimal form.
///
/// Matches `round(CAST(avg(x) AS NUMERIC), 2)` over double precision `x`:
/// the float8-to-numeric cast keeps 15 significant digits, so `1.005` rounds
/// to `1.01` and `2.675` to `2.68`.
pub fn round2(value: f64) -> f64 {
    if !value.is_finite() || value == 0.0 {
        return value;
    }
    let scientific = format!("{:.14e}", value.abs());
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return value;
    };
    let Ok(exponent) = exponent.parse::<i32>() else {
        return value;
    };
    let digits: Vec<u64> = mantissa
        .chars()
        .filter_map(|c| c.to_digit(10))
        .map(u64::from)
        .collect();

    // Digits at or above the hundredths place
    let keep = exponent + 3;
    if keep >= digits.len() as i32 {
        return scientific
            .parse::<f64>()
            .map(|v| v.copysign(value))
            .unwrap_or(value);
    }
    if keep < 0 {
        return 0.0;
    }

    let keep = keep as usize;
    let mut hundredths = digits[..keep].iter().fold(0u64, |acc, d| acc * 10 + d);
    if digits[keep] >= 5 {
        hundredths += 1;
    }
    if hundredths == 0 {
        return 0.0;
    }
    (hundredths as f64 / 100.0).copysign(value)
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<Vec<FieldValue>> for FieldValue {
    fn from(v: Vec<FieldValue>) -> Self {
        FieldValue::List(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_variants() {
        assert_eq!(FieldValue::from_json(&json!(null)), None);
        assert_eq!(FieldValue::from_json(&json!(3)), Some(FieldValue::Integer(3)));
        assert_eq!(FieldValue::from_json(&json!(3.5)), Some(FieldValue::Float(3.5)));
        assert_eq!(FieldValue::from_json(&json!("x")), Some(FieldValue::String("x".into())));
        assert_eq!(FieldValue::from_json(&json!(true)), Some(FieldValue::Boolean(true)));
        assert_eq!(
            FieldValue::from_json(&json!([1, null, "a"])),
            Some(FieldValue::List(vec![FieldValue::Integer(1), FieldValue::String("a".into())]))
        );
        assert_eq!(
            FieldValue::from_json(&json!({"a": 1})),
            Some(FieldValue::String("{\"a\":1}".into()))
        );
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(FieldValue::Integer(4).coerce_f64(), Some(4.0));
        assert_eq!(FieldValue::String(" 12.5 ".into()).coerce_f64(), Some(12.5));
        assert_eq!(FieldValue::String("-3e2".into()).coerce_f64(), Some(-300.0));
        assert_eq!(FieldValue::String(".5".into()).coerce_f64(), Some(0.5));
        assert_eq!(FieldValue::String("12cm".into()).coerce_f64(), None);
        assert_eq!(FieldValue::String("not-a-number".into()).coerce_f64(), None);
        assert_eq!(FieldValue::String("".into()).coerce_f64(), None);
        assert_eq!(FieldValue::Boolean(true).coerce_f64(), None);
        assert_eq!(FieldValue::List(vec![]).coerce_f64(), None);
    }

    #[test]
    fn test_text_rendering() {
        assert_eq!(FieldValue::Float(1.0).to_text(), "1");
        assert_eq!(FieldValue::Float(1.5).to_text(), "1.5");
        assert_eq!(FieldValue::Float(-0.0).to_text(), "0");
        assert_eq!(FieldValue::Float(1e20).to_text(), "100000000000000000000");
        assert_eq!(FieldValue::Float(0.0000001).to_text(), "0.0000001");
        assert_eq!(FieldValue::Integer(1).to_text(), "1");
        assert_eq!(FieldValue::Boolean(true).to_text(), "true");
        assert_eq!(FieldValue::String("Yes".into()).to_text(), "Yes");
    }

    #[test]
    fn test_dedupe_key_distinguishes_types() {
        let int_key = FieldValue::Integer(1).dedupe_key();
        let text_key = FieldValue::String("1".into()).dedupe_key();
        assert_ne!(int_key, text_key);
        assert!(FieldValue::List(vec![]).dedupe_key().is_none());
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(15.0), 15.0);
        assert_eq!(round2(2.346), 2.35);
        assert_eq!(round2(-1.005_1), -1.01);
        assert_eq!(round2(1.0 / 3.0), 0.33);
        assert_eq!(round2(0.004), 0.0);
        assert_eq!(round2(0.005), 0.01);
    }

    #[test]
    fn test_round2_rounds_decimal_halves_up() {
        // Binary 1.005 is 1.00499999999999989..., decimal 1.00500000000000
        assert_eq!(round2(1.005), 1.01);
        assert_eq!(round2(2.675), 2.68);
        assert_eq!(round2(-1.005), -1.01);
        assert_eq!(round2((1.0 + 1.01) / 2.0), 1.01);
        assert_eq!(round2(1234567.125), 1234567.13);
    }

    #[test]
    fn test_numeric_and_blank_use_ascii_space() {
        assert_eq!(parse_numeric_text("\t7\r\n"), Some(7.0));
        assert_eq!(parse_numeric_text("\u{00A0}7"), None);
        assert!(!is_non_blank(" \t\x0B\x0C\r\n"));
        assert!(is_non_blank("\u{00A0}"));
        assert!(is_non_blank("\u{2003}"));
        assert!(!is_non_blank(""));
    }

    #[test]
    fn test_untagged_serialization() {
        let values = vec![
            FieldValue::Integer(3),
            FieldValue::Float(15.0),
            FieldValue::String("a".into()),
            FieldValue::Boolean(false),
        ];
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, r#"[3,15.0,"a",false]"#);
        let decoded: Vec<FieldValue> = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, values);
    }
}
