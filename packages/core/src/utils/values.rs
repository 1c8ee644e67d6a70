//! Value codec
//!
//! Canonical string forms for typed property values, and escaping helpers
//! for the formats the mirrored content is exported to.

use crate::tree::PropertyValue;

/// Format used for date values
pub const DATE_FORMAT: &str = "%Y/%m/%d %H:%M";

/// Canonical string for a single property value
///
/// Returns `None` for value types that have no textual form (binary data,
/// references); such values are not mirrored.
pub fn value_to_string(value: &PropertyValue) -> Option<String> {
    match value {
        PropertyValue::String(s) => Some(s.clone()),
        PropertyValue::Boolean(b) => Some(if *b { "true" } else { "false" }.to_string()),
        PropertyValue::Long(n) => Some(n.to_string()),
        PropertyValue::Double(d) => Some(double_to_string(*d)),
        PropertyValue::Date(dt) => Some(dt.format(DATE_FORMAT).to_string()),
        PropertyValue::Decimal(d) => Some(d.trim().to_string()),
        PropertyValue::Binary(_) | PropertyValue::Reference(_) => None,
    }
}

fn double_to_string(d: f64) -> String {
    if d.is_nan() {
        "NaN".to_string()
    } else if d.is_infinite() {
        if d > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if d == 0.0 || (1e-3..1e7).contains(&d.abs()) {
        // Debug keeps a trailing `.0` on integral values
        format!("{:?}", d)
    } else {
        scientific(d)
    }
}

/// `1.0E20` / `-1.25E-7` form used outside [10^-3, 10^7)
fn scientific(d: f64) -> String {
    let formatted = format!("{:e}", d);
    match formatted.split_once('e') {
        Some((mantissa, exponent)) if mantissa.contains('.') => {
            format!("{}E{}", mantissa, exponent)
        }
        Some((mantissa, exponent)) => format!("{}.0E{}", mantissa, exponent),
        None => formatted,
    }
}

/// Escape a value for the brace-quoted text report format
pub fn escape_curly_braces(value: &str) -> String {
    value
        .replace('{', "\\{")
        .replace('}', "\\}")
        .replace('\r', "\\r")
        .replace('\n', "\\n")
}

/// Escape a value for embedding inside a quoted SQL literal
pub fn escape_sql_literal(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '\0' => escaped.push_str("\\0"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\'' => escaped.push_str("\\'"),
            '"' => escaped.push_str("\\\""),
            other => escaped.push(other),
        }
    }
    escaped
}
