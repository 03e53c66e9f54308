//! Drift detection between a desired object and what the API server returned
//!
//! The API server fills in many fields the controller never sets (defaults,
//! allocated IPs, mutating webhook additions). A plain equality check would
//! therefore report drift on every pass. Instead the desired document is
//! compared as a *derivative* of the existing one: anything left unset in the
//! desired document is ignored, everything set must match.
//!
//! Resource quantities are compared by value since the API server rewrites
//! them into canonical form (`0.5` comes back as `500m`, `1024Mi` as `1Gi`).

use serde::Serialize;
use serde_json::Value;

/// Maps whose values are all resource quantities
const QUANTITY_MAPS: [&str; 3] = ["limits", "requests", "overhead"];

/// Fields holding a single resource quantity
const QUANTITY_FIELDS: [&str; 1] = ["sizeLimit"];

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: [(&str, i32); 9] = [
    ("n", -9),
    ("u", -6),
    ("m", -3),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

/// True when every field set in `desired` has the same value in `existing`.
///
/// Null, empty strings, empty lists and empty maps in `desired` are treated as
/// unset. Lists match when `existing` has at least as many items and the
/// leading items match pairwise.
pub fn is_derivative(desired: &Value, existing: &Value) -> bool {
    if is_unset(desired) {
        return true;
    }
    match (desired, existing) {
        (Value::Object(d), Value::Object(e)) => d.iter().all(|(key, d_value)| match e.get(key) {
            Some(e_value) if QUANTITY_MAPS.contains(&key.as_str()) => {
                quantity_map_is_derivative(d_value, e_value)
            }
            Some(e_value) if QUANTITY_FIELDS.contains(&key.as_str()) => {
                is_unset(d_value) || same_quantity(d_value, e_value)
            }
            Some(e_value) => is_derivative(d_value, e_value),
            None => is_unset(d_value),
        }),
        (Value::Array(d), Value::Array(e)) => {
            d.len() <= e.len() && d.iter().zip(e.iter()).all(|(a, b)| is_derivative(a, b))
        }
        _ => desired == existing,
    }
}

fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn quantity_map_is_derivative(desired: &Value, existing: &Value) -> bool {
    match (desired, existing) {
        (Value::Object(d), Value::Object(e)) => d.iter().all(|(name, d_value)| {
            is_unset(d_value) || e.get(name).is_some_and(|e_value| same_quantity(d_value, e_value))
        }),
        _ => is_derivative(desired, existing),
    }
}

/// Compare two quantities by value, falling back to the derivative check
/// when either side does not parse.
fn same_quantity(a: &Value, b: &Value) -> bool {
    match (quantity_value(a), quantity_value(b)) {
        (Some(x), Some(y)) => x == y,
        _ => is_derivative(a, b),
    }
}

fn quantity_value(value: &Value) -> Option<i128> {
    match value {
        Value::String(s) => parse_quantity(s),
        Value::Number(n) => parse_quantity(&n.to_string()),
        _ => None,
    }
}

/// Parse a Kubernetes quantity ("500m", "1.5Gi", "2e3") into nano-units.
///
/// Values finer than a nano-unit are rounded up, as the API server does.
fn parse_quantity(qty: &str) -> Option<i128> {
    let qty = qty.trim();
    let (number, binary_power, exponent) =
        if let Some((suffix, power)) = BINARY_SUFFIXES.iter().find(|(s, _)| qty.ends_with(s)) {
            (&qty[..qty.len() - suffix.len()], *power, 0)
        } else if let Some((mantissa, exponent)) = split_exponent(qty) {
            (mantissa, 0, exponent)
        } else if let Some((suffix, exponent)) =
            DECIMAL_SUFFIXES.iter().find(|(s, _)| qty.ends_with(s))
        {
            (&qty[..qty.len() - suffix.len()], 0, *exponent)
        } else {
            (qty, 0, 0)
        };

    let (negative, number) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }
    let digits: i128 = format!("{whole}{fraction}").parse().ok()?;

    let scale = 9 + exponent - i32::try_from(fraction.len()).ok()?;
    let nanos = if scale >= 0 {
        digits.checked_mul(10i128.checked_pow(scale.unsigned_abs())?)?
    } else {
        let divisor = 10i128.checked_pow(scale.unsigned_abs())?;
        digits.checked_add(divisor - 1)? / divisor
    };
    let nanos = nanos.checked_mul(1024i128.checked_pow(binary_power)?)?;
    Some(if negative { -nanos } else { nanos })
}

/// Split "1.5e3" into ("1.5", 3). A bare trailing `E` is the exa suffix.
fn split_exponent(qty: &str) -> Option<(&str, i32)> {
    let pos = qty.rfind(['e', 'E'])?;
    let exponent = &qty[pos + 1..];
    if pos == 0 || exponent.is_empty() {
        return None;
    }
    Some((&qty[..pos], exponent.parse().ok()?))
}

/// Serialize both sides and report whether `desired` would change `existing`
pub fn differs<T: Serialize>(desired: &T, existing: &T) -> crate::Result<bool> {
    let desired = serde_json::to_value(desired)?;
    let existing = serde_json::to_value(existing)?;
    Ok(!is_derivative(&desired, &existing))
}
