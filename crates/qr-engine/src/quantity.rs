//! Unit-aware quantity comparison.
//!
//! Quantities coded on the units-of-measure system are converted through
//! `octofhir_ucum` before comparing; anything else compares by raw value only when the
//! unit text matches exactly.

use std::cmp::Ordering;

use tracing::trace;

use crate::datatypes::{Quantity, UCUM_SYSTEM};

/// Rounding applied to converted values so that e.g. 1 g and 1000 mg compare equal.
const PRECISION: f64 = 1e12;

fn round(value: f64) -> f64 {
    (value * PRECISION).round() / PRECISION
}

/// Unit code usable for conversion: coded on the shared system, or carrying a code
/// with no system at all.
fn ucum_code(quantity: &Quantity) -> Option<&str> {
    let code = quantity.code.as_deref().filter(|code| !code.is_empty())?;
    match quantity.system.as_deref() {
        None => Some(code),
        Some(system) if system == UCUM_SYSTEM => Some(code),
        Some(_) => None,
    }
}

/// Converts `value` expressed in `from` into `to`. `None` when either unit is not a
/// recognized code or the dimensions differ.
pub fn convert(value: f64, from: &str, to: &str) -> Option<f64> {
    if from == to {
        return Some(value);
    }
    let from_analysis = octofhir_ucum::analyse(from).ok()?;
    let to_analysis = octofhir_ucum::analyse(to).ok()?;
    if from_analysis.dimension != to_analysis.dimension {
        return None;
    }
    let factor = from_analysis.factor / to_analysis.factor;
    let offset = from_analysis.offset - to_analysis.offset;
    Some(round(value * factor + offset))
}

/// Signed difference `a - b`, expressed in `b`'s unit.
///
/// `None` when the comparators differ, when either side has no numeric value, or
/// when the units cannot be brought onto a common scale.
pub fn compare(a: &Quantity, b: &Quantity) -> Option<f64> {
    if a.comparator != b.comparator {
        return None;
    }
    let (left, right) = (a.value?, b.value?);

    let has_code = a.code.is_some() || b.code.is_some();
    let difference = match (ucum_code(a), ucum_code(b)) {
        (Some(from), Some(to)) => {
            let converted = convert(left, from, to);
            trace!(from, to, ?converted, "quantity conversion");
            converted? - right
        }
        _ if has_code => {
            if a.code == b.code && a.system == b.system {
                left - right
            } else {
                return None;
            }
        }
        _ => {
            if a.unit == b.unit {
                left - right
            } else {
                return None;
            }
        }
    };
    Some(round(difference))
}

/// Ordering view of [`compare`].
pub fn ordering(a: &Quantity, b: &Quantity) -> Option<Ordering> {
    compare(a, b).and_then(|difference| difference.partial_cmp(&0.0))
}

/// Equality view of [`compare`]; `None` means not comparable, which is distinct
/// from unequal.
pub fn equals(a: &Quantity, b: &Quantity) -> Option<bool> {
    compare(a, b).map(|difference| difference == 0.0)
}
