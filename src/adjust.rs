//! Weight, volume and dilution factor checks
//!
//! A reported concentration scales linearly with the sample weight, solution volume and
//! dilution factor used to compute it, so correcting one of those values rescales `corr_con` by
//! the ratio of new to old value.

use std::collections::BTreeSet;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::measurement::{Field, RawMeasurementRow};
use crate::pivot::normalise_label;
use crate::store::FieldWrite;
use crate::Result;

/// The fields whose values feed linearly into the reported concentration
pub const PREPARATION_FIELDS: [Field; 3] = [Field::Weight, Field::Volume, Field::DilutionFactor];

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    /// # Errors
    /// Returns a validation error for an inverted or non-finite range.
    pub fn new(min: f64, max: f64) -> Result<Self> {
        if !min.is_finite() || !max.is_finite() || min > max {
            return Err(Error::Validation(format!("[{min}, {max}] is not a valid range")));
        }
        Ok(Self { min, max })
    }

    pub fn midpoint(&self) -> f64 {
        (self.min + self.max) / 2.
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FlaggedValue {
    pub label: String,
    pub field: Field,
    pub value: f64,
    pub midpoint: f64,
    /// Distance from the midpoint of the accepted range
    pub deviation: f64,
}

/// One flag per sample label whose `field` value lies outside `range`
///
/// The first recorded value of each label is checked.
pub fn flag_out_of_range(
    rows: &[RawMeasurementRow],
    field: Field,
    range: ValueRange,
) -> Vec<FlaggedValue> {
    let mut seen = BTreeSet::new();
    let midpoint = range.midpoint();
    rows.iter()
        .filter_map(|row| Some((normalise_label(&row.label), row.get(field)?)))
        .filter(|(label, _)| seen.insert(label.clone()))
        .filter(|(_, value)| !range.contains(*value))
        .map(|(label, value)| FlaggedValue {
            label,
            field,
            value,
            midpoint,
            deviation: (value - midpoint).abs(),
        })
        .collect()
}

/// The concentration after changing a preparation value from `old` to `new`
///
/// # Errors
/// Returns a validation error if either preparation value is not positive.
pub fn rescale_concentration(old: f64, old_corr_con: f64, new: f64) -> Result<f64> {
    if !(old > 0.) || !(new > 0.) {
        return Err(Error::Validation(format!(
            "preparation values must be positive, got {old} -> {new}"
        )));
    }
    Ok(old_corr_con * new / old)
}

/// The writes setting `field` to `new_value` on every row of `label`, with `corr_con` rescaled
///
/// # Errors
/// Returns a validation error if `field` is not a preparation field or `new_value` is not
/// positive, and a not-found error if no row carries the label.
pub fn field_change_writes(
    rows: &[RawMeasurementRow],
    label: &str,
    field: Field,
    new_value: f64,
) -> Result<Vec<FieldWrite>> {
    if !PREPARATION_FIELDS.contains(&field) {
        return Err(Error::Validation(format!(
            "{field} is not a weight, volume or dilution factor"
        )));
    }
    if !(new_value > 0.) {
        return Err(Error::Validation(format!("{field} must be positive, got {new_value}")));
    }

    let label = normalise_label(label);
    let matching = rows
        .iter()
        .filter(|row| normalise_label(&row.label) == label)
        .collect::<Vec<_>>();
    if matching.is_empty() {
        return Err(Error::DataNotFound(format!("no rows labelled `{label}`")));
    }

    let mut writes = vec![];
    for row in matching {
        let write = |field, new_value| FieldWrite {
            sample_label: label.clone(),
            element: row.element.clone(),
            row_index: Some(row.index),
            field,
            new_value,
        };
        writes.push(write(field, Some(new_value)));
        match (row.get(field), row.corr_con) {
            (Some(old), Some(corr_con)) if old > 0. => {
                writes.push(write(
                    Field::CorrCon,
                    Some(rescale_concentration(old, corr_con, new_value)?),
                ));
            }
            (_, Some(_)) => warn!(
                "{label} {}: no positive {field} recorded, concentration left unscaled",
                row.element
            ),
            _ => {}
        }
    }
    Ok(writes)
}
