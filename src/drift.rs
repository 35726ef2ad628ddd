//! Drift correction between bracketing reference standards
//!
//! For a segment bounded by standards at `start` and `end`, the boundary ratio
//! $r = v_{end} / v_{start}$ measures how far the instrument response moved across the segment.
//! Readings inside the segment are corrected by an effective ratio interpolated from `1` at the
//! opening standard.
//!
//! - Linear: $r_i = 1 + (r - 1)\frac{i - start}{end - start}$, corrected $= v_i / r_i$
//! - Stepwise: $r_i = 1 + \frac{r - 1}{end - start}(i - start)$, corrected $= v_i r_i$
//! - Polynomial: a single quadratic through the whole run, corrected $= v_i \bar{y} / p(i)$
//!
//! The polynomial model ignores segmentation entirely.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::Issue;
use crate::math::{linear_fit, mean, polyfit, LinearFit};
use crate::measurement::Field;
use crate::pivot::{split_repeat_suffix, PivotTable};
use crate::segments::DriftSegment;
use crate::store::FieldWrite;
use crate::Result;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriftMethod {
    #[default]
    Linear,
    Stepwise,
    Polynomial,
}

/// Ratio of the closing to the opening standard, `1` when either is missing or the opening is 0
pub fn boundary_ratio(values: &[Option<f64>], start: usize, end: usize) -> f64 {
    match (values.get(start).copied().flatten(), values.get(end).copied().flatten()) {
        (Some(first), Some(last)) if first != 0. => last / first,
        _ => 1.,
    }
}

/// Effective ratio of the linear model at `index`
#[allow(clippy::cast_precision_loss)]
pub fn linear_ratio(ratio: f64, start: usize, end: usize, index: usize) -> f64 {
    let progress = if end > start {
        (index - start) as f64 / (end - start) as f64
    } else {
        0.
    };
    (ratio - 1.).mul_add(progress, 1.)
}

/// Effective ratio of the stepwise model at `index`
#[allow(clippy::cast_precision_loss)]
pub fn stepwise_ratio(ratio: f64, start: usize, end: usize, index: usize) -> f64 {
    if index == start || end <= start {
        return 1.;
    }
    let step = (ratio - 1.) / (end - start) as f64;
    step.mul_add((index - start) as f64, 1.)
}

/// Correct one column of values
///
/// Each reading is corrected by the first segment covering it. A segment covers its opening
/// standard up to, but not including, its closing standard, except the final segment which
/// also covers its closing standard. Readings outside every segment pass through unchanged, as
/// do readings whose effective ratio is zero, negative or not finite.
///
/// # Errors
/// Returns an error only if the polynomial fit fails to solve.
pub fn correct_series(
    values: &[Option<f64>],
    segments: &[DriftSegment],
    method: DriftMethod,
) -> Result<Vec<Option<f64>>> {
    segment_correction(values, segments, method).map(|(corrected, _)| corrected)
}

/// The corrected column along with the number of readings left alone by the ratio guard
fn segment_correction(
    values: &[Option<f64>],
    segments: &[DriftSegment],
    method: DriftMethod,
) -> Result<(Vec<Option<f64>>, usize)> {
    let (effective_ratio, divide): (fn(f64, usize, usize, usize) -> f64, bool) = match method {
        DriftMethod::Linear => (linear_ratio, true),
        DriftMethod::Stepwise => (stepwise_ratio, false),
        DriftMethod::Polynomial => return Ok((polynomial_correction(values)?, 0)),
    };
    if values.is_empty() {
        return Ok((vec![], 0));
    }

    let mut corrected = values.to_vec();
    let mut guarded = 0;
    for (k, segment) in segments.iter().enumerate() {
        let ratio = boundary_ratio(values, segment.start, segment.end);
        let last = if k + 1 == segments.len() || segment.end == segment.start {
            segment.end
        } else {
            segment.end - 1
        };
        for index in segment.start..=last.min(values.len().saturating_sub(1)) {
            let Some(original) = values[index] else {
                continue;
            };
            let effective = effective_ratio(ratio, segment.start, segment.end, index);
            if !(effective.is_finite() && effective > 0.) {
                guarded += 1;
                continue;
            }
            corrected[index] = Some(if divide {
                original / effective
            } else {
                original * effective
            });
        }
    }
    Ok((corrected, guarded))
}

#[allow(clippy::cast_precision_loss)]
fn present_points(values: &[Option<f64>]) -> (Vec<f64>, Vec<f64>) {
    values
        .iter()
        .enumerate()
        .filter_map(|(ii, value)| value.map(|v| (ii as f64, v)))
        .unzip()
}

#[allow(clippy::cast_precision_loss)]
fn polynomial_correction(values: &[Option<f64>]) -> Result<Vec<Option<f64>>> {
    let (x, y) = present_points(values);
    if x.len() < 3 {
        return Ok(values.to_vec());
    }
    let fit = polyfit(&x, &y, 2)?;
    let target = mean(&y).unwrap_or(0.);
    Ok(values
        .iter()
        .enumerate()
        .map(|(ii, value)| {
            value.map(|v| {
                let factor = target / fit.evaluate(ii as f64);
                if factor.is_finite() {
                    v * factor
                } else {
                    v
                }
            })
        })
        .collect())
}

/// One corrected cell
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CellChange {
    pub row: usize,
    pub column: String,
    pub label: String,
    /// Insertion index of the raw row behind the cell
    pub source: Option<usize>,
    pub before: f64,
    pub after: f64,
}

impl CellChange {
    /// The raw element code this column was built from
    pub fn element(&self) -> &str {
        split_repeat_suffix(&self.column).0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DriftCorrection {
    pub method: DriftMethod,
    pub corrected: PivotTable,
    pub changes: Vec<CellChange>,
    pub issues: Vec<Issue>,
}

impl DriftCorrection {
    /// The writes that store every corrected cell in `field`
    pub fn writes(&self, field: Field) -> Vec<FieldWrite> {
        self.changes
            .iter()
            .map(|change| FieldWrite {
                sample_label: change.label.clone(),
                element: change.element().to_owned(),
                row_index: change.source,
                field,
                new_value: Some(change.after),
            })
            .collect()
    }
}

/// Apply drift correction to the selected columns of a table
pub fn correct_table(
    table: &PivotTable,
    segments: &[DriftSegment],
    method: DriftMethod,
    columns: &[String],
) -> DriftCorrection {
    let mut corrected = table.clone();
    let mut changes = vec![];
    let mut issues = vec![];

    for column in columns {
        let values = table.column_values(column);
        if method == DriftMethod::Polynomial && values.iter().flatten().count() < 3 {
            issues.push(Issue::numeric_guard(format!(
                "{column}: fewer than three readings, polynomial correction skipped"
            )));
        }
        let series = match segment_correction(&values, segments, method) {
            Ok((series, 0)) => series,
            Ok((series, guarded)) => {
                issues.push(Issue::numeric_guard(format!(
                    "{column}: {guarded} readings with a non-positive drift ratio left as measured"
                )));
                series
            }
            Err(e) => {
                warn!("drift correction of {column} failed: {e}");
                issues.push(Issue::from(&e));
                continue;
            }
        };
        for (row_index, (before, after)) in values.iter().zip(series).enumerate() {
            let (Some(before), Some(after)) = (*before, after) else {
                continue;
            };
            if before == after {
                continue;
            }
            if !after.is_finite() {
                issues.push(Issue::numeric_guard(format!(
                    "{column} row {row_index}: corrected value is not finite, left as measured"
                )));
                continue;
            }
            let row = &mut corrected.rows[row_index];
            row.values.insert(column.clone(), Some(after));
            changes.push(CellChange {
                row: row_index,
                column: column.clone(),
                label: row.solution_label.clone(),
                source: row.sources.get(column).copied(),
                before,
                after,
            });
        }
    }
    debug!(
        "{method:?} drift correction changed {} cells over {} columns",
        changes.len(),
        columns.len()
    );

    DriftCorrection {
        method,
        corrected,
        changes,
        issues,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ElementDriftInfo {
    pub column: String,
    pub points: usize,
    pub fit: Option<LinearFit>,
    /// Fitted value at the first reading
    pub first: Option<f64>,
    /// Fitted value at the last reading
    pub last: Option<f64>,
    pub drift_percent: Option<f64>,
}

/// Least-squares drift trend of each column over the run
pub fn drift_report(table: &PivotTable, columns: &[String]) -> Vec<ElementDriftInfo> {
    columns
        .iter()
        .map(|column| {
            let (x, y) = present_points(&table.column_values(column));
            let fit = linear_fit(&x, &y);
            let first = fit.zip(x.first()).map(|(fit, &x0)| fit.at(x0));
            let last = fit.zip(x.last()).map(|(fit, &xn)| fit.at(xn));
            let drift_percent = match (first, last) {
                (Some(first), Some(last)) if first != 0. => {
                    Some((last - first) / first.abs() * 100.)
                }
                _ => None,
            };
            ElementDriftInfo {
                column: column.clone(),
                points: x.len(),
                fit,
                first,
                last,
                drift_percent,
            }
        })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum SlopeAction {
    ZeroSlope,
    /// Tilt the trend up by a tenth of its magnitude
    RotateUp,
    /// Tilt the trend down by a tenth of its magnitude
    RotateDown,
    SetCustom(f64),
}

impl SlopeAction {
    pub fn apply(self, slope: f64) -> f64 {
        match self {
            Self::ZeroSlope => 0.,
            Self::RotateUp => slope.abs().mul_add(0.1, slope),
            Self::RotateDown => slope.abs().mul_add(-0.1, slope),
            Self::SetCustom(target) => target,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SlopeAdjustment {
    pub original: LinearFit,
    pub adjusted: LinearFit,
    /// Multiplicative factor per reading, `1` where the reading is missing
    pub factors: Vec<f64>,
    pub corrected: Vec<Option<f64>>,
}

/// Re-slope the trend of a series while keeping its mean
///
/// Returns `None` if the series has no line fit.
#[allow(clippy::cast_precision_loss)]
pub fn adjust_slope(values: &[Option<f64>], action: SlopeAction) -> Option<SlopeAdjustment> {
    let (x, y) = present_points(values);
    let original = linear_fit(&x, &y)?;
    let x_mean = mean(&x)?;
    let y_mean = mean(&y)?;
    let slope = action.apply(original.slope);
    let adjusted = LinearFit {
        slope,
        intercept: slope.mul_add(-x_mean, y_mean),
    };

    let factors: Vec<f64> = values
        .iter()
        .enumerate()
        .map(|(ii, value)| {
            let before = original.at(ii as f64);
            if value.is_none() || before == 0. {
                1.
            } else {
                adjusted.at(ii as f64) / before
            }
        })
        .collect();
    let corrected = values
        .iter()
        .zip(&factors)
        .map(|(value, factor)| value.map(|v| v * factor))
        .collect();

    Some(SlopeAdjustment {
        original,
        adjusted,
        factors,
        corrected,
    })
}
