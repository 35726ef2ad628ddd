//! Request-level entry points
//!
//! Each request fetches the project's rows once and runs the analytical components over that
//! snapshot. Data-quality problems are reported in the returned [`Outcome`]; only storage
//! failures surface as `Err`.

use log::{info, warn};
use serde::Serialize;

use crate::adjust::{field_change_writes, flag_out_of_range, FlaggedValue, ValueRange};
use crate::apply::{ApplyReport, CorrectionApplier};
use crate::calibration::{blank_scale_writes, BlankScaleOptimizer, OptimizationResult};
use crate::config::{Config, PatternSet};
use crate::crm::{compute_differences, CrmCatalog, CrmDiffReport};
use crate::drift::{correct_table, drift_report, DriftCorrection, ElementDriftInfo};
use crate::error::{Error, Issue, IssueKind};
use crate::measurement::{Field, RawMeasurementRow};
use crate::minimisation::CancellationToken;
use crate::pivot::{pivot, PivotOptions, PivotTable};
use crate::segments::{detect_segments, SegmentDetection};
use crate::store::{FieldWrite, MeasurementStore};
use crate::Result;

/// The result of a request along with every recoverable issue met on the way
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Outcome<T> {
    pub success: bool,
    pub issues: Vec<Issue>,
    pub value: Option<T>,
}

impl<T> Outcome<T> {
    pub const fn succeeded(value: T, issues: Vec<Issue>) -> Self {
        Self {
            success: true,
            issues,
            value: Some(value),
        }
    }

    pub const fn failed(issues: Vec<Issue>) -> Self {
        Self {
            success: false,
            issues,
            value: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DriftAnalysis {
    pub detection: SegmentDetection,
    pub elements: Vec<ElementDriftInfo>,
    pub correction: DriftCorrection,
}

pub struct Analyzer<'a, S> {
    store: &'a S,
    config: Config,
    patterns: PatternSet,
}

impl<'a, S: MeasurementStore> Analyzer<'a, S> {
    /// # Errors
    /// Returns an error if the configuration is invalid or a pattern does not compile.
    pub fn new(store: &'a S, config: Config) -> Result<Self> {
        config.validate()?;
        let patterns = config.patterns()?;
        Ok(Self {
            store,
            config,
            patterns,
        })
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// # Errors
    /// Returns an error only if storage fails.
    pub fn pivot(&self, project: &str) -> Result<Outcome<PivotTable>> {
        self.run(project, |rows, issues| {
            Ok(self.table(&rows, self.config.pivot_options(), issues))
        })
    }

    /// Segment the run, report each element's drift and correct it with the configured model
    ///
    /// # Errors
    /// Returns an error only if storage fails.
    pub fn drift(&self, project: &str) -> Result<Outcome<DriftAnalysis>> {
        self.run(project, |rows, issues| {
            let table = self.table(&rows, self.config.pivot_options(), issues);
            Ok(self.drift_analysis(table, issues))
        })
    }

    /// # Errors
    /// Returns an error only if storage fails.
    pub fn crm_differences(&self, project: &str) -> Result<Outcome<CrmDiffReport>> {
        self.run(project, |rows, issues| {
            let table = self.table(&rows, self.config.pivot_options(), issues);
            self.differences(project, &table, issues)
        })
    }

    /// Calibrate blank and scale per element against the project's CRM readings
    ///
    /// Readings are taken in element units so that the result can be written back. Issues met
    /// by the optimiser are moved onto the outcome.
    ///
    /// # Errors
    /// Returns an error only if storage fails. Cancellation gives a failed outcome.
    pub fn optimize(
        &self,
        project: &str,
        cancel: &CancellationToken,
    ) -> Result<Outcome<OptimizationResult>> {
        self.run(project, |rows, issues| {
            let table = self.table(&rows, self.element_units(), issues);
            let report = self.differences(project, &table, issues)?;
            let optimizer = BlankScaleOptimizer::new(self.config.optimizer_settings())?;
            let mut result = optimizer.optimize(&table, &report, cancel)?;
            issues.append(&mut result.issues);
            Ok(result)
        })
    }

    /// # Errors
    /// Returns an error only if storage fails.
    pub fn bad_values(
        &self,
        project: &str,
        field: Field,
        range: ValueRange,
    ) -> Result<Outcome<Vec<FlaggedValue>>> {
        self.run(project, |rows, _| Ok(flag_out_of_range(&rows, field, range)))
    }

    /// Write the configured drift correction back to the raw rows
    ///
    /// # Errors
    /// Returns [`Error::Storage`] if the write-back fails.
    pub fn apply_drift(&self, project: &str) -> Result<Outcome<ApplyReport>> {
        self.run(project, |rows, issues| {
            let table = self.table(&rows, self.element_units(), issues);
            let analysis = self.drift_analysis(table, issues);
            let writes = analysis.correction.writes(self.config.value_field);
            let description = format!("{:?} drift correction", self.config.method);
            self.write(project, &description, &writes, issues)
        })
    }

    /// # Errors
    /// Returns [`Error::Storage`] if the write-back fails.
    pub fn apply_blank_scale(
        &self,
        project: &str,
        result: &OptimizationResult,
    ) -> Result<Outcome<ApplyReport>> {
        self.run(project, |_, issues| {
            let writes = blank_scale_writes(result, self.config.value_field);
            self.write(project, "blank and scale calibration", &writes, issues)
        })
    }

    /// Change a preparation value of one sample and rescale its concentrations
    ///
    /// # Errors
    /// Returns [`Error::Storage`] if the write-back fails.
    pub fn apply_field_change(
        &self,
        project: &str,
        label: &str,
        field: Field,
        value: f64,
    ) -> Result<Outcome<ApplyReport>> {
        self.run(project, |rows, issues| {
            let writes = field_change_writes(&rows, label, field, value)?;
            self.write(project, &format!("{field} of {label} set to {value}"), &writes, issues)
        })
    }

    /// Restore the state before the most recent write-back
    ///
    /// # Errors
    /// Returns [`Error::Storage`] if the restore fails.
    pub fn undo(&self, project: &str) -> Result<Outcome<ApplyReport>> {
        let attempt = validate_project(project).and_then(|()| {
            CorrectionApplier::new(self.store)
                .undo(project)?
                .ok_or_else(|| Error::DataNotFound(format!("nothing to undo in `{project}`")))
        });
        settle(attempt.map(|report| (report, vec![])))
    }

    /// Fetch the rows of `project` and hand them to `request`, collecting its issues
    fn run<T>(
        &self,
        project: &str,
        request: impl FnOnce(Vec<RawMeasurementRow>, &mut Vec<Issue>) -> Result<T>,
    ) -> Result<Outcome<T>> {
        let attempt = validate_project(project)
            .and_then(|()| self.store.rows(project))
            .and_then(|rows| {
                if rows.is_empty() {
                    return Err(Error::DataNotFound(format!("project `{project}` has no rows")));
                }
                info!("{project}: {} raw rows", rows.len());
                let mut issues = vec![];
                request(rows, &mut issues).map(|value| (value, issues))
            });
        settle(attempt)
    }

    fn table(
        &self,
        rows: &[RawMeasurementRow],
        options: PivotOptions,
        issues: &mut Vec<Issue>,
    ) -> PivotTable {
        let table = pivot(rows, &options);
        if table.skipped > 0 {
            issues.push(Issue::parse(format!(
                "{} rows without an element were skipped",
                table.skipped
            )));
        }
        table
    }

    const fn element_units(&self) -> PivotOptions {
        PivotOptions {
            value_field: self.config.value_field,
            oxide: false,
        }
    }

    fn drift_analysis(&self, table: PivotTable, issues: &mut Vec<Issue>) -> DriftAnalysis {
        let detection = detect_segments(table.labels(), &self.patterns.segments);
        if detection.standards.len() < 2 {
            issues.push(Issue::new(
                IssueKind::DataNotFound,
                format!(
                    "{} reference standards found, the whole run is one segment",
                    detection.standards.len()
                ),
            ));
        }
        let columns = table.select_columns(&self.config.elements);
        let elements = drift_report(&table, &columns);
        let mut correction =
            correct_table(&table, &detection.segments, self.config.method, &columns);
        issues.append(&mut correction.issues);
        DriftAnalysis {
            detection,
            elements,
            correction,
        }
    }

    fn differences(
        &self,
        project: &str,
        table: &PivotTable,
        issues: &mut Vec<Issue>,
    ) -> Result<CrmDiffReport> {
        let catalog = CrmCatalog::new(self.store.crm_references()?);
        let mut overrides = self.config.crm_overrides.clone();
        overrides.extend(self.store.crm_overrides(project)?);

        let report = compute_differences(
            table,
            &catalog,
            &self.patterns.crm_ids,
            &overrides,
            &self.config.diff_options(),
        );
        if report.rows.is_empty() {
            return Err(Error::DataNotFound(
                "no CRM samples matched a certified reference".into(),
            ));
        }
        issues.extend(report.issues.iter().cloned());
        Ok(report)
    }

    fn write(
        &self,
        project: &str,
        description: &str,
        writes: &[FieldWrite],
        issues: &mut Vec<Issue>,
    ) -> Result<ApplyReport> {
        if writes.is_empty() {
            return Err(Error::DataNotFound(format!("{description}: nothing to write")));
        }
        let report = CorrectionApplier::new(self.store).apply(project, description, writes)?;
        issues.extend(report.unresolved.iter().cloned());
        Ok(report)
    }
}

fn validate_project(project: &str) -> Result<()> {
    if project.trim().is_empty() {
        return Err(Error::Validation("project id is empty".into()));
    }
    Ok(())
}

/// Fatal errors propagate, everything else becomes a failed outcome
fn settle<T>(attempt: Result<(T, Vec<Issue>)>) -> Result<Outcome<T>> {
    match attempt {
        Ok((value, issues)) => Ok(Outcome::succeeded(value, issues)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!("request failed: {e}");
            Ok(Outcome::failed(vec![Issue::from(&e)]))
        }
    }
}
