//! Per-element blank and scale calibration against certified reference materials

use std::collections::BTreeMap;

use log::{debug, info};
use ndarray_rand::rand::{Rng, SeedableRng};
use rand_isaac::isaac64::Isaac64Rng;
use rayon::prelude::*;
use serde::Serialize;

use crate::crm::{AcceptanceWindow, CrmDiffReport};
use crate::error::Issue;
use crate::math::round_to;
use crate::measurement::Field;
use crate::minimisation::{
    CalibrationPoint, CancellationToken, DeSettings, DifferentialEvolution, Genome, Objective,
    ObjectiveModel,
};
use crate::pivot::{normalise_label, PivotTable};
use crate::store::FieldWrite;
use crate::Result;

/// A CRM reading with a usable certified value
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MatchedSample {
    pub label: String,
    pub column: String,
    pub element: String,
    /// Insertion index of the raw row behind the reading
    pub source: Option<usize>,
    pub point: CalibrationPoint,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OptimizerSettings {
    pub de: DeSettings,
    pub window: AcceptanceWindow,
    pub use_multi_model: bool,
    pub scale_above_50_only: bool,
    pub seed: u64,
    /// Restrict the calibration to these elements, all when empty
    pub elements: Vec<String>,
    /// Labels never used as calibration points
    pub excluded_labels: Vec<String>,
    pub decimals: u32,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            de: DeSettings::default(),
            window: AcceptanceWindow::default(),
            use_multi_model: false,
            scale_above_50_only: false,
            seed: 42,
            elements: vec![],
            excluded_labels: vec![],
            decimals: 2,
        }
    }
}

/// The result of one objective for one element, scored on every objective
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ModelCandidate {
    pub model: ObjectiveModel,
    pub genome: Genome,
    pub pass_count: usize,
    pub huber: f64,
    pub sse: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ElementOptimization {
    pub element: String,
    pub samples: usize,
    pub genome: Genome,
    pub model: ObjectiveModel,
    pub pass_before: usize,
    pub pass_after: usize,
    pub mean_diff_before: f64,
    pub mean_diff_after: f64,
    pub candidates: Vec<ModelCandidate>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CorrectedSample {
    pub label: String,
    pub column: String,
    pub element: String,
    pub source: Option<usize>,
    pub original: f64,
    pub optimized: f64,
    pub crm: f64,
    pub diff_before: f64,
    pub diff_after: f64,
    pub pass_before: bool,
    pub pass_after: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OptimizationResult {
    pub elements: Vec<ElementOptimization>,
    pub samples: Vec<CorrectedSample>,
    pub issues: Vec<Issue>,
}

impl OptimizationResult {
    pub fn element(&self, element: &str) -> Option<&ElementOptimization> {
        self.elements
            .iter()
            .find(|e| e.element.eq_ignore_ascii_case(element))
    }
}

/// Collect calibration points from a CRM difference report, grouped by element
///
/// Cells without a sample reading or with a missing or zero certified value are dropped.
pub fn matched_samples(
    table: &PivotTable,
    report: &CrmDiffReport,
    settings: &OptimizerSettings,
) -> BTreeMap<String, Vec<MatchedSample>> {
    let mut grouped: BTreeMap<String, Vec<MatchedSample>> = BTreeMap::new();
    for row in &report.rows {
        let label = normalise_label(&row.solution_label);
        if settings
            .excluded_labels
            .iter()
            .any(|excluded| excluded.trim().eq_ignore_ascii_case(&label))
        {
            debug!("{label} excluded from calibration");
            continue;
        }
        for cell in &row.cells {
            let wanted = settings.elements.is_empty()
                || settings
                    .elements
                    .iter()
                    .any(|e| e.eq_ignore_ascii_case(&cell.element));
            let (Some(sample), Some(crm)) = (cell.sample_value, cell.crm_value) else {
                continue;
            };
            if !wanted || crm == 0. {
                continue;
            }
            let source = table
                .rows
                .get(row.row_index)
                .and_then(|pivoted| pivoted.sources.get(&cell.column))
                .copied();
            grouped.entry(cell.element.clone()).or_default().push(MatchedSample {
                label: label.clone(),
                column: cell.column.clone(),
                element: cell.element.clone(),
                source,
                point: CalibrationPoint { sample, crm },
            });
        }
    }
    grouped
}

pub struct BlankScaleOptimizer {
    settings: OptimizerSettings,
    solver: DifferentialEvolution,
}

impl BlankScaleOptimizer {
    /// # Errors
    /// Returns a validation error if the evolution settings are unusable.
    pub fn new(settings: OptimizerSettings) -> Result<Self> {
        let solver = DifferentialEvolution::new(settings.de)?;
        Ok(Self { settings, solver })
    }

    pub const fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    /// Calibrate every element with CRM readings, elements in parallel
    ///
    /// Each element draws from its own generator seeded with `seed + ordinal`, where the ordinal
    /// is the element's position in sorted order, so results do not depend on scheduling.
    ///
    /// # Errors
    /// Returns [`crate::error::Error::Cancelled`] if `cancel` is raised during any element.
    pub fn optimize(
        &self,
        table: &PivotTable,
        report: &CrmDiffReport,
        cancel: &CancellationToken,
    ) -> Result<OptimizationResult> {
        let grouped = matched_samples(table, report, &self.settings);
        let mut issues = vec![];
        if grouped.is_empty() {
            issues.push(Issue::not_found("no CRM readings to calibrate against"));
            return Ok(OptimizationResult {
                issues,
                ..OptimizationResult::default()
            });
        }

        let grouped = grouped.into_iter().collect::<Vec<_>>();
        let per_element = grouped
            .par_iter()
            .enumerate()
            .map(|(ordinal, (element, samples))| {
                let element_seed = self.settings.seed.wrapping_add(ordinal as u64);
                let optimised = self.optimise_element(element, samples, element_seed, cancel)?;
                let corrected = self.corrected_samples(samples, optimised.genome);
                Ok((optimised, corrected))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut result = OptimizationResult {
            issues,
            ..OptimizationResult::default()
        };
        for (element, samples) in per_element {
            info!(
                "{}: {} -> {} of {} CRM readings in range ({:?}, blank {:.3}, scale {:.3})",
                element.element,
                element.pass_before,
                element.pass_after,
                element.samples,
                element.model,
                element.genome.blank,
                element.genome.scale
            );
            result.elements.push(element);
            result.samples.extend(samples);
        }
        Ok(result)
    }

    fn optimise_element(
        &self,
        element: &str,
        samples: &[MatchedSample],
        seed: u64,
        cancel: &CancellationToken,
    ) -> Result<ElementOptimization> {
        let points = samples.iter().map(|s| s.point).collect::<Vec<_>>();
        let objective = Objective::new(
            &points,
            self.settings.window,
            self.settings.scale_above_50_only,
        );
        let models: &[ObjectiveModel] = if self.settings.use_multi_model {
            &ObjectiveModel::ALL
        } else {
            &[ObjectiveModel::PassCount]
        };

        let mut element_rng = Isaac64Rng::seed_from_u64(seed);
        let mut candidates = Vec::with_capacity(models.len());
        for &model in models {
            let mut rng = Isaac64Rng::seed_from_u64(element_rng.gen());
            let problem = objective.clone().with_model(model);
            let outcome = self.solver.run(&problem, &mut rng, cancel)?;
            candidates.push(ModelCandidate {
                model,
                genome: outcome.best,
                pass_count: objective.pass_count(outcome.best),
                huber: objective.huber(outcome.best),
                sse: objective.sse(outcome.best),
            });
        }

        let chosen = select_candidate(&candidates).unwrap_or(ModelCandidate {
            model: ObjectiveModel::PassCount,
            genome: Genome::IDENTITY,
            pass_count: objective.pass_count(Genome::IDENTITY),
            huber: objective.huber(Genome::IDENTITY),
            sse: objective.sse(Genome::IDENTITY),
        });
        debug!("{element}: candidates {candidates:?}");

        let decimals = self.settings.decimals;
        Ok(ElementOptimization {
            element: element.to_owned(),
            samples: samples.len(),
            genome: chosen.genome,
            model: chosen.model,
            pass_before: objective.pass_count(Genome::IDENTITY),
            pass_after: chosen.pass_count,
            mean_diff_before: round_to(objective.mean_abs_error(Genome::IDENTITY), decimals),
            mean_diff_after: round_to(objective.mean_abs_error(chosen.genome), decimals),
            candidates,
        })
    }

    fn corrected_samples(&self, samples: &[MatchedSample], genome: Genome) -> Vec<CorrectedSample> {
        let OptimizerSettings {
            window,
            scale_above_50_only,
            decimals,
            ..
        } = self.settings;
        samples
            .iter()
            .map(|sample| {
                let CalibrationPoint { sample: original, crm } = sample.point;
                let optimized = genome.correct(original, scale_above_50_only);
                let diff_before = (original - crm) / crm * 100.;
                let diff_after = (optimized - crm) / crm * 100.;
                CorrectedSample {
                    label: sample.label.clone(),
                    column: sample.column.clone(),
                    element: sample.element.clone(),
                    source: sample.source,
                    original,
                    optimized,
                    crm,
                    diff_before: round_to(diff_before, decimals),
                    diff_after: round_to(diff_after, decimals),
                    pass_before: window.contains(diff_before, crm),
                    pass_after: window.contains(diff_after, crm),
                }
            })
            .collect()
    }
}

/// Most readings in range first, then the smoother fit
pub fn select_candidate(candidates: &[ModelCandidate]) -> Option<ModelCandidate> {
    candidates.iter().copied().min_by(|a, b| {
        b.pass_count
            .cmp(&a.pass_count)
            .then(a.sse.total_cmp(&b.sse))
            .then(a.huber.total_cmp(&b.huber))
    })
}

/// The writes that store each calibrated reading in `field`
///
/// Readings whose raw row is unknown are addressed by label and element.
pub fn blank_scale_writes(result: &OptimizationResult, field: Field) -> Vec<FieldWrite> {
    result
        .samples
        .iter()
        .filter(|sample| sample.optimized != sample.original)
        .map(|sample| FieldWrite {
            sample_label: sample.label.clone(),
            element: sample.element.clone(),
            row_index: sample.source,
            field,
            new_value: Some(sample.optimized),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ndarray_rand::rand::{Rng, SeedableRng};
    use rand_isaac::isaac64::Isaac64Rng;

    use super::{
        blank_scale_writes, matched_samples, select_candidate, BlankScaleOptimizer,
        ModelCandidate, OptimizerSettings,
    };
    use crate::crm::{
        compute_differences, CrmCatalog, CrmDiffReport, CrmIdPattern, CrmReference, DiffOptions,
    };
    use crate::error::Error;
    use crate::measurement::{Field, RawMeasurementRow};
    use crate::minimisation::{CancellationToken, Genome, ObjectiveModel};
    use crate::pivot::{pivot, PivotOptions, PivotTable};

    /// Eight CRM readings of Fe and Cu reading 20% low after a blank of 2
    fn fixture() -> (PivotTable, CrmDiffReport) {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let certified = [("Fe", 120.), ("Cu", 30.)];

        let mut rows = vec![];
        for ii in 0..8 {
            for (element, crm) in certified {
                let noise: f64 = rng.gen_range(-0.2..0.2);
                let reading = crm / 1.25 - 2. + noise;
                rows.push(
                    RawMeasurementRow::new(rows.len(), format!("OREAS 258 {ii}"), element)
                        .with(Field::CorrCon, reading),
                );
            }
        }
        let table = pivot(&rows, &PivotOptions::default());
        let catalog = CrmCatalog::new(vec![CrmReference {
            crm_id: "OREAS 258".into(),
            method: "4-Acid Digestion".into(),
            values: certified.iter().map(|(e, v)| ((*e).to_owned(), *v)).collect(),
            preferred_source: false,
        }]);
        let report = compute_differences(
            &table,
            &catalog,
            &CrmIdPattern::default(),
            &BTreeMap::new(),
            &DiffOptions::default(),
        );
        (table, report)
    }

    #[test]
    fn readings_are_grouped_by_element_with_their_raw_rows() {
        let (table, report) = fixture();
        let grouped = matched_samples(&table, &report, &OptimizerSettings::default());

        assert_eq!(grouped.keys().collect::<Vec<_>>(), vec!["Cu", "Fe"]);
        assert_eq!(grouped["Fe"].len(), 8);
        assert!(grouped["Fe"].iter().all(|s| s.source.is_some()));

        let settings = OptimizerSettings {
            elements: vec!["fe".into()],
            excluded_labels: vec!["OREAS 258 0".into()],
            ..OptimizerSettings::default()
        };
        let grouped = matched_samples(&table, &report, &settings);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped["Fe"].len(), 7);
    }

    #[test]
    fn calibration_brings_low_readings_into_range() {
        let (table, report) = fixture();
        let optimizer = BlankScaleOptimizer::new(OptimizerSettings::default()).unwrap();
        let result = optimizer
            .optimize(&table, &report, &CancellationToken::new())
            .unwrap();

        for element in &result.elements {
            assert_eq!(element.pass_before, 0);
            assert_eq!(element.pass_after, element.samples);
            assert!(element.mean_diff_after < element.mean_diff_before);
        }
        assert_eq!(result.samples.len(), 16);
        assert!(result.samples.iter().all(|s| s.pass_after && !s.pass_before));
    }

    #[test]
    fn multi_model_runs_are_reproducible() {
        let (table, report) = fixture();
        let settings = OptimizerSettings {
            use_multi_model: true,
            ..OptimizerSettings::default()
        };
        let run = || {
            BlankScaleOptimizer::new(settings.clone())
                .unwrap()
                .optimize(&table, &report, &CancellationToken::new())
                .unwrap()
        };
        let first = run();
        assert_eq!(first, run());
        for element in &first.elements {
            assert_eq!(element.candidates.len(), 3);
            let best = element.candidates.iter().map(|c| c.pass_count).max().unwrap();
            assert_eq!(element.pass_after, best);
        }
    }

    #[test]
    fn discrete_agreement_wins_before_smoothness() {
        let candidate = |model, pass_count, sse, huber| ModelCandidate {
            model,
            genome: Genome::IDENTITY,
            pass_count,
            huber,
            sse,
        };
        let candidates = [
            candidate(ObjectiveModel::PassCount, 5, 9., 3.),
            candidate(ObjectiveModel::Huber, 5, 4., 2.),
            candidate(ObjectiveModel::Sse, 4, 1., 1.),
        ];
        assert_eq!(select_candidate(&candidates).unwrap().model, ObjectiveModel::Huber);
        assert!(select_candidate(&[]).is_none());
    }

    #[test]
    fn cancellation_aborts_the_calibration() {
        let (table, report) = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = BlankScaleOptimizer::new(OptimizerSettings::default())
            .unwrap()
            .optimize(&table, &report, &cancel);
        assert!(matches!(result, Err(Error::Cancelled { .. })));
    }

    #[test]
    fn writes_target_the_raw_rows() {
        let (table, report) = fixture();
        let result = BlankScaleOptimizer::new(OptimizerSettings::default())
            .unwrap()
            .optimize(&table, &report, &CancellationToken::new())
            .unwrap();
        let writes = blank_scale_writes(&result, Field::CorrCon);

        assert_eq!(writes.len(), 16);
        assert!(writes.iter().all(|w| w.row_index.is_some() && w.field == Field::CorrCon));
    }
}
