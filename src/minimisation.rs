//! Differential evolution over a `(blank, scale)` correction genome
//!
//! A sample reading $s$ is corrected to $(s + b) k$ and compared with its certified value $c$ as
//! a percent error
//! $$
//!     e = \frac{(s + b) k - c}{c} \times 100
//! $$
//! Three objectives are minimised as costs over the calibration points: the negated count of
//! points whose error lies inside the acceptance window, the mean Huber loss of $e$, and the mean
//! squared $e$.
//!
//! The search is the classic `DE/rand/1/bin` scheme with a strictly greedy replacement. Trial
//! vectors are drawn sequentially from the injected generator and scored in parallel, so a fixed
//! seed reproduces the same result regardless of thread count.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use argmin::core::CostFunction;
use log::debug;
use ndarray_rand::rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::crm::AcceptanceWindow;
use crate::error::Error;
use crate::Result;

pub const MUTATION_FACTOR: f64 = 0.8;
pub const CROSSOVER_RATE: f64 = 0.9;
/// Threshold between the quadratic and linear parts of the Huber loss
pub const HUBER_DELTA: f64 = 1.0;
/// Readings at or below this value are not scaled when scaling is restricted
pub const SCALE_THRESHOLD: f64 = 50.;

/// Additive blank and multiplicative scale applied to a raw reading
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Genome {
    pub blank: f64,
    pub scale: f64,
}

impl Genome {
    /// The genome that leaves readings unchanged
    pub const IDENTITY: Self = Self {
        blank: 0.,
        scale: 1.,
    };

    const fn genes(self) -> [f64; 2] {
        [self.blank, self.scale]
    }

    const fn from_genes(genes: [f64; 2]) -> Self {
        Self {
            blank: genes[0],
            scale: genes[1],
        }
    }

    /// Correct a reading, scaling only readings above [`SCALE_THRESHOLD`] when `above_50_only`
    pub fn correct(self, value: f64, above_50_only: bool) -> f64 {
        if above_50_only && value <= SCALE_THRESHOLD {
            value + self.blank
        } else {
            (value + self.blank) * self.scale
        }
    }
}

/// Search bounds for each gene
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub blank: (f64, f64),
    pub scale: (f64, f64),
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            blank: (-100., 100.),
            scale: (0.5, 2.0),
        }
    }
}

impl Bounds {
    const fn as_array(&self) -> [(f64, f64); 2] {
        [self.blank, self.scale]
    }

    fn clip(&self, genes: [f64; 2]) -> [f64; 2] {
        let bounds = self.as_array();
        [
            genes[0].clamp(bounds[0].0, bounds[0].1),
            genes[1].clamp(bounds[1].0, bounds[1].1),
        ]
    }

    fn sample(&self, rng: &mut impl Rng) -> Genome {
        Genome {
            blank: rng.gen_range(self.blank.0..=self.blank.1),
            scale: rng.gen_range(self.scale.0..=self.scale.1),
        }
    }

    fn validate(&self) -> Result<()> {
        for (name, (lo, hi)) in [("blank", self.blank), ("scale", self.scale)] {
            if !lo.is_finite() || !hi.is_finite() || lo > hi {
                return Err(Error::Validation(format!(
                    "{name} bounds [{lo}, {hi}] are not a finite interval"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeSettings {
    pub population: usize,
    pub generations: usize,
    pub mutation: f64,
    pub crossover: f64,
    pub bounds: Bounds,
}

impl Default for DeSettings {
    fn default() -> Self {
        Self {
            population: 20,
            generations: 100,
            mutation: MUTATION_FACTOR,
            crossover: CROSSOVER_RATE,
            bounds: Bounds::default(),
        }
    }
}

impl DeSettings {
    /// # Errors
    /// Returns a validation error if the population cannot supply three distinct donors, if no
    /// generations are requested, or if the bounds are not finite intervals.
    pub fn validate(&self) -> Result<()> {
        if self.population < 4 {
            return Err(Error::Validation(format!(
                "population of {} is too small, at least 4 members are needed",
                self.population
            )));
        }
        if self.generations == 0 {
            return Err(Error::Validation("at least one generation is required".into()));
        }
        if !(0.0..=1.0).contains(&self.crossover) || !self.mutation.is_finite() {
            return Err(Error::Validation(format!(
                "invalid control parameters F={} CR={}",
                self.mutation, self.crossover
            )));
        }
        self.bounds.validate()
    }
}

/// Cooperative cancellation, checked once per generation
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A reading paired with the certified value it should reproduce
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct CalibrationPoint {
    pub sample: f64,
    pub crm: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectiveModel {
    /// Number of points inside the acceptance window
    PassCount,
    Huber,
    /// Mean squared percent error
    Sse,
}

impl ObjectiveModel {
    pub const ALL: [Self; 3] = [Self::PassCount, Self::Huber, Self::Sse];
}

/// The agreement between corrected readings and certified values, for one element
#[derive(Clone, Debug)]
pub struct Objective<'a> {
    points: &'a [CalibrationPoint],
    window: AcceptanceWindow,
    above_50_only: bool,
    model: ObjectiveModel,
}

impl<'a> Objective<'a> {
    /// Points with a zero certified value have no defined error and are ignored
    pub const fn new(
        points: &'a [CalibrationPoint],
        window: AcceptanceWindow,
        above_50_only: bool,
    ) -> Self {
        Self {
            points,
            window,
            above_50_only,
            model: ObjectiveModel::PassCount,
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: ObjectiveModel) -> Self {
        self.model = model;
        self
    }

    pub const fn model(&self) -> ObjectiveModel {
        self.model
    }

    /// Percent error of every usable point after applying `genome`
    pub fn percent_errors(&self, genome: Genome) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.points
            .iter()
            .filter(|point| point.crm != 0.)
            .map(move |point| {
                let corrected = genome.correct(point.sample, self.above_50_only);
                ((corrected - point.crm) / point.crm * 100., point.crm)
            })
    }

    pub fn pass_count(&self, genome: Genome) -> usize {
        self.percent_errors(genome)
            .filter(|(error, crm)| self.window.contains(*error, *crm))
            .count()
    }

    pub fn huber(&self, genome: Genome) -> f64 {
        mean_of(self.percent_errors(genome).map(|(error, _)| {
            let magnitude = error.abs();
            if magnitude <= HUBER_DELTA {
                0.5 * error * error
            } else {
                HUBER_DELTA * 0.5f64.mul_add(-HUBER_DELTA, magnitude)
            }
        }))
    }

    pub fn sse(&self, genome: Genome) -> f64 {
        mean_of(self.percent_errors(genome).map(|(error, _)| error * error))
    }

    /// Mean absolute percent error
    pub fn mean_abs_error(&self, genome: Genome) -> f64 {
        mean_of(self.percent_errors(genome).map(|(error, _)| error.abs()))
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean_of(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0., 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        0.
    } else {
        sum / count as f64
    }
}

impl CostFunction for Objective<'_> {
    type Param = Genome;
    type Output = f64;

    #[allow(clippy::cast_precision_loss)]
    fn cost(
        &self,
        genome: &Self::Param,
    ) -> ::std::result::Result<Self::Output, argmin::core::Error> {
        Ok(match self.model {
            ObjectiveModel::PassCount => -(self.pass_count(*genome) as f64),
            ObjectiveModel::Huber => self.huber(*genome),
            ObjectiveModel::Sse => self.sse(*genome),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct DeOutcome {
    pub best: Genome,
    pub cost: f64,
    pub generations: usize,
    pub evaluations: usize,
}

pub struct DifferentialEvolution {
    settings: DeSettings,
}

impl DifferentialEvolution {
    /// # Errors
    /// Returns a validation error if the settings are unusable.
    pub fn new(settings: DeSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub const fn settings(&self) -> &DeSettings {
        &self.settings
    }

    /// Minimise `problem`, drawing every random decision from `rng`
    ///
    /// # Errors
    /// Returns [`Error::Cancelled`] if `cancel` is raised before a generation starts, or
    /// [`Error::Optimisation`] if the cost function fails.
    pub fn run<C, R>(
        &self,
        problem: &C,
        rng: &mut R,
        cancel: &CancellationToken,
    ) -> Result<DeOutcome>
    where
        C: CostFunction<Param = Genome, Output = f64> + Sync,
        R: Rng,
    {
        let DeSettings {
            population: size,
            generations,
            mutation,
            crossover,
            bounds,
        } = self.settings;

        let mut population = (0..size).map(|_| bounds.sample(rng)).collect::<Vec<_>>();
        let mut costs = evaluate(problem, &population)?;
        let mut evaluations = size;

        for generation in 0..generations {
            if cancel.is_cancelled() {
                debug!("differential evolution cancelled at generation {generation}");
                return Err(Error::Cancelled { generation });
            }

            let trials = population
                .iter()
                .enumerate()
                .map(|(ii, member)| {
                    let [a, b, c] = pick_donors(rng, size, ii).map(|jj| population[jj].genes());
                    let mutant = bounds.clip([
                        mutation.mul_add(b[0] - c[0], a[0]),
                        mutation.mul_add(b[1] - c[1], a[1]),
                    ]);
                    let current = member.genes();
                    let mut trial = current;
                    for (gene, value) in trial.iter_mut().zip(mutant) {
                        if rng.gen::<f64>() < crossover {
                            *gene = value;
                        }
                    }
                    Genome::from_genes(trial)
                })
                .collect::<Vec<_>>();

            let trial_costs = evaluate(problem, &trials)?;
            evaluations += size;

            for (ii, (trial, cost)) in trials.into_iter().zip(trial_costs).enumerate() {
                if cost < costs[ii] {
                    population[ii] = trial;
                    costs[ii] = cost;
                }
            }
        }

        let (best, cost) = best_of(&population, &costs);
        debug!(
            "differential evolution finished: blank {:.4} scale {:.4} cost {cost:.4}",
            best.blank, best.scale
        );
        Ok(DeOutcome {
            best,
            cost,
            generations,
            evaluations,
        })
    }
}

/// Three distinct member indices, none equal to `exclude`
fn pick_donors(rng: &mut impl Rng, size: usize, exclude: usize) -> [usize; 3] {
    let mut picked = [exclude; 3];
    let mut count = 0;
    while count < 3 {
        let candidate = rng.gen_range(0..size);
        if candidate != exclude && !picked[..count].contains(&candidate) {
            picked[count] = candidate;
            count += 1;
        }
    }
    picked
}

/// Score genomes in parallel, mapping undefined costs to infinity so they never win selection
fn evaluate<C>(problem: &C, genomes: &[Genome]) -> Result<Vec<f64>>
where
    C: CostFunction<Param = Genome, Output = f64> + Sync,
{
    genomes
        .par_iter()
        .map(|genome| {
            problem
                .cost(genome)
                .map(|cost| if cost.is_nan() { f64::INFINITY } else { cost })
                .map_err(|e| Error::Optimisation(e.to_string()))
        })
        .collect()
}

/// The lowest-cost member, the earliest on ties
fn best_of(population: &[Genome], costs: &[f64]) -> (Genome, f64) {
    population
        .iter()
        .zip(costs)
        .fold((Genome::IDENTITY, f64::INFINITY), |best, (genome, cost)| {
            if *cost < best.1 {
                (*genome, *cost)
            } else {
                best
            }
        })
}
