//! Run configuration, read from TOML
//!
//! Every key is optional. A minimal file might read
//!
//! ```toml
//! base_pattern = "^RM"
//! method = "Stepwise"
//! min_diff_percent = -5.0
//! max_diff_percent = 5.0
//! use_multi_model = true
//! elements = ["Fe", "Cu"]
//!
//! [crm_overrides]
//! "OREAS 258 a" = "OREAS 258 (Fire Assay)"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::calibration::OptimizerSettings;
use crate::crm::{AcceptanceWindow, CrmIdPattern, DiffOptions, ToleranceTiers, DEFAULT_CRM_IDS};
use crate::drift::DriftMethod;
use crate::error::Error;
use crate::measurement::Field;
use crate::minimisation::{Bounds, DeSettings};
use crate::pivot::PivotOptions;
use crate::segments::SegmentPatterns;
use crate::standards::StandardMatcher;
use crate::Result;

/// How CRM percent differences are judged
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeMode {
    /// Between `min_diff_percent` and `max_diff_percent`
    #[default]
    Fixed,
    /// Within a tolerance chosen by the magnitude of the certified value
    Tiered,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_pattern: String,
    pub cone_pattern: Option<String>,
    pub standard_keyword: String,
    pub method: DriftMethod,
    pub min_diff_percent: f64,
    pub max_diff_percent: f64,
    pub decimal_places: u32,
    pub max_iterations: usize,
    pub population_size: usize,
    pub use_multi_model: bool,
    pub elements: Vec<String>,
    pub scale_range_min: f64,
    pub scale_range_max: f64,
    pub scale_above_50_only: bool,
    pub range_mode: RangeMode,
    pub range_low: f64,
    pub range_mid: f64,
    pub range_high1: f64,
    pub range_high2: f64,
    pub range_high3: f64,
    pub range_high4: f64,
    pub crm_ids: Vec<String>,
    /// Solution label to CRM reference key, as `"OREAS 258 (4-Acid Digestion)"`
    pub crm_overrides: BTreeMap<String, String>,
    pub excluded_labels: Vec<String>,
    pub seed: u64,
    pub oxide: bool,
    pub value_field: Field,
}

impl Default for Config {
    fn default() -> Self {
        let tiers = ToleranceTiers::default();
        Self {
            base_pattern: "(?i)^RM".into(),
            cone_pattern: None,
            standard_keyword: StandardMatcher::DEFAULT_KEYWORD.into(),
            method: DriftMethod::Linear,
            min_diff_percent: -10.,
            max_diff_percent: 10.,
            decimal_places: 2,
            max_iterations: 100,
            population_size: 20,
            use_multi_model: false,
            elements: vec![],
            scale_range_min: 0.5,
            scale_range_max: 2.0,
            scale_above_50_only: false,
            range_mode: RangeMode::Fixed,
            range_low: tiers.low,
            range_mid: tiers.mid,
            range_high1: tiers.high1,
            range_high2: tiers.high2,
            range_high3: tiers.high3,
            range_high4: tiers.high4,
            crm_ids: DEFAULT_CRM_IDS.iter().map(|&id| id.to_owned()).collect(),
            crm_overrides: BTreeMap::new(),
            excluded_labels: vec![],
            seed: 42,
            oxide: false,
            value_field: Field::CorrCon,
        }
    }
}

/// Every pattern a run needs, compiled once
#[derive(Clone, Debug)]
pub struct PatternSet {
    pub segments: SegmentPatterns,
    pub crm_ids: CrmIdPattern,
}

impl Config {
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid TOML, or fails validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// # Errors
    /// Returns an error if the text is not valid TOML or fails validation.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns a validation error describing the first unusable setting.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(Error::Validation(message));
        if !self.min_diff_percent.is_finite()
            || !self.max_diff_percent.is_finite()
            || self.min_diff_percent > self.max_diff_percent
        {
            return invalid(format!(
                "acceptance window [{}, {}] is not a finite interval",
                self.min_diff_percent, self.max_diff_percent
            ));
        }
        let tiers = self.tiers();
        if [tiers.low, tiers.mid, tiers.high1, tiers.high2, tiers.high3, tiers.high4]
            .iter()
            .any(|t| !t.is_finite() || *t < 0.)
        {
            return invalid("range tolerances must be finite and non-negative".into());
        }
        if self.crm_ids.iter().all(|id| id.trim().is_empty()) {
            return invalid("at least one CRM id is required".into());
        }
        if self.decimal_places > 15 {
            return invalid(format!("{} decimal places is too many", self.decimal_places));
        }
        self.de_settings().validate()
    }

    /// # Errors
    /// Returns an error if a pattern does not compile.
    pub fn patterns(&self) -> Result<PatternSet> {
        Ok(PatternSet {
            segments: SegmentPatterns::new(
                &self.base_pattern,
                self.cone_pattern.as_deref(),
                &self.standard_keyword,
            )?,
            crm_ids: CrmIdPattern::new(&self.crm_ids)?,
        })
    }

    pub const fn tiers(&self) -> ToleranceTiers {
        ToleranceTiers {
            low: self.range_low,
            mid: self.range_mid,
            high1: self.range_high1,
            high2: self.range_high2,
            high3: self.range_high3,
            high4: self.range_high4,
        }
    }

    pub const fn window(&self) -> AcceptanceWindow {
        match self.range_mode {
            RangeMode::Fixed => AcceptanceWindow::Fixed {
                min: self.min_diff_percent,
                max: self.max_diff_percent,
            },
            RangeMode::Tiered => AcceptanceWindow::Tiered(self.tiers()),
        }
    }

    pub const fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            window: self.window(),
            decimals: self.decimal_places,
        }
    }

    pub const fn pivot_options(&self) -> PivotOptions {
        PivotOptions {
            value_field: self.value_field,
            oxide: self.oxide,
        }
    }

    pub fn de_settings(&self) -> DeSettings {
        DeSettings {
            population: self.population_size,
            generations: self.max_iterations,
            bounds: Bounds {
                scale: (self.scale_range_min, self.scale_range_max),
                ..Bounds::default()
            },
            ..DeSettings::default()
        }
    }

    pub fn optimizer_settings(&self) -> OptimizerSettings {
        OptimizerSettings {
            de: self.de_settings(),
            window: self.window(),
            use_multi_model: self.use_multi_model,
            scale_above_50_only: self.scale_above_50_only,
            seed: self.seed,
            elements: self.elements.clone(),
            excluded_labels: self.excluded_labels.clone(),
            decimals: self.decimal_places,
        }
    }
}
