//! Compare pivoted samples against certified reference materials
//!
//! CRM samples are recognised from their label by a numeric id (`OREAS 258`, `CRM-252`, `906`).
//! The certified values come from every catalogue entry whose id starts with `oreas {id}`. When
//! a CRM is certified by several digestion methods the active entry is chosen by, in order, a
//! per-label override, a single preferred method, the alphabetically first preferred method, or
//! the first entry.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use log::{debug, warn};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Issue};
use crate::math::round_to;
use crate::pivot::{base_element, PivotTable};
use crate::Result;

pub const DEFAULT_CRM_IDS: [&str; 8] = ["258", "252", "906", "506", "233", "255", "263", "260"];

/// Digestion methods whose certified values are used when no override is set
pub const PREFERRED_METHODS: [&str; 2] = ["4-Acid Digestion", "Aqua Regia Digestion"];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrmReference {
    pub crm_id: String,
    pub method: String,
    /// Certified value per element symbol
    pub values: BTreeMap<String, f64>,
    #[serde(default)]
    pub preferred_source: bool,
}

impl CrmReference {
    /// Key identifying this entry in overrides and tie-breaks
    pub fn key(&self) -> String {
        format!("{} ({})", self.crm_id, self.method)
    }

    pub fn is_preferred(&self) -> bool {
        self.preferred_source
            || PREFERRED_METHODS
                .iter()
                .any(|method| method.eq_ignore_ascii_case(self.method.trim()))
    }

    /// Certified value for an element symbol, ignoring case
    pub fn certified(&self, element: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(symbol, _)| symbol.eq_ignore_ascii_case(element))
            .map(|(_, value)| *value)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CrmCatalog {
    references: Vec<CrmReference>,
}

impl CrmCatalog {
    pub fn new(references: Vec<CrmReference>) -> Self {
        Self { references }
    }

    pub fn references(&self) -> &[CrmReference] {
        &self.references
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    /// Every entry certified for the numeric CRM `id`
    pub fn candidates(&self, id: &str) -> Vec<&CrmReference> {
        let prefix = format!("oreas {}", id.trim().to_ascii_lowercase());
        self.references
            .iter()
            .filter(|reference| {
                reference
                    .crm_id
                    .trim()
                    .to_ascii_lowercase()
                    .starts_with(&prefix)
            })
            .collect()
    }

    /// # Errors
    /// Returns an error if the file cannot be read or lacks the id and method columns.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::DataNotFound(format!("{} not found", path.display())));
        }
        Self::from_reader(std::fs::File::open(path)?)
    }

    /// Read a catalogue with `crm_id`, `method`, optional `preferred`, and one column per element
    ///
    /// Blank cells are uncertified. Cells that are not numbers are skipped.
    ///
    /// # Errors
    /// Returns an error if the header row lacks the id or method columns.
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers: Vec<String> = rdr.headers()?.iter().map(str::to_owned).collect();
        let find = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
        let id_col =
            find("crm_id").ok_or_else(|| Error::Validation("missing `crm_id` column".into()))?;
        let method_col =
            find("method").ok_or_else(|| Error::Validation("missing `method` column".into()))?;
        let preferred_col = find("preferred");

        let mut references = vec![];
        for record in rdr.records() {
            let record = record?;
            let mut values = BTreeMap::new();
            for (col, cell) in record.iter().enumerate() {
                if col == id_col
                    || col == method_col
                    || Some(col) == preferred_col
                    || cell.is_empty()
                {
                    continue;
                }
                match cell.parse::<f64>() {
                    Ok(value) => {
                        values.insert(headers[col].clone(), value);
                    }
                    Err(_) => warn!("ignoring certified value `{cell}` for {}", headers[col]),
                }
            }
            references.push(CrmReference {
                crm_id: record.get(id_col).unwrap_or_default().to_owned(),
                method: record.get(method_col).unwrap_or_default().to_owned(),
                values,
                preferred_source: preferred_col
                    .and_then(|col| record.get(col))
                    .is_some_and(|cell| {
                        matches!(cell.to_ascii_lowercase().as_str(), "true" | "yes" | "1")
                    }),
            });
        }
        Ok(Self { references })
    }
}

/// Recognises CRM ids in solution labels
#[derive(Clone, Debug)]
pub struct CrmIdPattern {
    pattern: Regex,
}

impl CrmIdPattern {
    /// # Errors
    /// Returns an error if no ids are given or the pattern fails to compile.
    pub fn new<S: AsRef<str>>(ids: &[S]) -> Result<Self> {
        let mut ids: Vec<&str> = ids
            .iter()
            .map(|id| id.as_ref().trim())
            .filter(|id| !id.is_empty())
            .collect();
        if ids.is_empty() {
            return Err(Error::Validation("at least one CRM id is required".into()));
        }
        // Longer ids first so that `2580` is not read as `258`
        ids.sort_by_key(|id| std::cmp::Reverse(id.len()));
        let alternation = ids.iter().map(|id| regex::escape(id)).collect::<Vec<_>>().join("|");
        let pattern = RegexBuilder::new(&format!(r"\b(?:(?:CRM|OREAS)[\s_-]*)?({alternation})\b"))
            .case_insensitive(true)
            .build()?;
        Ok(Self { pattern })
    }

    /// The first CRM id found in `label`
    pub fn find(&self, label: &str) -> Option<String> {
        self.pattern
            .captures(label)
            .and_then(|captures| captures.get(1))
            .map(|id| id.as_str().to_owned())
    }
}

impl Default for CrmIdPattern {
    fn default() -> Self {
        Self::new(&DEFAULT_CRM_IDS).expect("default CRM ids form a valid pattern")
    }
}

/// Allowed deviation as a percentage of the certified value, by magnitude of that value
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToleranceTiers {
    /// Certified value below 10
    pub low: f64,
    /// Below 100
    pub mid: f64,
    /// Below 1 000
    pub high1: f64,
    /// Below 10 000
    pub high2: f64,
    /// Below 100 000
    pub high3: f64,
    pub high4: f64,
}

impl Default for ToleranceTiers {
    fn default() -> Self {
        Self {
            low: 20.,
            mid: 15.,
            high1: 10.,
            high2: 8.,
            high3: 5.,
            high4: 3.,
        }
    }
}

impl ToleranceTiers {
    pub fn tolerance_for(&self, certified: f64) -> f64 {
        match certified.abs() {
            v if v < 10. => self.low,
            v if v < 100. => self.mid,
            v if v < 1_000. => self.high1,
            v if v < 10_000. => self.high2,
            v if v < 100_000. => self.high3,
            _ => self.high4,
        }
    }
}

/// Which percent differences count as agreement with the certified value
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum AcceptanceWindow {
    Fixed { min: f64, max: f64 },
    Tiered(ToleranceTiers),
}

impl Default for AcceptanceWindow {
    fn default() -> Self {
        Self::Fixed {
            min: -10.,
            max: 10.,
        }
    }
}

impl AcceptanceWindow {
    pub fn contains(&self, diff_percent: f64, certified: f64) -> bool {
        match self {
            Self::Fixed { min, max } => *min <= diff_percent && diff_percent <= *max,
            Self::Tiered(tiers) => diff_percent.abs() <= tiers.tolerance_for(certified),
        }
    }
}

/// Percent difference of a sample from its certified value, undefined for a zero certified value
pub fn percent_difference(certified: f64, sample: f64) -> Option<f64> {
    if certified == 0. {
        return None;
    }
    Some((certified - sample) / certified * 100.)
}

/// How the active reference of a CRM row was chosen
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Resolution {
    Override,
    SinglePreferred,
    FirstPreferred,
    FirstAvailable,
}

/// Choose the active reference among the candidates for a label
pub fn resolve_reference<'a>(
    label: &str,
    candidates: &[&'a CrmReference],
    overrides: &BTreeMap<String, String>,
) -> Option<(&'a CrmReference, Resolution)> {
    if let Some(selected) = overrides.get(label) {
        match candidates
            .iter()
            .find(|reference| reference.key() == *selected)
        {
            Some(reference) => return Some((reference, Resolution::Override)),
            None => warn!("override `{selected}` for {label} matches no reference, ignoring"),
        }
    }

    let mut preferred: Vec<&'a CrmReference> = candidates
        .iter()
        .copied()
        .filter(|reference| reference.is_preferred())
        .collect();
    match preferred.len() {
        0 => candidates
            .first()
            .map(|reference| (*reference, Resolution::FirstAvailable)),
        1 => Some((preferred[0], Resolution::SinglePreferred)),
        _ => {
            preferred.sort_by_key(|reference| reference.key());
            Some((preferred[0], Resolution::FirstPreferred))
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DiffCell {
    pub column: String,
    pub element: String,
    pub sample_value: Option<f64>,
    pub crm_value: Option<f64>,
    pub diff_percent: Option<f64>,
    pub in_range: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CrmDiffRow {
    pub solution_label: String,
    /// Position of the row in the pivot table
    pub row_index: usize,
    pub crm_id: String,
    pub reference_key: String,
    pub resolution: Resolution,
    pub cells: Vec<DiffCell>,
    /// Every cell had a defined difference inside the window
    pub in_range: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CrmDiffReport {
    pub rows: Vec<CrmDiffRow>,
    pub issues: Vec<Issue>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DiffOptions {
    pub window: AcceptanceWindow,
    pub decimals: u32,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            window: AcceptanceWindow::default(),
            decimals: 2,
        }
    }
}

/// Match CRM rows in the table to their certified values and compute percent differences
pub fn compute_differences(
    table: &PivotTable,
    catalog: &CrmCatalog,
    pattern: &CrmIdPattern,
    overrides: &BTreeMap<String, String>,
    options: &DiffOptions,
) -> CrmDiffReport {
    let mut report = CrmDiffReport::default();

    for (row_index, row) in table.rows.iter().enumerate() {
        let Some(crm_id) = pattern.find(&row.solution_label) else {
            continue;
        };
        let candidates = catalog.candidates(&crm_id);
        let Some((reference, resolution)) =
            resolve_reference(&row.solution_label, &candidates, overrides)
        else {
            report.issues.push(Issue::not_found(format!(
                "{}: no certified values for OREAS {crm_id}",
                row.solution_label
            )));
            continue;
        };

        let cells: Vec<DiffCell> = table
            .columns
            .iter()
            .map(|column| {
                let element = base_element(column).to_owned();
                let sample_value = row.value(column);
                let crm_value = reference.certified(&element);
                let diff_percent = crm_value
                    .zip(sample_value)
                    .and_then(|(crm, sample)| percent_difference(crm, sample))
                    .map(|diff| round_to(diff, options.decimals));
                let in_range = match (diff_percent, crm_value) {
                    (Some(diff), Some(crm)) => options.window.contains(diff, crm),
                    _ => false,
                };
                DiffCell {
                    column: column.clone(),
                    element,
                    sample_value,
                    crm_value,
                    diff_percent,
                    in_range,
                }
            })
            .collect();

        let in_range = !cells.is_empty() && cells.iter().all(|cell| cell.in_range);
        report.rows.push(CrmDiffRow {
            solution_label: row.solution_label.clone(),
            row_index,
            crm_id,
            reference_key: reference.key(),
            resolution,
            cells,
            in_range,
        });
    }

    if report.rows.is_empty() {
        report
            .issues
            .push(Issue::not_found("no CRM samples matched a certified reference"));
    }
    debug!(
        "matched {} CRM rows, {} in range",
        report.rows.len(),
        report.rows.iter().filter(|row| row.in_range).count()
    );
    report
}
