use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Issue};
use crate::Result;

/// What kind of solution a row was measured on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleType {
    #[default]
    Sample,
    Standard,
    Blank,
}

impl FromStr for SampleType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "samp" | "sample" => Ok(Self::Sample),
            "std" | "standard" => Ok(Self::Standard),
            "blk" | "blank" => Ok(Self::Blank),
            other => Err(Error::Validation(format!("unknown sample type `{other}`"))),
        }
    }
}

/// The numeric fields carried by a raw row
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Intensity,
    CorrCon,
    SolnConc,
    DilutionFactor,
    Weight,
    Volume,
}

impl Field {
    pub const ALL: [Self; 6] = [
        Self::Intensity,
        Self::CorrCon,
        Self::SolnConc,
        Self::DilutionFactor,
        Self::Weight,
        Self::Volume,
    ];

    /// The column header used in CSV input
    pub const fn column(self) -> &'static str {
        match self {
            Self::Intensity => "intensity",
            Self::CorrCon => "corr_con",
            Self::SolnConc => "soln_conc",
            Self::DilutionFactor => "dilution_factor",
            Self::Weight => "weight",
            Self::Volume => "volume",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl FromStr for Field {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalised = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        Self::ALL
            .into_iter()
            .find(|field| field.column() == normalised)
            .or(match normalised.as_str() {
                "df" => Some(Self::DilutionFactor),
                "corrcon" | "corr_conc" => Some(Self::CorrCon),
                _ => None,
            })
            .ok_or_else(|| Error::Validation(format!("unknown field `{s}`")))
    }
}

/// One instrument reading: a single element measured on a single solution
///
/// Rows are the source of truth and are never mutated by the analytical components. Columns
/// the engine does not recognise are kept verbatim in `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMeasurementRow {
    /// Insertion order within the project
    pub index: usize,
    pub label: String,
    pub element: String,
    pub sample_type: SampleType,
    pub intensity: Option<f64>,
    pub corr_con: Option<f64>,
    pub soln_conc: Option<f64>,
    pub dilution_factor: Option<f64>,
    pub weight: Option<f64>,
    pub volume: Option<f64>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl RawMeasurementRow {
    pub fn new(index: usize, label: impl Into<String>, element: impl Into<String>) -> Self {
        Self {
            index,
            label: label.into(),
            element: element.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with(mut self, field: Field, value: f64) -> Self {
        self.set(field, Some(value));
        self
    }

    pub const fn get(&self, field: Field) -> Option<f64> {
        match field {
            Field::Intensity => self.intensity,
            Field::CorrCon => self.corr_con,
            Field::SolnConc => self.soln_conc,
            Field::DilutionFactor => self.dilution_factor,
            Field::Weight => self.weight,
            Field::Volume => self.volume,
        }
    }

    pub fn set(&mut self, field: Field, value: Option<f64>) {
        let slot = match field {
            Field::Intensity => &mut self.intensity,
            Field::CorrCon => &mut self.corr_con,
            Field::SolnConc => &mut self.soln_conc,
            Field::DilutionFactor => &mut self.dilution_factor,
            Field::Weight => &mut self.weight,
            Field::Volume => &mut self.volume,
        };
        *slot = value;
    }
}

/// Rows accepted from an input source, with the issues raised by rejected rows
#[derive(Debug, Default)]
pub struct LoadedRows {
    pub rows: Vec<RawMeasurementRow>,
    pub issues: Vec<Issue>,
}

impl LoadedRows {
    /// Read rows from a CSV file
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or has no header row. Malformed rows are
    /// skipped and reported in `issues`.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::DataNotFound(format!("{} not found", path.display())));
        }
        Self::from_reader(std::fs::File::open(path)?)
    }

    /// Read rows from any CSV source
    ///
    /// # Errors
    /// Returns an error if the header row is missing or lacks a `label` or `element` column.
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: Vec<String> = rdr
            .headers()?
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .collect();
        let position = |name: &str| headers.iter().position(|h| h == name);
        let label_col = position("label")
            .or_else(|| position("solution_label"))
            .ok_or_else(|| Error::Validation("missing `label` column".into()))?;
        let element_col = position("element")
            .ok_or_else(|| Error::Validation("missing `element` column".into()))?;
        let type_col = position("type");
        let field_cols: Vec<(Field, usize)> = Field::ALL
            .into_iter()
            .filter_map(|field| position(field.column()).map(|col| (field, col)))
            .collect();

        let mut loaded = Self::default();
        for (line, record) in rdr.records().enumerate() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    warn!("skipping unreadable row {line}: {e}");
                    loaded.issues.push(Issue::parse(format!("row {line}: {e}")));
                    continue;
                }
            };
            match parse_record(
                &record,
                &headers,
                loaded.rows.len(),
                label_col,
                element_col,
                type_col,
                &field_cols,
            ) {
                Ok(row) => loaded.rows.push(row),
                Err(e) => {
                    warn!("skipping row {line}: {e}");
                    loaded.issues.push(Issue::parse(format!("row {line}: {e}")));
                }
            }
        }
        debug!(
            "loaded {} rows, skipped {}",
            loaded.rows.len(),
            loaded.issues.len()
        );
        Ok(loaded)
    }
}

fn parse_record(
    record: &csv::StringRecord,
    headers: &[String],
    index: usize,
    label_col: usize,
    element_col: usize,
    type_col: Option<usize>,
    field_cols: &[(Field, usize)],
) -> Result<RawMeasurementRow> {
    let element = record.get(element_col).unwrap_or_default();
    if element.is_empty() {
        return Err(Error::Parse {
            row: index,
            reason: "empty element code".into(),
        });
    }
    let mut row = RawMeasurementRow::new(
        index,
        record.get(label_col).unwrap_or_default(),
        element,
    );
    if let Some(col) = type_col {
        row.sample_type = record.get(col).unwrap_or_default().parse()?;
    }
    for &(field, col) in field_cols {
        row.set(field, parse_cell(record.get(col), index, field)?);
    }
    let known: Vec<usize> = field_cols
        .iter()
        .map(|&(_, col)| col)
        .chain([label_col, element_col])
        .chain(type_col)
        .collect();
    for (col, value) in record.iter().enumerate() {
        if known.contains(&col) {
            continue;
        }
        if let Some(header) = headers.get(col) {
            row.extra.insert(header.clone(), value.to_owned());
        }
    }
    Ok(row)
}

/// Blank and `nan` cells are missing values, anything else must be a finite number
fn parse_cell(cell: Option<&str>, row: usize, field: Field) -> Result<Option<f64>> {
    match cell.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) if text.eq_ignore_ascii_case("nan") => Ok(None),
        Some(text) => match text.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(Some(value)),
            _ => Err(Error::Parse {
                row,
                reason: format!("`{text}` is not a number in column {field}"),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::{Field, LoadedRows, SampleType};

    const CSV: &str = "\
label,element,type,corr_con,weight,volume,operator
RM1,Fe,std,100,0.2,50,kim
S1,Fe,,90,0.25,50,kim
S2,Fe,samp,abc,0.2,50,kim
S3,,samp,12,0.2,50,kim
RM2,Fe,std,110,nan,50,lee
";

    #[test]
    fn malformed_rows_are_skipped_and_reported() {
        let loaded = LoadedRows::from_reader(CSV.as_bytes()).unwrap();

        assert_eq!(loaded.rows.len(), 3);
        assert_eq!(loaded.issues.len(), 2);
        // Indices follow accepted rows only
        let indices = loaded.rows.iter().map(|r| r.index).collect::<Vec<_>>();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(loaded.rows[2].label, "RM2");
    }

    #[test]
    fn known_columns_are_typed_and_unknown_columns_are_kept() {
        let loaded = LoadedRows::from_reader(CSV.as_bytes()).unwrap();
        let rm1 = &loaded.rows[0];

        assert_eq!(rm1.sample_type, SampleType::Standard);
        assert_eq!(rm1.get(Field::CorrCon), Some(100.0));
        assert_eq!(rm1.get(Field::Weight), Some(0.2));
        assert_eq!(rm1.get(Field::Intensity), None);
        assert_eq!(rm1.extra.get("operator").map(String::as_str), Some("kim"));
        assert_eq!(loaded.rows[2].weight, None);
    }

    #[test]
    fn field_names_parse_leniently() {
        assert_eq!("DF".parse::<Field>().unwrap(), Field::DilutionFactor);
        assert_eq!("Corr Con".parse::<Field>().unwrap(), Field::CorrCon);
        assert_eq!("weight".parse::<Field>().unwrap(), Field::Weight);
        assert!("colour".parse::<Field>().is_err());
    }
}
