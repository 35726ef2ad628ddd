//! Reshape one-row-per-measurement data into one-row-per-sample tables
//!
//! Rows are grouped by solution label. Within a label the repeat size is the number of rows in
//! one complete pass over the measured elements, which is the group size divided by the GCD of
//! the per-element counts. Each row is assigned to a repeat group by its position within the
//! label. If a `(label, group, element)` triple occurs more than once the run measured an element
//! several times per pass, and the additional readings become `Element_2`, `Element_3`, ...
//! columns. Otherwise each occurrence of an element opens its own row.

use std::collections::{BTreeMap, HashMap};

use itertools::Itertools;
use log::{debug, warn};
use serde::Serialize;

use crate::measurement::{Field, RawMeasurementRow};
use crate::oxide;

#[derive(Clone, Copy, Debug)]
pub struct PivotOptions {
    /// Which numeric field populates the table cells
    pub value_field: Field,
    /// Convert element columns to oxide columns where a factor is known
    pub oxide: bool,
}

impl Default for PivotOptions {
    fn default() -> Self {
        Self {
            value_field: Field::CorrCon,
            oxide: false,
        }
    }
}

/// How raw rows are keyed into pivoted rows
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RowKeying {
    /// One row per repeat group, repeated elements within a group get suffixed columns
    RepeatGroups,
    /// One row per occurrence of each `(label, element)` pair
    Occurrences,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PivotedSampleRow {
    pub solution_label: String,
    pub values: BTreeMap<String, Option<f64>>,
    /// Insertion index of the raw row behind each cell
    pub sources: BTreeMap<String, usize>,
    /// Insertion index of the first raw row in this pivoted row
    pub original_index: usize,
}

impl PivotedSampleRow {
    pub fn value(&self, column: &str) -> Option<f64> {
        self.values.get(column).copied().flatten()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PivotTable {
    pub columns: Vec<String>,
    pub rows: Vec<PivotedSampleRow>,
    pub has_repeats: bool,
    pub keying: RowKeying,
    /// Raw rows dropped because they carried no element code
    pub skipped: usize,
}

impl PivotTable {
    pub fn column_values(&self, column: &str) -> Vec<Option<f64>> {
        self.rows.iter().map(|row| row.value(column)).collect()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(|row| row.solution_label.as_str())
    }

    /// Columns whose base element symbol is `element`
    pub fn columns_for<'a>(&'a self, element: &'a str) -> impl Iterator<Item = &'a str> {
        self.columns
            .iter()
            .map(String::as_str)
            .filter(move |column| base_element(column).eq_ignore_ascii_case(element))
    }

    /// Columns belonging to any of `elements`, or every column when the list is empty
    pub fn select_columns(&self, elements: &[String]) -> Vec<String> {
        self.columns
            .iter()
            .filter(|column| {
                elements.is_empty()
                    || elements
                        .iter()
                        .any(|element| base_element(column).eq_ignore_ascii_case(element))
            })
            .cloned()
            .collect()
    }

    pub const fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Trim the label, mapping blank and `nan` labels to `Unknown`
pub fn normalise_label(label: &str) -> String {
    let trimmed = label.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        "Unknown".to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// Split a repeat suffix from a column name, `"Fe_2"` gives `("Fe", Some(2))`
pub fn split_repeat_suffix(column: &str) -> (&str, Option<usize>) {
    if let Some((base, suffix)) = column.rsplit_once('_') {
        if let Ok(repeat) = suffix.parse::<usize>() {
            if repeat >= 2 && !base.is_empty() {
                return (base, Some(repeat));
            }
        }
    }
    (column, None)
}

/// The element symbol of a column, the first whitespace-delimited token without repeat suffix
pub fn base_element(column: &str) -> &str {
    let (base, _) = split_repeat_suffix(column);
    base.split_whitespace().next().unwrap_or(base)
}

/// Sort key splitting a name into its alphabetic prefix and trailing integer
fn natural_key(column: &str) -> (String, u64, &str) {
    let prefix_len = column
        .trim_end_matches(|c: char| c.is_ascii_digit())
        .len();
    let number = column[prefix_len..].parse::<u64>().unwrap_or(0);
    let prefix = column[..prefix_len]
        .trim_end_matches(|c: char| c == '_' || c.is_whitespace())
        .to_ascii_lowercase();
    (prefix, number, column)
}

const fn gcd(a: usize, b: usize) -> usize {
    let (mut a, mut b) = (a, b);
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

/// Number of rows in one complete pass over the elements measured for a label
fn repeat_size(members: &[&RawMeasurementRow]) -> usize {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for row in members {
        *counts.entry(row.element.trim()).or_default() += 1;
    }
    let divisor = counts.values().fold(0, |acc, &count| gcd(acc, count));
    let total = members.len();
    if divisor > 0 && total % divisor == 0 {
        total / divisor
    } else {
        total
    }
}

struct Assigned<'a> {
    row: &'a RawMeasurementRow,
    label: String,
    group: usize,
}

struct Bucket<'a> {
    label: String,
    original_index: usize,
    members: Vec<(String, &'a RawMeasurementRow)>,
}

/// Pivot raw rows into a per-sample table
pub fn pivot(rows: &[RawMeasurementRow], options: &PivotOptions) -> PivotTable {
    let mut ordered: Vec<&RawMeasurementRow> = rows
        .iter()
        .filter(|row| !row.element.trim().is_empty())
        .collect();
    let skipped = rows.len() - ordered.len();
    if skipped > 0 {
        warn!("pivot skipped {skipped} rows without an element code");
    }
    ordered.sort_by_key(|row| row.index);

    // Group by label, preserving first appearance
    let mut group_index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<&RawMeasurementRow>)> = vec![];
    for &row in &ordered {
        let label = normalise_label(&row.label);
        let slot = *group_index.entry(label.clone()).or_insert_with(|| {
            groups.push((label, vec![]));
            groups.len() - 1
        });
        groups[slot].1.push(row);
    }

    let sizes: HashMap<&str, usize> = groups
        .iter()
        .map(|(label, members)| (label.as_str(), repeat_size(members)))
        .collect();

    let mut position: HashMap<String, usize> = HashMap::new();
    let assigned: Vec<Assigned> = ordered
        .iter()
        .map(|&row| {
            let label = normalise_label(&row.label);
            let size = sizes.get(label.as_str()).copied().unwrap_or(1).max(1);
            let pos = position.entry(label.clone()).or_default();
            let group = *pos / size;
            *pos += 1;
            Assigned { row, label, group }
        })
        .collect();

    let mut triples: HashMap<(&str, usize, &str), usize> = HashMap::new();
    for a in &assigned {
        *triples
            .entry((a.label.as_str(), a.group, a.row.element.trim()))
            .or_default() += 1;
    }
    let has_repeats = triples.values().any(|&count| count > 1);
    let keying = if has_repeats {
        RowKeying::RepeatGroups
    } else {
        RowKeying::Occurrences
    };

    let buckets = bucket_rows(&assigned, keying);
    let common_size = common_repeat_size(&groups, &sizes);
    let mut columns = order_columns(&buckets, common_size);

    let mut pivoted: Vec<PivotedSampleRow> = buckets
        .into_iter()
        .map(|bucket| {
            let mut values = BTreeMap::new();
            let mut sources = BTreeMap::new();
            for (column, row) in bucket.members {
                values.insert(column.clone(), row.get(options.value_field));
                sources.insert(column, row.index);
            }
            PivotedSampleRow {
                solution_label: bucket.label,
                values,
                sources,
                original_index: bucket.original_index,
            }
        })
        .collect();
    pivoted.sort_by_key(|row| row.original_index);

    if options.oxide {
        convert_to_oxides(&mut columns, &mut pivoted);
    }

    debug!(
        "pivoted {} raw rows into {} rows x {} columns ({keying:?})",
        ordered.len(),
        pivoted.len(),
        columns.len()
    );

    PivotTable {
        columns,
        rows: pivoted,
        has_repeats,
        keying,
        skipped,
    }
}

fn bucket_rows<'a>(assigned: &[Assigned<'a>], keying: RowKeying) -> Vec<Bucket<'a>> {
    let mut buckets: Vec<Bucket> = vec![];
    let mut bucket_index: HashMap<(String, usize), usize> = HashMap::new();
    // Occurrence counters, per (label, group, element) or per (label, element)
    let mut seen: HashMap<(String, usize, String), usize> = HashMap::new();

    for a in assigned {
        let element = a.row.element.trim().to_owned();
        let (key, column) = match keying {
            RowKeying::RepeatGroups => {
                let n = seen
                    .entry((a.label.clone(), a.group, element.clone()))
                    .or_default();
                *n += 1;
                let column = if *n == 1 {
                    element
                } else {
                    format!("{element}_{n}")
                };
                (a.group, column)
            }
            RowKeying::Occurrences => {
                let n = seen.entry((a.label.clone(), 0, element.clone())).or_default();
                let key = *n;
                *n += 1;
                (key, element)
            }
        };
        let slot = *bucket_index
            .entry((a.label.clone(), key))
            .or_insert_with(|| {
                buckets.push(Bucket {
                    label: a.label.clone(),
                    original_index: a.row.index,
                    members: vec![],
                });
                buckets.len() - 1
            });
        buckets[slot].members.push((column, a.row));
    }
    buckets
}

/// The most frequent repeat size over all labels, ties resolved by first appearance
fn common_repeat_size(
    groups: &[(String, Vec<&RawMeasurementRow>)],
    sizes: &HashMap<&str, usize>,
) -> usize {
    let mut tally: Vec<(usize, usize)> = vec![];
    for (label, _) in groups {
        let size = sizes.get(label.as_str()).copied().unwrap_or(0);
        match tally.iter_mut().find(|(s, _)| *s == size) {
            Some((_, count)) => *count += 1,
            None => tally.push((size, 1)),
        }
    }
    tally
        .iter()
        .rev()
        .max_by_key(|(_, count)| *count)
        .map_or(0, |(size, _)| *size)
}

/// Natural order from the first full bucket, then any remaining columns in union order
fn order_columns(buckets: &[Bucket], common_size: usize) -> Vec<String> {
    let union: Vec<&str> = buckets
        .iter()
        .flat_map(|bucket| bucket.members.iter().map(|(column, _)| column.as_str()))
        .unique()
        .collect();

    let Some(full) = buckets
        .iter()
        .find(|bucket| common_size > 0 && bucket.members.len() >= common_size)
    else {
        return union.into_iter().map(str::to_owned).collect();
    };

    let mut columns: Vec<String> = full
        .members
        .iter()
        .map(|(column, _)| column.as_str())
        .unique()
        .sorted_by(|a, b| natural_key(a).cmp(&natural_key(b)))
        .map(str::to_owned)
        .collect();
    for column in union {
        if !columns.iter().any(|c| c == column) {
            columns.push(column.to_owned());
        }
    }
    columns
}

/// Rename columns to their oxide formula and scale the values by the gravimetric factor
fn convert_to_oxides(columns: &mut [String], rows: &mut [PivotedSampleRow]) {
    for column in columns.iter_mut() {
        let symbol = base_element(column);
        let Some(spec) = oxide::lookup(symbol) else {
            continue;
        };
        let factor = spec.factor();
        let renamed = format!("{}{}", spec.formula, &column[symbol.len()..]);
        for row in rows.iter_mut() {
            if let Some(value) = row.values.remove(column.as_str()) {
                row.values.insert(renamed.clone(), value.map(|v| v * factor));
            }
            if let Some(source) = row.sources.remove(column.as_str()) {
                row.sources.insert(renamed.clone(), source);
            }
        }
        *column = renamed;
    }
}
