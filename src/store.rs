//! The storage collaborator: raw rows, CRM references, overrides and undo snapshots

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::crm::CrmReference;
use crate::error::Error;
use crate::measurement::{Field, RawMeasurementRow};
use crate::Result;

/// A single value to persist on a raw row
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldWrite {
    pub sample_label: String,
    pub element: String,
    /// The exact raw row to update, when known
    pub row_index: Option<usize>,
    pub field: Field,
    pub new_value: Option<f64>,
}

/// The prior state of every row touched by one write-back
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrectionSnapshot {
    pub project: String,
    pub description: String,
    /// JSON encoded rows as they were before the write
    pub payload: String,
}

impl CorrectionSnapshot {
    /// # Errors
    /// Returns an error if the rows cannot be serialised.
    pub fn capture(
        project: &str,
        description: impl Into<String>,
        rows: &[RawMeasurementRow],
    ) -> Result<Self> {
        Ok(Self {
            project: project.to_owned(),
            description: description.into(),
            payload: serde_json::to_string(rows)?,
        })
    }

    /// # Errors
    /// Returns an error if the payload is not a list of rows.
    pub fn rows(&self) -> Result<Vec<RawMeasurementRow>> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Persistent storage used by the request layer
///
/// Implementations report unavailability as [`Error::Storage`]. Writers to a project must be
/// serialised by the caller.
pub trait MeasurementStore {
    /// Rows of a project in insertion order, empty if the project is unknown
    fn rows(&self, project: &str) -> Result<Vec<RawMeasurementRow>>;

    fn crm_references(&self) -> Result<Vec<CrmReference>>;

    /// Per-label CRM reference selections, keyed by solution label
    fn crm_overrides(&self, project: &str) -> Result<BTreeMap<String, String>>;

    /// Replace stored rows that share an insertion index with one of `rows`
    fn write_rows(&self, project: &str, rows: &[RawMeasurementRow]) -> Result<()>;

    fn push_snapshot(&self, snapshot: CorrectionSnapshot) -> Result<()>;

    /// Remove and return the most recent snapshot of a project
    fn pop_snapshot(&self, project: &str) -> Result<Option<CorrectionSnapshot>>;
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    rows: Mutex<BTreeMap<String, Vec<RawMeasurementRow>>>,
    references: Mutex<Vec<CrmReference>>,
    overrides: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    snapshots: Mutex<BTreeMap<String, Vec<CorrectionSnapshot>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Storage("store lock poisoned".into()))
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns an error if the store is poisoned.
    pub fn insert_rows(&self, project: &str, rows: Vec<RawMeasurementRow>) -> Result<()> {
        lock(&self.rows)?.insert(project.to_owned(), rows);
        Ok(())
    }

    /// # Errors
    /// Returns an error if the store is poisoned.
    pub fn set_crm_references(&self, references: Vec<CrmReference>) -> Result<()> {
        *lock(&self.references)? = references;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the store is poisoned.
    pub fn set_override(&self, project: &str, label: &str, reference_key: &str) -> Result<()> {
        lock(&self.overrides)?
            .entry(project.to_owned())
            .or_default()
            .insert(label.to_owned(), reference_key.to_owned());
        Ok(())
    }

    /// # Errors
    /// Returns an error if the store is poisoned.
    pub fn snapshot_count(&self, project: &str) -> Result<usize> {
        Ok(lock(&self.snapshots)?.get(project).map_or(0, Vec::len))
    }
}

impl MeasurementStore for InMemoryStore {
    fn rows(&self, project: &str) -> Result<Vec<RawMeasurementRow>> {
        Ok(lock(&self.rows)?.get(project).cloned().unwrap_or_default())
    }

    fn crm_references(&self) -> Result<Vec<CrmReference>> {
        Ok(lock(&self.references)?.clone())
    }

    fn crm_overrides(&self, project: &str) -> Result<BTreeMap<String, String>> {
        Ok(lock(&self.overrides)?.get(project).cloned().unwrap_or_default())
    }

    fn write_rows(&self, project: &str, rows: &[RawMeasurementRow]) -> Result<()> {
        let mut projects = lock(&self.rows)?;
        let stored = projects
            .get_mut(project)
            .ok_or_else(|| Error::Storage(format!("project `{project}` does not exist")))?;
        // Check every row first so a failed write leaves the project untouched
        let positions = rows
            .iter()
            .map(|row| {
                stored
                    .iter()
                    .position(|existing| existing.index == row.index)
                    .ok_or_else(|| {
                        Error::Storage(format!("row {} is not stored in `{project}`", row.index))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        for (position, row) in positions.into_iter().zip(rows) {
            stored[position] = row.clone();
        }
        Ok(())
    }

    fn push_snapshot(&self, snapshot: CorrectionSnapshot) -> Result<()> {
        lock(&self.snapshots)?
            .entry(snapshot.project.clone())
            .or_default()
            .push(snapshot);
        Ok(())
    }

    fn pop_snapshot(&self, project: &str) -> Result<Option<CorrectionSnapshot>> {
        Ok(lock(&self.snapshots)?
            .get_mut(project)
            .and_then(Vec::pop))
    }
}

#[cfg(test)]
mod tests {
    use super::{CorrectionSnapshot, InMemoryStore, MeasurementStore};
    use crate::error::Error;
    use crate::measurement::{Field, RawMeasurementRow};

    fn rows() -> Vec<RawMeasurementRow> {
        vec![
            RawMeasurementRow::new(0, "S1", "Fe").with(Field::CorrCon, 1.),
            RawMeasurementRow::new(1, "S1", "Cu").with(Field::CorrCon, 2.),
        ]
    }

    #[test]
    fn snapshots_restore_the_captured_rows() {
        let snapshot = CorrectionSnapshot::capture("p", "test", &rows()).unwrap();
        assert_eq!(snapshot.rows().unwrap(), rows());
    }

    #[test]
    fn writes_replace_rows_by_index() {
        let store = InMemoryStore::new();
        store.insert_rows("p", rows()).unwrap();

        let updated = RawMeasurementRow::new(1, "S1", "Cu").with(Field::CorrCon, 5.);
        store.write_rows("p", &[updated.clone()]).unwrap();

        let stored = store.rows("p").unwrap();
        assert_eq!(stored[1], updated);
        assert_eq!(stored[0], rows()[0]);
    }

    #[test]
    fn writes_to_unknown_rows_fail_without_partial_updates() {
        let store = InMemoryStore::new();
        store.insert_rows("p", rows()).unwrap();

        let result = store.write_rows(
            "p",
            &[
                RawMeasurementRow::new(0, "S1", "Fe").with(Field::CorrCon, 9.),
                RawMeasurementRow::new(7, "S9", "Fe"),
            ],
        );
        assert!(matches!(result, Err(Error::Storage(_))));
        assert_eq!(store.rows("p").unwrap(), rows());
    }

    #[test]
    fn snapshots_are_popped_most_recent_first() {
        let store = InMemoryStore::new();
        for description in ["first", "second"] {
            store
                .push_snapshot(CorrectionSnapshot::capture("p", description, &[]).unwrap())
                .unwrap();
        }
        assert_eq!(store.snapshot_count("p").unwrap(), 2);
        assert_eq!(store.pop_snapshot("p").unwrap().unwrap().description, "second");
        assert_eq!(store.pop_snapshot("p").unwrap().unwrap().description, "first");
        assert!(store.pop_snapshot("p").unwrap().is_none());
        assert!(store.rows("unknown").unwrap().is_empty());
    }
}
