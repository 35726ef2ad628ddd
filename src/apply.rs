//! Write corrections back to storage behind an undo snapshot

use std::collections::BTreeMap;

use log::{error, info, warn};
use serde::Serialize;

use crate::error::{Error, Issue};
use crate::measurement::RawMeasurementRow;
use crate::pivot::normalise_label;
use crate::store::{CorrectionSnapshot, FieldWrite, MeasurementStore};
use crate::Result;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ApplyReport {
    pub description: String,
    pub rows_updated: usize,
    pub writes_applied: usize,
    /// Writes that matched no stored row
    pub unresolved: Vec<Issue>,
    pub snapshot_taken: bool,
}

pub struct CorrectionApplier<'a, S> {
    store: &'a S,
}

impl<'a, S: MeasurementStore> CorrectionApplier<'a, S> {
    pub const fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Persist `writes`, snapshotting the prior state of every touched row first
    ///
    /// A write addresses its raw row by index when known, otherwise every row with the same
    /// solution label and element. If the write-back fails the snapshot is discarded again.
    ///
    /// # Errors
    /// Returns [`Error::Storage`] if the store cannot be read or written.
    pub fn apply(
        &self,
        project: &str,
        description: &str,
        writes: &[FieldWrite],
    ) -> Result<ApplyReport> {
        let rows = self.store.rows(project)?;
        let mut updated: BTreeMap<usize, RawMeasurementRow> = BTreeMap::new();
        let mut report = ApplyReport {
            description: description.to_owned(),
            ..ApplyReport::default()
        };

        for write in writes {
            let targets = targets(&rows, write);
            if targets.is_empty() {
                report.unresolved.push(Issue::not_found(format!(
                    "no stored row for {} {}",
                    write.sample_label, write.element
                )));
                continue;
            }
            for position in targets {
                updated
                    .entry(position)
                    .or_insert_with(|| rows[position].clone())
                    .set(write.field, write.new_value);
            }
            report.writes_applied += 1;
        }

        if updated.is_empty() {
            warn!("{description}: nothing to write for `{project}`");
            return Ok(report);
        }

        let prior = updated.keys().map(|&p| rows[p].clone()).collect::<Vec<_>>();
        let updated = updated.into_values().collect::<Vec<_>>();

        self.store
            .push_snapshot(CorrectionSnapshot::capture(project, description, &prior)?)?;
        if let Err(e) = self.store.write_rows(project, &updated) {
            error!("{description}: write-back to `{project}` failed, discarding snapshot: {e}");
            if let Err(rollback) = self.store.pop_snapshot(project) {
                error!("discarding the snapshot of `{project}` also failed: {rollback}");
            }
            return Err(as_storage(e));
        }

        report.rows_updated = updated.len();
        report.snapshot_taken = true;
        info!(
            "{description}: updated {} rows of `{project}`",
            report.rows_updated
        );
        Ok(report)
    }

    /// Restore the most recent snapshot of a project, `None` if there is nothing to undo
    ///
    /// # Errors
    /// Returns [`Error::Storage`] if the store fails, in which case the snapshot is kept.
    pub fn undo(&self, project: &str) -> Result<Option<ApplyReport>> {
        let Some(snapshot) = self.store.pop_snapshot(project)? else {
            return Ok(None);
        };
        let rows = match snapshot.rows() {
            Ok(rows) => rows,
            Err(e) => {
                self.store.push_snapshot(snapshot)?;
                return Err(as_storage(e));
            }
        };
        if let Err(e) = self.store.write_rows(project, &rows) {
            error!("undo of `{project}` failed, keeping snapshot: {e}");
            self.store.push_snapshot(snapshot)?;
            return Err(as_storage(e));
        }
        info!("undid `{}` on `{project}`", snapshot.description);
        Ok(Some(ApplyReport {
            description: format!("undo {}", snapshot.description),
            rows_updated: rows.len(),
            writes_applied: rows.len(),
            unresolved: vec![],
            snapshot_taken: false,
        }))
    }
}

/// Positions in `rows` addressed by a write
fn targets(rows: &[RawMeasurementRow], write: &FieldWrite) -> Vec<usize> {
    if let Some(index) = write.row_index {
        return rows
            .iter()
            .position(|row| row.index == index)
            .into_iter()
            .collect();
    }
    let label = normalise_label(&write.sample_label);
    rows.iter()
        .enumerate()
        .filter(|(_, row)| {
            normalise_label(&row.label) == label
                && row.element.trim().eq_ignore_ascii_case(write.element.trim())
        })
        .map(|(position, _)| position)
        .collect()
}

fn as_storage(e: Error) -> Error {
    match e {
        Error::Storage(_) => e,
        other => Error::Storage(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::CorrectionApplier;
    use crate::crm::CrmReference;
    use crate::error::Error;
    use crate::measurement::{Field, RawMeasurementRow};
    use crate::store::{CorrectionSnapshot, FieldWrite, InMemoryStore, MeasurementStore};
    use crate::Result;

    fn seeded_store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .insert_rows(
                "p",
                vec![
                    RawMeasurementRow::new(0, "S1", "Fe").with(Field::CorrCon, 10.),
                    RawMeasurementRow::new(1, "S1", "Cu").with(Field::CorrCon, 20.),
                    RawMeasurementRow::new(2, "S2", "Fe").with(Field::CorrCon, 30.),
                ],
            )
            .unwrap();
        store
    }

    fn write(label: &str, element: &str, row_index: Option<usize>, value: f64) -> FieldWrite {
        FieldWrite {
            sample_label: label.into(),
            element: element.into(),
            row_index,
            field: Field::CorrCon,
            new_value: Some(value),
        }
    }

    #[test]
    fn apply_then_undo_restores_the_original_rows() {
        let store = seeded_store();
        let original = store.rows("p").unwrap();
        let applier = CorrectionApplier::new(&store);

        let report = applier
            .apply("p", "drift", &[write("S1", "Fe", Some(0), 11.), write("S2", "fe", None, 33.)])
            .unwrap();
        assert_eq!(report.rows_updated, 2);
        assert!(report.snapshot_taken);
        assert_eq!(store.rows("p").unwrap()[2].corr_con, Some(33.));

        let undone = applier.undo("p").unwrap().unwrap();
        assert_eq!(undone.rows_updated, 2);
        assert_eq!(store.rows("p").unwrap(), original);
        assert!(applier.undo("p").unwrap().is_none());
    }

    #[test]
    fn undo_is_last_in_first_out() {
        let store = seeded_store();
        let applier = CorrectionApplier::new(&store);
        applier.apply("p", "first", &[write("S1", "Fe", Some(0), 1.)]).unwrap();
        applier.apply("p", "second", &[write("S1", "Fe", Some(0), 2.)]).unwrap();

        assert_eq!(applier.undo("p").unwrap().unwrap().description, "undo second");
        assert_eq!(store.rows("p").unwrap()[0].corr_con, Some(1.));
        applier.undo("p").unwrap();
        assert_eq!(store.rows("p").unwrap()[0].corr_con, Some(10.));
    }

    #[test]
    fn unmatched_writes_are_reported_without_a_snapshot() {
        let store = seeded_store();
        let applier = CorrectionApplier::new(&store);
        let report = applier.apply("p", "nothing", &[write("S9", "Fe", None, 1.)]).unwrap();

        assert_eq!(report.unresolved.len(), 1);
        assert!(!report.snapshot_taken);
        assert_eq!(store.snapshot_count("p").unwrap(), 0);
    }

    /// Accepts reads and snapshots but refuses every row write
    struct ReadOnlyStore(InMemoryStore);

    impl MeasurementStore for ReadOnlyStore {
        fn rows(&self, project: &str) -> Result<Vec<RawMeasurementRow>> {
            self.0.rows(project)
        }

        fn crm_references(&self) -> Result<Vec<CrmReference>> {
            self.0.crm_references()
        }

        fn crm_overrides(&self, project: &str) -> Result<BTreeMap<String, String>> {
            self.0.crm_overrides(project)
        }

        fn write_rows(&self, _: &str, _: &[RawMeasurementRow]) -> Result<()> {
            Err(Error::Storage("read only".into()))
        }

        fn push_snapshot(&self, snapshot: CorrectionSnapshot) -> Result<()> {
            self.0.push_snapshot(snapshot)
        }

        fn pop_snapshot(&self, project: &str) -> Result<Option<CorrectionSnapshot>> {
            self.0.pop_snapshot(project)
        }
    }

    #[test]
    fn failed_writes_roll_back_the_snapshot() {
        let store = ReadOnlyStore(seeded_store());
        let applier = CorrectionApplier::new(&store);

        let result = applier.apply("p", "drift", &[write("S1", "Fe", Some(0), 11.)]);
        assert!(matches!(result, Err(Error::Storage(_))));
        assert_eq!(store.0.snapshot_count("p").unwrap(), 0);
    }

    #[test]
    fn failed_undo_keeps_the_snapshot() {
        let inner = seeded_store();
        let prior = inner.rows("p").unwrap();
        inner
            .push_snapshot(CorrectionSnapshot::capture("p", "drift", &prior).unwrap())
            .unwrap();
        let store = ReadOnlyStore(inner);

        let result = CorrectionApplier::new(&store).undo("p");
        assert!(matches!(result, Err(Error::Storage(_))));
        assert_eq!(store.0.snapshot_count("p").unwrap(), 1);
    }
}
