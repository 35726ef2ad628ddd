use std::path::Path;

use ndarray_rand::rand::{Rng, SeedableRng};
use rand_isaac::Isaac64Rng;
use serde::Serialize;
use tempdir::TempDir;

use icp_calibration::analysis::Analyzer;
use icp_calibration::config::Config;
use icp_calibration::crm::{CrmCatalog, Resolution};
use icp_calibration::error::IssueKind;
use icp_calibration::measurement::LoadedRows;
use icp_calibration::minimisation::CancellationToken;
use icp_calibration::store::{InMemoryStore, MeasurementStore};
use icp_calibration::Result;

const PROJECT: &str = "batch-17";

const LABELS: [&str; 11] = [
    "RM1",
    "S1",
    "S2",
    "S3",
    "S4",
    "OREAS 258 a",
    "S5",
    "RM2",
    "S6",
    "OREAS 252",
    "RM3",
];

const CRM_TABLE: &str = "crm_id,method,Fe,Cu
OREAS 258,4-Acid Digestion,40,12
OREAS 258,Fire Assay,41,
OREAS 252,Aqua Regia Digestion,60,25
";

#[derive(Serialize)]
struct Row {
    label: String,
    element: String,
    #[serde(rename = "type")]
    sample_type: String,
    corr_con: f64,
    weight: f64,
}

/// A run whose response climbs 1% per sample, with CRMs reading 20% low before drift
fn write_run<R: Rng>(path: &Path, rng: &mut R) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for (position, label) in LABELS.iter().enumerate() {
        let drift = 1. + 0.01 * position as f64;
        for (element, certified) in [("Fe", [40., 60.]), ("Cu", [12., 25.])] {
            let (sample_type, value) = if label.starts_with("RM") {
                ("std", 100.)
            } else if label.contains("258") {
                ("sample", 0.8 * certified[0])
            } else if label.contains("252") {
                ("sample", 0.8 * certified[1])
            } else {
                ("sample", rng.gen_range(10.0..50.0))
            };
            writer.serialize(Row {
                label: (*label).to_owned(),
                element: element.to_owned(),
                sample_type: sample_type.to_owned(),
                corr_con: value * drift,
                weight: if *label == "S3" { 0.26 } else { 0.2 },
            })?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Lay out a run, a CRM table and a configuration in a fresh directory
fn create_run_dir(test_name: &str, config: &str) -> Result<TempDir> {
    let tmp_dir = TempDir::new(test_name)?;
    let seed = 40;
    let mut rng = Isaac64Rng::seed_from_u64(seed);
    write_run(&tmp_dir.path().join("rows.csv"), &mut rng)?;
    std::fs::write(tmp_dir.path().join("crm.csv"), CRM_TABLE)?;
    std::fs::write(tmp_dir.path().join("qc.toml"), config)?;
    Ok(tmp_dir)
}

fn load_store(dir: &Path) -> Result<InMemoryStore> {
    let loaded = LoadedRows::from_file(&dir.join("rows.csv"))?;
    assert!(loaded.issues.is_empty());
    let store = InMemoryStore::new();
    store.insert_rows(PROJECT, loaded.rows)?;
    store.set_crm_references(CrmCatalog::from_file(&dir.join("crm.csv"))?.references().to_vec())?;
    Ok(store)
}

#[test]
fn a_run_is_pivoted_segmented_and_corrected() -> Result<()> {
    let dir = create_run_dir("pivot", "method = \"Linear\"\n")?;
    let store = load_store(dir.path())?;
    let config = Config::from_file(&dir.path().join("qc.toml"))?;
    let analyzer = Analyzer::new(&store, config)?;

    let table = analyzer.pivot(PROJECT)?.value.unwrap();
    assert_eq!(table.rows.len(), LABELS.len());
    assert_eq!(table.columns, vec!["Cu", "Fe"]);

    let drift = analyzer.drift(PROJECT)?;
    assert!(drift.success);
    let drift = drift.value.unwrap();
    // Three RM standards and two CRMs bound four segments
    assert_eq!(drift.detection.standards.len(), 5);
    assert_eq!(drift.detection.segments.len(), 4);
    assert_eq!(drift.elements.len(), 2);

    // Readings at the opening standard of a segment are left alone
    let corrected = &drift.correction.corrected;
    for segment in &drift.detection.segments {
        assert_eq!(
            corrected.rows[segment.start].value("Fe"),
            table.rows[segment.start].value("Fe")
        );
    }
    // The closing standard of the run is brought back to the level of the one before it
    let last = LABELS.len() - 1;
    approx::assert_relative_eq!(
        corrected.rows[last].value("Cu").unwrap(),
        table.rows[last - 1].value("Cu").unwrap(),
        max_relative = 1e-12
    );
    Ok(())
}

#[test]
fn crm_rows_honour_configured_overrides() -> Result<()> {
    let config = r#"
        [crm_overrides]
        "OREAS 258 a" = "OREAS 258 (Fire Assay)"
    "#;
    let dir = create_run_dir("overrides", config)?;
    let store = load_store(dir.path())?;
    let analyzer = Analyzer::new(&store, Config::from_file(&dir.path().join("qc.toml"))?)?;

    let report = analyzer.crm_differences(PROJECT)?.value.unwrap();
    assert_eq!(report.rows.len(), 2);

    let overridden = &report.rows[0];
    assert_eq!(overridden.reference_key, "OREAS 258 (Fire Assay)");
    assert_eq!(overridden.resolution, Resolution::Override);
    let cu = overridden.cells.iter().find(|c| c.element == "Cu").unwrap();
    assert!(cu.diff_percent.is_none());
    assert!(!overridden.in_range);

    let preferred = &report.rows[1];
    assert_eq!(preferred.reference_key, "OREAS 252 (Aqua Regia Digestion)");
    assert_eq!(preferred.resolution, Resolution::SinglePreferred);
    Ok(())
}

#[test]
fn calibration_is_applied_and_undone() -> Result<()> {
    let dir = create_run_dir("calibration", "use_multi_model = true\nseed = 40\n")?;
    let store = load_store(dir.path())?;
    let original = store.rows(PROJECT)?;
    let analyzer = Analyzer::new(&store, Config::from_file(&dir.path().join("qc.toml"))?)?;

    let result = analyzer
        .optimize(PROJECT, &CancellationToken::new())?
        .value
        .unwrap();
    assert_eq!(result.elements.len(), 2);
    for element in &result.elements {
        assert_eq!(element.samples, 2);
        assert_eq!(element.pass_before, 0);
        assert_eq!(element.pass_after, 2);
        assert_eq!(element.candidates.len(), 3);
    }

    let applied = analyzer.apply_blank_scale(PROJECT, &result)?;
    assert!(applied.success);
    assert_eq!(applied.value.unwrap().rows_updated, 4);

    let calibrated = analyzer.crm_differences(PROJECT)?.value.unwrap();
    assert!(calibrated.rows.iter().all(|row| row.in_range));

    assert!(analyzer.undo(PROJECT)?.success);
    assert_eq!(store.rows(PROJECT)?, original);
    Ok(())
}

#[test]
fn preparation_errors_are_flagged_and_corrected() -> Result<()> {
    let dir = create_run_dir("weights", "")?;
    let store = load_store(dir.path())?;
    let analyzer = Analyzer::new(&store, Config::default())?;

    let range = icp_calibration::adjust::ValueRange::new(0.19, 0.21)?;
    let flagged = analyzer
        .bad_values(PROJECT, icp_calibration::measurement::Field::Weight, range)?
        .value
        .unwrap();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].label, "S3");
    approx::assert_relative_eq!(flagged[0].deviation, 0.06, max_relative = 1e-9);

    let before = store.rows(PROJECT)?;
    let outcome = analyzer.apply_field_change(
        PROJECT,
        "S3",
        icp_calibration::measurement::Field::Weight,
        0.2,
    )?;
    assert!(outcome.success);
    let after = store.rows(PROJECT)?;
    for (old, new) in before.iter().zip(&after).filter(|(row, _)| row.label == "S3") {
        assert_eq!(new.weight, Some(0.2));
        approx::assert_relative_eq!(
            new.corr_con.unwrap(),
            old.corr_con.unwrap() * 0.2 / 0.26,
            max_relative = 1e-12
        );
    }
    Ok(())
}

#[test]
fn malformed_rows_are_skipped_with_an_issue() -> Result<()> {
    let csv = "label,element,corr_con\nS1,Fe,1.5\nS1,,2.0\nS2,Fe,abc\nS2,Cu,3\n";
    let loaded = LoadedRows::from_reader(csv.as_bytes())?;
    assert_eq!(loaded.rows.len(), 2);
    assert_eq!(loaded.rows[1].index, 1);
    assert_eq!(loaded.issues.len(), 2);
    assert!(loaded.issues.iter().all(|i| i.kind == IssueKind::Parse));
    Ok(())
}
