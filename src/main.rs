use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::warn;
use serde::Serialize;

use icp_calibration::adjust::ValueRange;
use icp_calibration::analysis::Analyzer;
use icp_calibration::config::Config;
use icp_calibration::crm::CrmCatalog;
use icp_calibration::measurement::{Field, LoadedRows};
use icp_calibration::minimisation::CancellationToken;
use icp_calibration::store::InMemoryStore;

/// Drift correction and CRM calibration for ICP batches
#[derive(Parser, Debug)]
#[command(name = "icp-qc", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration, defaults are used when omitted
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Raw measurement rows as CSV
    #[arg(long, short = 'r')]
    rows: PathBuf,

    /// Certified reference values as CSV
    #[arg(long)]
    crm: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the pivoted sample table
    Pivot,
    /// Detect segments, report drift and correct it
    Drift,
    /// Compare CRM samples with their certified values
    Crm,
    /// Calibrate blank and scale per element
    Optimize,
    /// Flag samples whose preparation values lie outside a range
    BadValues {
        #[arg(long, default_value = "weight", value_parser = parse_field)]
        field: Field,
        #[arg(long)]
        min: f64,
        #[arg(long)]
        max: f64,
    },
}

const PROJECT: &str = "cli";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let loaded = LoadedRows::from_file(&cli.rows)?;
    for issue in &loaded.issues {
        warn!("{issue}");
    }
    let store = InMemoryStore::new();
    store.insert_rows(PROJECT, loaded.rows)?;
    if let Some(path) = &cli.crm {
        let catalog = CrmCatalog::from_file(path)?;
        store.set_crm_references(catalog.references().to_vec())?;
    }

    let analyzer = Analyzer::new(&store, config)?;
    match cli.command {
        Command::Pivot => print(&analyzer.pivot(PROJECT)?),
        Command::Drift => print(&analyzer.drift(PROJECT)?),
        Command::Crm => print(&analyzer.crm_differences(PROJECT)?),
        Command::Optimize => print(&analyzer.optimize(PROJECT, &CancellationToken::new())?),
        Command::BadValues { field, min, max } => {
            print(&analyzer.bad_values(PROJECT, field, ValueRange::new(min, max)?)?)
        }
    }
}

fn parse_field(text: &str) -> Result<Field, String> {
    text.parse::<Field>().map_err(|e| e.to_string())
}

fn print(value: &impl Serialize) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
