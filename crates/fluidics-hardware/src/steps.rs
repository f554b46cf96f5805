//! Step table loading.
//!
//! Step tables are CSV files with the columns
//! `sequence_name, fluidic_port, flow_rate, volume, incubation_time, repeat,
//! fill_tubing_with, include`. Rows with `include = 0` are kept as disabled
//! steps so row numbers and step indices stay aligned.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use fluidics_core::step::Step;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
struct StepRow {
    sequence_name: String,
    fluidic_port: u32,
    flow_rate: f64,
    volume: f64,
    incubation_time: f64,
    repeat: u32,
    #[serde(default)]
    fill_tubing_with: Option<u32>,
    #[serde(default)]
    include: Option<u8>,
}

impl From<StepRow> for Step {
    fn from(row: StepRow) -> Self {
        Step {
            name: row.sequence_name.trim().to_string(),
            port: row.fluidic_port,
            flow_rate_ul_per_min: row.flow_rate,
            volume_ul: row.volume,
            incubation_time_min: row.incubation_time,
            repeat_count: row.repeat,
            fill_tubing_with: row.fill_tubing_with.filter(|port| *port != 0),
            enabled: row.include.map_or(true, |include| include != 0),
            use_ports: None,
        }
    }
}

/// Parse a step table from any reader.
pub fn read_steps<R: Read>(reader: R) -> Result<Vec<Step>> {
    let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    csv.deserialize::<StepRow>()
        .enumerate()
        .map(|(index, row)| {
            row.map(Step::from)
                .with_context(|| format!("Invalid step table row {}", index + 1))
        })
        .collect()
}

/// Load a step table from a CSV file.
pub fn load_steps(path: &Path) -> Result<Vec<Step>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open step table: {}", path.display()))?;
    let steps = read_steps(file)?;
    info!(
        path = %path.display(),
        rows = steps.len(),
        enabled = steps.iter().filter(|s| s.enabled).count(),
        "Loaded step table"
    );
    Ok(steps)
}
