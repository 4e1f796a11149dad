use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;

use crate::distance::DistanceSummary;
use crate::settings::Settings;


/// End-of-run record written next to the histogram.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub timestamp: DateTime<Local>,
    pub steps: usize,
    pub time_step: f64,
    pub num_elems: usize,
    pub num_boundary_faces: usize,
    pub candidate_entries: usize,
    pub initial_particles: usize,
    pub live_particles: usize,
    pub total_hits: u64,
    pub histogram: Vec<u64>,
    pub distances: Option<DistanceSummary>,
    pub elapsed_secs: f64,
}

fn create_output(dir: &Path, name: &str) -> Result<(PathBuf, BufWriter<File>)> {
    fs::create_dir_all(dir).with_context(|| format!("creating output directory {:?}", dir))?;
    let path = dir.join(name);
    let file = File::create(&path).with_context(|| format!("creating {:?}", path))?;
    Ok((path, BufWriter::new(file)))
}

/// Writes one `index count` line per detector bin.
pub fn write_histogram(counts: &[u64], name: &str, dir: &Path) -> Result<PathBuf> {
    let (path, mut writer) = create_output(dir, name)?;
    for (index, count) in counts.iter().enumerate() {
        writeln!(writer, "{} {}", index, count)?;
    }
    writer.flush()?;
    Ok(path)
}

pub fn write_summary(summary: &RunSummary, dir: &Path) -> Result<PathBuf> {
    let (path, mut writer) = create_output(dir, "summary.json")?;
    serde_json::to_writer_pretty(&mut writer, summary)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(path)
}

/// Dumps the effective settings so a run can be repeated.
pub fn write_settings(settings: &Settings, dir: &Path) -> Result<PathBuf> {
    let (path, mut writer) = create_output(dir, "settings.toml")?;
    let text = toml::to_string(settings).context("serializing settings")?;
    writer.write_all(text.as_bytes())?;
    writer.flush()?;
    Ok(path)
}
