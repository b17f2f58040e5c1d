use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const EVENTS_FILE: &str = "events.jsonl";

/// One scalar group at one global step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub step: usize,
    pub tag: String,
    pub values: BTreeMap<String, f64>,
    pub wall_time: f64,
}

/// Append-only scalar log, one JSON event per line.
///
/// Opening the writer drops every event recorded at or after `purge_step`,
/// so a resumed run continues the curves instead of overlapping them.
pub struct SummaryWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl SummaryWriter {
    pub fn new(log_dir: &Path, purge_step: usize) -> Result<Self> {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;
        let path = log_dir.join(EVENTS_FILE);

        if path.exists() {
            let events = read_events(&path)?;
            let total = events.len();
            let kept: Vec<ScalarEvent> = events.into_iter().filter(|e| e.step < purge_step).collect();
            if kept.len() < total {
                debug!("Purging {} events at or after step {}", total - kept.len(), purge_step);
            }
            let mut text = String::new();
            for event in &kept {
                text.push_str(&serde_json::to_string(event)?);
                text.push('\n');
            }
            fs::write(&path, text).with_context(|| format!("Failed to rewrite event log: {:?}", path))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open event log: {:?}", path))?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_scalars(&mut self, tag: &str, values: &[(&str, f64)], step: usize) -> Result<()> {
        let event = ScalarEvent {
            step,
            tag: tag.to_string(),
            values: values.iter().map(|(name, v)| (name.to_string(), *v)).collect(),
            wall_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default(),
        };
        serde_json::to_writer(&mut self.writer, &event)?;
        self.writer
            .write_all(b"\n")
            .with_context(|| format!("Failed to write event log: {:?}", self.path))?;
        Ok(())
    }

    /// A single scalar is stored as a group with one value named after its tag.
    pub fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.add_scalars(tag, &[(tag, value)], step)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush event log: {:?}", self.path))
    }
}

/// Read every event in a log; unparseable lines are skipped with a warning.
pub fn read_events(path: &Path) -> Result<Vec<ScalarEvent>> {
    let file = File::open(path).with_context(|| format!("Failed to open event log: {:?}", path))?;
    let mut events = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(event) => events.push(event),
            Err(e) => warn!("Skipping event log line {}: {}", line_no + 1, e),
        }
    }
    Ok(events)
}
