//! Measurement persistence
//!
//! Each sampling session gets its own append-only text file, named after
//! the session start time and a caller-supplied label. Lines are flushed
//! as they are written so a crash mid-session loses at most one sample.

use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Line written when a sampling run begins.
pub const START_MARKER: &str = "Start measure";
/// Line written when a sampling run ends.
pub const FINISH_MARKER: &str = "Finish measure";

/// An append-only log file for one sampling session.
pub struct SessionLog {
    path: PathBuf,
    latencies: Vec<Duration>,
}

impl SessionLog {
    /// Create a log under `dir`, named `{dd-mm-yy_HH-MM-SS}_{label}.txt`
    /// from the current local time. The file itself is created lazily on
    /// the first append.
    pub fn new(dir: &Path, label: &str) -> Self {
        let stamp = Local::now().format("%d-%m-%y_%H-%M-%S");
        let path = dir.join(format!("{stamp}_{label}.txt"));
        tracing::info!(path = %path.display(), "session log created");
        Self {
            path,
            latencies: Vec::new(),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line, creating the file if needed.
    pub fn append_line(&self, line: &str) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{line}")?;
        writer.flush()
    }

    /// Mark the start of a sampling run.
    pub fn begin(&self) -> io::Result<()> {
        self.append_line(START_MARKER)
    }

    /// Record one sample line and its round-trip latency.
    pub fn record(&mut self, line: &str, latency: Duration) -> io::Result<()> {
        self.latencies.push(latency);
        self.append_line(line)
    }

    /// Number of samples recorded so far.
    pub fn sample_count(&self) -> usize {
        self.latencies.len()
    }

    /// Mean round-trip latency over the recorded samples.
    pub fn mean_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let total: Duration = self.latencies.iter().sum();
        Some(total / self.latencies.len() as u32)
    }

    /// Mark the end of a sampling run and append the latency summary: every
    /// per-sample round-trip time followed by their arithmetic mean.
    pub fn finish(&self) -> io::Result<()> {
        self.append_line(FINISH_MARKER)?;
        if let Some(mean) = self.mean_latency() {
            self.append_line("Response times (ms):")?;
            for latency in &self.latencies {
                self.append_line(&format!("{:.1}", latency.as_secs_f64() * 1000.0))?;
            }
            self.append_line(&format!(
                "Mean time of response: {:.1} ms",
                mean.as_secs_f64() * 1000.0
            ))?;
        }
        Ok(())
    }

    /// Empty the backing file and forget the recorded latencies.
    pub fn truncate(&mut self) -> io::Result<()> {
        File::create(&self.path)?;
        self.latencies.clear();
        tracing::debug!(path = %self.path.display(), "session log truncated");
        Ok(())
    }
}
