//! Periodic sampling of live vehicle data
//!
//! A sampler worker issues the configured command set once per cycle and
//! persists results into one [`SessionLog`] per signal plus one log of
//! per-cycle round-trip times. Cancellation is
//! cooperative and cycle-aligned: a stop request lets the current cycle
//! complete, so no log ends on a half-written cycle.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::connection::ConnectionManager;
use crate::protocol::{ObdCommand, DEFAULT_RESPONSE_DELAY};
use crate::storage::SessionLog;

/// Default number of cycles for a fixed-count run.
pub const DEFAULT_SAMPLE_COUNT: u32 = 1000;

/// Default cycle cadence for continuous runs.
pub const DEFAULT_CADENCE: Duration = Duration::from_millis(1000);

/// How a sampling run decides it is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleMode {
    /// Run exactly this many cycles, flat out.
    FixedCount(u32),
    /// Run until stopped, one cycle per cadence tick.
    Continuous,
}

/// Sampling run configuration.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Commands issued in order, once each per cycle.
    pub commands: Vec<ObdCommand>,
    /// Termination policy.
    pub mode: SampleMode,
    /// Cycle period in continuous mode.
    pub cadence: Duration,
    /// Optional settle delay between request and framed read.
    pub response_delay: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            commands: vec![ObdCommand::EngineRpm, ObdCommand::VehicleSpeed],
            mode: SampleMode::FixedCount(DEFAULT_SAMPLE_COUNT),
            cadence: DEFAULT_CADENCE,
            response_delay: DEFAULT_RESPONSE_DELAY,
        }
    }
}

/// Summary of a finished sampling run.
#[derive(Debug, Serialize, Deserialize)]
pub struct SamplerReport {
    /// Completed cycles.
    pub cycles: u32,
    /// Persisted samples across all signals.
    pub samples: usize,
    /// Mean wall time of one full cycle.
    pub mean_cycle_latency: Option<Duration>,
    /// One log file per sampled signal, in command order.
    pub signal_paths: Vec<PathBuf>,
    /// The per-cycle latency log.
    pub latency_path: PathBuf,
}

/// Handle to a running sampler worker.
pub struct SamplerHandle {
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<io::Result<SamplerReport>>>,
}

impl SamplerHandle {
    /// Ask the worker to stop after the cycle currently in flight.
    pub fn request_stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Whether the worker has already exited.
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map(|w| w.is_finished()).unwrap_or(true)
    }

    /// Wait for the run to end and collect its report.
    pub fn join(mut self) -> io::Result<SamplerReport> {
        match self.worker.take() {
            Some(worker) => worker
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("sampler worker panicked"))),
            None => Err(io::Error::other("sampler already joined")),
        }
    }

    /// Request a stop and wait for the report.
    pub fn stop(self) -> io::Result<SamplerReport> {
        self.request_stop();
        self.join()
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Start a sampling run over `conn`, writing session files under
/// `output_dir`.
pub fn start(
    conn: Arc<ConnectionManager>,
    output_dir: impl Into<PathBuf>,
    config: SamplerConfig,
) -> SamplerHandle {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    let dir = output_dir.into();
    let worker = std::thread::spawn(move || run(conn, dir, config, flag));
    SamplerHandle {
        cancel,
        worker: Some(worker),
    }
}

fn run(
    conn: Arc<ConnectionManager>,
    dir: PathBuf,
    config: SamplerConfig,
    cancel: Arc<AtomicBool>,
) -> io::Result<SamplerReport> {
    tracing::info!(mode = ?config.mode, commands = config.commands.len(), "sampling started");

    let mut signal_logs: Vec<SessionLog> = config
        .commands
        .iter()
        .map(|c| SessionLog::new(&dir, &c.name().replace(' ', "_")))
        .collect();
    let mut cycle_log = SessionLog::new(&dir, "latency");
    for log in &signal_logs {
        log.begin()?;
    }
    cycle_log.begin()?;

    let mut cycles: u32 = 0;
    let mut samples: usize = 0;

    'sampling: loop {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        if let SampleMode::FixedCount(count) = config.mode {
            if cycles >= count {
                break;
            }
        }

        let cycle_started = Instant::now();
        for (command, log) in config.commands.iter().zip(signal_logs.iter_mut()) {
            match command.run(&conn, config.response_delay) {
                Ok(invocation) => {
                    log.record(&invocation.formatted_result(), invocation.elapsed())?;
                    samples += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "sampling aborted");
                    break 'sampling;
                }
            }
        }
        let elapsed = cycle_started.elapsed();
        cycle_log.record(&format!("{:.1} ms", elapsed.as_secs_f64() * 1000.0), elapsed)?;
        cycles += 1;

        if config.mode == SampleMode::Continuous {
            // sleep in short steps so a stop request is honored promptly,
            // without ever interrupting a cycle in flight
            let mut slept = Duration::ZERO;
            while slept < config.cadence && !cancel.load(Ordering::SeqCst) {
                let step = (config.cadence - slept).min(Duration::from_millis(10));
                std::thread::sleep(step);
                slept += step;
            }
        }
    }

    // written exactly once per file, whatever ended the run
    for log in &signal_logs {
        log.finish()?;
    }
    cycle_log.finish()?;

    let report = SamplerReport {
        cycles,
        samples,
        mean_cycle_latency: cycle_log.mean_latency(),
        signal_paths: signal_logs.iter().map(|l| l.path().to_path_buf()).collect(),
        latency_path: cycle_log.path().to_path_buf(),
    };
    tracing::info!(cycles = report.cycles, samples = report.samples, "sampling finished");
    Ok(report)
}
