use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use regex::Regex;
use tokio::{
    fs::{create_dir_all, remove_dir_all},
    process::{Child, Command},
};
use tracing::{debug, warn};

use crate::{
    error::BenchError,
    metrics::MetricRecord,
    util::{CommandError, simple_command_with_output_in_dir},
};

/// Columns added by `append_blktrace`, in output order.
pub const TRACE_COLUMNS: [&str; 8] = [
    "d2c-min", "d2c-avg", "d2c-max", "d2c-count", "q2c-min", "q2c-avg", "q2c-max", "q2c-count",
];

const TRACE_PREFIX: &str = "trace";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyStats {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
    pub count: u64,
}

/// Device-to-completion and queue-to-completion timings reported by `btt`,
/// in seconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceStats {
    pub d2c: Option<LatencyStats>,
    pub q2c: Option<LatencyStats>,
}

impl TraceStats {
    pub fn add_to(&self, record: &mut MetricRecord) {
        for (prefix, stats) in [("d2c", self.d2c), ("q2c", self.q2c)] {
            if let Some(stats) = stats {
                record.insert(format!("{prefix}-min"), stats.min);
                record.insert(format!("{prefix}-avg"), stats.avg);
                record.insert(format!("{prefix}-max"), stats.max);
                record.insert(format!("{prefix}-count"), stats.count);
            }
        }
    }
}

/// Parses the first `D2C`/`Q2C` rows of a btt report, which belong to the
/// "All Devices" table.
pub fn parse_btt(output: &str) -> Result<TraceStats, BenchError> {
    let row = Regex::new(r"(?m)^\s*(D2C|Q2C)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\d+)\s*$")
        .map_err(|err| BenchError::parse("btt pattern", err))?;
    let mut stats = TraceStats::default();
    for caps in row.captures_iter(output) {
        let number = |i: usize| {
            caps[i]
                .parse::<f64>()
                .map_err(|err| BenchError::parse(format!("btt {}", &caps[1]), err))
        };
        let parsed = LatencyStats {
            min: number(2)?,
            avg: number(3)?,
            max: number(4)?,
            count: caps[5]
                .parse()
                .map_err(|err| BenchError::parse(format!("btt {}", &caps[1]), err))?,
        };
        let slot = match &caps[1] {
            "D2C" => &mut stats.d2c,
            _ => &mut stats.q2c,
        };
        if slot.is_none() {
            *slot = Some(parsed);
        }
    }
    Ok(stats)
}

/// Starts trace capture for one run.
#[async_trait]
pub trait Tracer: Send + Sync {
    async fn start(&self, device: &str, dir: &Path) -> Result<Box<dyn TraceSession>, BenchError>;
}

#[async_trait]
pub trait TraceSession: Send {
    /// Stops capture and turns what was collected into stats.
    async fn finish(self: Box<Self>) -> Result<TraceStats, BenchError>;
}

/// blktrace for capture, blkparse + btt for the latency breakdown.
#[derive(Debug, Clone, Default)]
pub struct Blktrace {
    pub keep_files: bool,
}

struct BlktraceSession {
    child: Child,
    dir: PathBuf,
    keep_files: bool,
}

#[async_trait]
impl Tracer for Blktrace {
    async fn start(&self, device: &str, dir: &Path) -> Result<Box<dyn TraceSession>, BenchError> {
        create_dir_all(dir)
            .await
            .map_err(|err| BenchError::io(dir, err))?;
        let child = Command::new("blktrace")
            .args(["-d", device, "-o", TRACE_PREFIX])
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: "blktrace".to_owned(),
                source,
            })?;
        debug!("Started blktrace on {device} in {}", dir.display());
        Ok(Box::new(BlktraceSession {
            child,
            dir: dir.to_owned(),
            keep_files: self.keep_files,
        }))
    }
}

impl BlktraceSession {
    async fn stop_capture(&mut self) -> Result<(), BenchError> {
        if let Some(id) = self.child.id() {
            let pid = Pid::from_raw(id as i32);
            if let Err(err) = kill(pid, Signal::SIGINT) {
                warn!("Could not interrupt blktrace: {err}");
                self.child
                    .kill()
                    .await
                    .map_err(|err| BenchError::io(&self.dir, err))?;
            }
        }
        self.child
            .wait()
            .await
            .map_err(|err| BenchError::io(&self.dir, err))?;
        Ok(())
    }

    async fn analyze(&self) -> Result<TraceStats, BenchError> {
        let parsed = format!("{TRACE_PREFIX}.blkparse.bin");
        simple_command_with_output_in_dir("blkparse", &["-i", TRACE_PREFIX, "-d", &parsed], &self.dir)
            .await?;
        let report = simple_command_with_output_in_dir("btt", &["-i", &parsed], &self.dir).await?;
        parse_btt(&report)
    }
}

#[async_trait]
impl TraceSession for BlktraceSession {
    async fn finish(self: Box<Self>) -> Result<TraceStats, BenchError> {
        let mut session = *self;
        let result = match session.stop_capture().await {
            Ok(()) => session.analyze().await,
            Err(err) => Err(err),
        };
        if !session.keep_files {
            if let Err(err) = remove_dir_all(&session.dir).await {
                warn!("Could not remove {}: {err}", session.dir.display());
            }
        }
        result
    }
}
