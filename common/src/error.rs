use std::path::PathBuf;

use thiserror::Error;

use crate::util::CommandError;

/// Every failure the pipeline can produce. Which variant is raised decides how
/// far the failure propagates: `Config` and `Template` abort the whole input
/// file before any run, the rest are scoped to a single run.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("template marker <%{marker}%> in {} is not declared", .file.display())]
    Template { file: PathBuf, marker: String },
    #[error("workload execution failed: {0}")]
    Execution(#[from] CommandError),
    #[error("metric {0} missing from workload output")]
    MissingMetric(String),
    #[error("unable to parse {what}: {reason}")]
    Parse { what: String, reason: String },
    #[error("device {device}: {reason}")]
    Device { device: String, reason: String },
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BenchError {
    pub fn config(reason: impl Into<String>) -> Self {
        BenchError::Config(reason.into())
    }

    pub fn parse(what: impl Into<String>, reason: impl ToString) -> Self {
        BenchError::Parse {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    pub fn device(device: &str, reason: impl ToString) -> Self {
        BenchError::Device {
            device: device.to_owned(),
            reason: reason.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BenchError::Io {
            path: path.into(),
            source,
        }
    }

    /// Only execution failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BenchError::Execution(_))
    }
}
