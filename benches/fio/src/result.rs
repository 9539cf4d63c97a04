use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The parts of `fio --output-format=json` that end up in a row. Everything is
/// optional so an absent field surfaces as a missing metric instead of a parse
/// failure.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FioResult {
    #[serde(rename = "fio version")]
    pub fio_version: Option<String>,
    pub timestamp: Option<i64>,
    pub jobs: Vec<Job>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub jobname: Option<String>,
    pub error: Option<i64>,
    pub job_runtime: Option<i64>,
    pub read: Option<Direction>,
    pub write: Option<Direction>,
}

/// Statistics of one data direction of a job.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Direction {
    pub io_kbytes: Option<i64>,
    pub bw: Option<i64>,
    pub iops: Option<f64>,
    pub runtime: Option<i64>,
    pub total_ios: Option<i64>,
    pub slat_ns: Option<LatNs>,
    pub clat_ns: Option<LatNs>,
    pub lat_ns: Option<LatNs>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatNs {
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub mean: Option<f64>,
    pub stddev: Option<f64>,
    #[serde(rename = "N")]
    pub n: Option<i64>,
    /// Keyed by fio's formatted percentile, e.g. `"99.900000"`.
    pub percentile: Option<HashMap<String, i64>>,
}

impl LatNs {
    /// Percentiles in ascending order.
    pub fn sorted_percentiles(&self) -> Vec<(&str, i64)> {
        let mut items = self
            .percentile
            .iter()
            .flatten()
            .map(|(k, v)| (k.as_str(), *v))
            .collect::<Vec<_>>();
        items.sort_by(|(a, _), (b, _)| {
            let a = a.parse::<f64>().unwrap_or(f64::MAX);
            let b = b.parse::<f64>().unwrap_or(f64::MAX);
            a.total_cmp(&b)
        });
        items
    }
}
