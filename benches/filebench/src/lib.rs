use std::path::Path;

use common::{
    bench::{Bench, MetricKind, translate_from},
    error::BenchError,
    metrics::{MetricRecord, MetricValue},
    util::{Cmd, CommandOutput},
};
use tracing::debug;

use crate::result::{OpStat, parse_output};

pub mod result;

const FLOWOPS: &str = "flowops";

const DEFAULT_FORMAT: [&str; 11] = [
    "workload",
    "device",
    "scheduler",
    "io-total-ops",
    "io-ops-per-sec",
    "io-read-ops-per-sec",
    "io-write-ops-per-sec",
    "io-mb-per-sec",
    "io-cpu-per-op",
    "io-latency",
    FLOWOPS,
];

const ABBREVIATIONS: [(&str, &str); 8] = [
    ("ito", "io-total-ops"),
    ("ios", "io-ops-per-sec"),
    ("irs", "io-read-ops-per-sec"),
    ("iws", "io-write-ops-per-sec"),
    ("imb", "io-mb-per-sec"),
    ("icp", "io-cpu-per-op"),
    ("ila", "io-latency"),
    ("fo", FLOWOPS),
];

/// filebench run on a workload model file, results read from its console log.
#[derive(Debug, Default, Clone, Copy)]
pub struct Filebench;

impl Bench for Filebench {
    fn name(&self) -> &'static str {
        "filebench"
    }

    fn default_format(&self) -> &'static [&'static str] {
        &DEFAULT_FORMAT
    }

    fn translate(&self, token: &str) -> Option<(String, MetricKind)> {
        translate_from(token, &ABBREVIATIONS, &DEFAULT_FORMAT[3..10], &[FLOWOPS])
    }

    fn cmd(&self, workload_file: &Path) -> Cmd {
        Cmd::new("filebench", ["-f".to_owned(), workload_file.display().to_string()])
    }

    fn extract(&self, output: &CommandOutput) -> Result<MetricRecord, BenchError> {
        let parsed = parse_output(&output.stdout)?;
        debug!(
            "filebench reported {} flow operations",
            parsed.ops_stats.len()
        );

        let summary = &parsed.summary;
        let mut record = MetricRecord::default();
        record.insert("io-total-ops", summary.total_ops);
        record.insert("io-ops-per-sec", summary.ops_per_sec);
        record.insert("io-read-ops-per-sec", summary.read_ops_per_sec);
        record.insert("io-write-ops-per-sec", summary.write_ops_per_sec);
        record.insert("io-mb-per-sec", summary.mb_per_sec);
        record.insert("io-cpu-per-op", summary.cpu_per_op_us);
        record.insert("io-latency", summary.latency_ms);

        if !parsed.ops_stats.is_empty() {
            record.insert_group(
                FLOWOPS,
                parsed.ops_stats.iter().flat_map(flowop_columns).collect(),
            );
        }
        Ok(record)
    }
}

fn flowop_columns(op: &OpStat) -> Vec<(String, MetricValue)> {
    [
        ("ops", MetricValue::from(op.ops)),
        ("ops-per-sec", op.ops_per_sec.into()),
        ("mb-per-sec", op.mb_per_sec.into()),
        ("ms-per-op", op.ms_per_op.into()),
        ("us-per-op-cpu", op.us_per_op_cpu.into()),
        ("latency-min", op.latency_min_ms.into()),
        ("latency-max", op.latency_max_ms.into()),
    ]
    .into_iter()
    .map(|(stat, value)| (format!("flowop-{}-{stat}", op.name), value))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::tests::OUTPUT;

    fn extract(stdout: &str) -> Result<MetricRecord, BenchError> {
        Filebench.extract(&CommandOutput {
            stdout: stdout.to_owned(),
            stderr: String::new(),
        })
    }

    #[test]
    fn extracts_summary() {
        let record = extract(OUTPUT).unwrap();
        assert_eq!(record.get("io-total-ops"), Some(&MetricValue::Int(287704)));
        assert_eq!(record.get("io-read-ops-per-sec"), Some(&MetricValue::Float(1547.0)));
        assert_eq!(record.get("io-latency"), Some(&MetricValue::Float(0.3)));
    }

    #[test]
    fn flowops_keep_tool_order() {
        let record = extract(OUTPUT).unwrap();
        let group = record.group(FLOWOPS).unwrap();
        assert_eq!(group.len(), 21);
        assert_eq!(group[0].0, "flowop-appendlog-ops");
        assert_eq!(group[0].1, MetricValue::Int(8994));
        assert_eq!(group[6].0, "flowop-appendlog-latency-max");
        assert_eq!(group[7].0, "flowop-closefile10-ops");
        assert_eq!(group[20].0, "flowop-readfile10-latency-max");
        assert_eq!(group[20].1, MetricValue::Float(11.202));
    }

    #[test]
    fn summary_without_breakdown_has_no_group() {
        let record = extract("5.0: IO Summary: 10 ops, 2.0 ops/s, (1/1 r/w), 0.1mb/s, 10us cpu/op, 1.0ms latency\n").unwrap();
        assert!(record.group(FLOWOPS).is_none());
        assert_eq!(record.get("io-total-ops"), Some(&MetricValue::Int(10)));
    }

    #[test]
    fn translates_formats() {
        assert_eq!(
            Filebench.translate("fo"),
            Some((FLOWOPS.to_owned(), MetricKind::Group))
        );
        assert_eq!(
            Filebench.translate("imb"),
            Some(("io-mb-per-sec".to_owned(), MetricKind::Scalar))
        );
        assert_eq!(Filebench.translate("bw-read"), None);
    }

    #[test]
    fn runs_model_file() {
        assert_eq!(
            Filebench.cmd(Path::new("webserver.f")).to_string(),
            "filebench -f webserver.f"
        );
    }
}
