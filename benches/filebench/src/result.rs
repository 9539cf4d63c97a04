use common::error::BenchError;
use serde::{Deserialize, Serialize};

/// One row of the "Per-Operation Breakdown" table.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpStat {
    pub name: String,
    pub ops: u64,
    pub ops_per_sec: f64,
    pub mb_per_sec: f64,
    pub ms_per_op: f64,
    pub us_per_op_cpu: f64,
    pub latency_min_ms: f64,
    pub latency_max_ms: f64,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoSummary {
    pub total_ops: u64,
    pub ops_per_sec: f64,
    pub read_ops_per_sec: f64,
    pub write_ops_per_sec: f64,
    pub mb_per_sec: f64,
    pub cpu_per_op_us: f64,
    pub latency_ms: f64,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilebenchSummary {
    pub summary: IoSummary,
    pub ops_stats: Vec<OpStat>,
}

impl OpStat {
    /// `readfile1  3020ops  302ops/s  37.8mb/s  0.4ms/op  [0.01ms - 9.12ms]`
    pub fn from_line(line: &str) -> Option<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 9 {
            return None;
        }

        let number = |token: &str, unit: &str| token.strip_suffix(unit)?.parse::<f64>().ok();

        Some(Self {
            name: tokens[0].to_string(),
            ops: tokens[1].strip_suffix("ops")?.parse().ok()?,
            ops_per_sec: number(tokens[2], "ops/s")?,
            mb_per_sec: number(tokens[3], "mb/s")?,
            ms_per_op: number(tokens[4], "ms/op")?,
            us_per_op_cpu: number(tokens[5], "us/op-cpu")?,
            latency_min_ms: number(tokens[6].strip_prefix('[')?, "ms")?,
            latency_max_ms: number(tokens[8].strip_suffix(']')?, "ms")?,
        })
    }
}

fn first(part: &str) -> Option<&str> {
    part.split_whitespace().next()
}

impl IoSummary {
    /// `IO Summary: 90125 ops, 9011.3 ops/s, (4506/4505 r/w), 105.6mb/s, 212us cpu/op, 0.2ms latency`
    pub fn from_line(line: &str) -> Option<Self> {
        let line = line.strip_prefix("IO Summary:")?.trim();
        let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if parts.len() != 6 {
            return None;
        }

        let rw_part = parts[2].trim_matches(|c| c == '(' || c == ')');
        let (read, write) = first(rw_part)?.split_once('/')?;

        Some(Self {
            total_ops: first(parts[0])?.parse().ok()?,
            ops_per_sec: first(parts[1])?.parse().ok()?,
            read_ops_per_sec: read.parse().ok()?,
            write_ops_per_sec: write.parse().ok()?,
            mb_per_sec: parts[3].split_once("mb/s")?.0.trim().parse().ok()?,
            cpu_per_op_us: first(parts[4])?.trim_end_matches("us").parse().ok()?,
            latency_ms: first(parts[5])?.trim_end_matches("ms").parse().ok()?,
        })
    }
}

/// Text of a log line after its `time:` (or `pid: time:`) prefix.
fn message(line: &str) -> Option<&str> {
    let mut rest = line.trim_start();
    let mut prefixed = false;
    while let Some((head, tail)) = rest.split_once(':') {
        let head = head.trim();
        if head.is_empty() || !head.chars().all(|c| c.is_ascii_digit() || c == '.') {
            break;
        }
        rest = tail.trim_start();
        prefixed = true;
    }
    prefixed.then(|| rest.trim())
}

/// Reads filebench's console log. Regular lines carry a timestamp prefix, the
/// operation table that follows "Per-Operation Breakdown" does not.
pub fn parse_output(output: &str) -> Result<FilebenchSummary, BenchError> {
    let mut parsing_ops = false;
    let mut ops_stats = Vec::new();
    let mut io_summary = None;
    for line in output.lines() {
        if parsing_ops {
            if let Some(op_stat) = OpStat::from_line(line.trim()) {
                ops_stats.push(op_stat);
                continue;
            }
            parsing_ops = false;
        }

        let Some(content) = message(line) else {
            continue;
        };
        if content.starts_with("Per-Operation Breakdown") {
            parsing_ops = true;
        } else if content.starts_with("IO Summary:") {
            io_summary = Some(
                IoSummary::from_line(content)
                    .ok_or_else(|| BenchError::parse("filebench IO Summary", content))?,
            );
        }
    }

    let summary =
        io_summary.ok_or_else(|| BenchError::parse("filebench output", "no IO Summary line"))?;
    Ok(FilebenchSummary { summary, ops_stats })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const OUTPUT: &str = "\
Filebench Version 1.5-alpha3
0.000: Allocated 177MB of shared memory
0.004: Web-server Version 3.1 personality successfully loaded
0.004: Populating and pre-allocating filesets
1.212: Running...
61.224: Run took 60 seconds...
61.226: Per-Operation Breakdown
appendlog            8994ops      150ops/s   1.2mb/s      3.1ms/op      24us/op-cpu [0.002ms - 201.011ms]
closefile10          8991ops      150ops/s   0.0mb/s      0.0ms/op       3us/op-cpu [0.001ms - 0.067ms]
readfile10           8991ops      150ops/s   2.2mb/s      0.1ms/op      19us/op-cpu [0.003ms - 11.202ms]
61.226: IO Summary: 287704 ops, 4794.679 ops/s, (1547/150 r/w),  25.4mb/s,    133us cpu/op,   0.3ms latency
61.226: Shutting down processes
";

    #[test]
    fn parses_summary_and_breakdown() {
        let parsed = parse_output(OUTPUT).unwrap();
        assert_eq!(
            parsed.summary,
            IoSummary {
                total_ops: 287704,
                ops_per_sec: 4794.679,
                read_ops_per_sec: 1547.0,
                write_ops_per_sec: 150.0,
                mb_per_sec: 25.4,
                cpu_per_op_us: 133.0,
                latency_ms: 0.3,
            }
        );
        assert_eq!(
            parsed.ops_stats.iter().map(|x| x.name.as_str()).collect::<Vec<_>>(),
            vec!["appendlog", "closefile10", "readfile10"]
        );
        assert_eq!(parsed.ops_stats[0].ops, 8994);
        assert_eq!(parsed.ops_stats[0].latency_max_ms, 201.011);
        assert_eq!(parsed.ops_stats[2].us_per_op_cpu, 19.0);
    }

    #[test]
    fn missing_summary_is_a_parse_error() {
        let truncated = OUTPUT
            .lines()
            .filter(|x| !x.contains("IO Summary"))
            .collect::<Vec<_>>()
            .join("\n");
        assert!(matches!(parse_output(&truncated), Err(BenchError::Parse { .. })));
    }

    #[test]
    fn malformed_summary_is_a_parse_error() {
        let broken = "1.0: IO Summary: lots of ops\n";
        assert!(matches!(parse_output(broken), Err(BenchError::Parse { .. })));
    }

    #[test]
    fn strips_log_prefixes() {
        assert_eq!(message("61.226: IO Summary: 1 ops"), Some("IO Summary: 1 ops"));
        assert_eq!(message("  4321: 1.5: Running..."), Some("Running..."));
        assert_eq!(message("Filebench Version 1.5-alpha3"), None);
    }

    #[test]
    fn rejects_short_op_lines() {
        assert!(OpStat::from_line("readfile10 8991ops 150ops/s").is_none());
    }
}
