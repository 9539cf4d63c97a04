use std::{fmt::Debug, path::Path};

use crate::{
    config::Output,
    error::BenchError,
    metrics::MetricRecord,
    util::{Cmd, CommandOutput},
};

/// How a format token expands into columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Exactly one column.
    Scalar,
    /// A variable set of columns whose labels come from the first run.
    Group,
}

/// A workload type: how to invoke its tool and how to read what it printed.
pub trait Bench: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Columns written when the config has no `output.format`.
    fn default_format(&self) -> &'static [&'static str];

    /// Resolves a format token, either a full metric name or one of the
    /// tool's abbreviations.
    fn translate(&self, token: &str) -> Option<(String, MetricKind)>;

    /// Whether a group named in the format produces columns under these
    /// output settings. A disabled group contributes zero columns.
    fn group_enabled(&self, _group: &str, _output: &Output) -> bool {
        true
    }

    fn cmd(&self, workload_file: &Path) -> Cmd;

    fn extract(&self, output: &CommandOutput) -> Result<MetricRecord, BenchError>;
}

/// Shared lookup for benches that describe their metrics with tables of
/// `(abbreviation, name)` pairs.
pub fn translate_from(
    token: &str,
    abbreviations: &[(&str, &str)],
    scalars: &[&str],
    groups: &[&str],
) -> Option<(String, MetricKind)> {
    let name = abbreviations
        .iter()
        .find(|(abbr, _)| *abbr == token)
        .map(|(_, name)| *name)
        .unwrap_or(token);
    if groups.contains(&name) {
        Some((name.to_owned(), MetricKind::Group))
    } else if scalars.contains(&name) {
        Some((name.to_owned(), MetricKind::Scalar))
    } else {
        None
    }
}
