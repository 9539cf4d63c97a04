use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    bench::{Bench, MetricKind},
    config::{Config, EnvironmentSetting},
    error::BenchError,
    metrics::{MetricRecord, MetricValue},
    template::ParameterSet,
    trace::TRACE_COLUMNS,
};

/// Last column of every header and every row.
pub const TERMINAL_COLUMN: &str = "END";
pub const ENVIRONMENT_COLUMN: &str = "nomerges";

#[derive(Debug, Clone, PartialEq)]
enum Column {
    Workload,
    Device,
    Scheduler,
    Metric(String),
    Group(String),
    Template(String),
    Environment,
    Trace(&'static str),
    End,
}

fn universal(token: &str) -> Option<Column> {
    match token {
        "w" | "workload" => Some(Column::Workload),
        "d" | "device" => Some(Column::Device),
        "s" | "scheduler" => Some(Column::Scheduler),
        _ => None,
    }
}

/// Identity of the run a row belongs to.
#[derive(Debug, Clone, Copy)]
pub struct RowContext<'a> {
    pub workload: &'a str,
    pub device: &'a str,
    pub scheduler: &'a str,
    pub params: &'a ParameterSet,
    pub env: EnvironmentSetting,
    pub traced: bool,
}

/// Ordered columns of one output file.
///
/// The static part is fixed by [`OutputSchema::resolve`]. Group columns get
/// their labels from the first record that is projected successfully and keep
/// them for the rest of the file.
#[derive(Debug, Clone)]
pub struct OutputSchema {
    columns: Vec<Column>,
    labels: HashMap<String, Vec<String>>,
}

impl OutputSchema {
    pub fn resolve(config: &Config, bench: &dyn Bench) -> Result<Self, BenchError> {
        let tokens = match &config.output.format {
            Some(format) if !format.is_empty() => format.0.clone(),
            _ => bench.default_format().iter().map(|x| x.to_string()).collect(),
        };

        let mut columns = Vec::with_capacity(tokens.len() + 1);
        for token in &tokens {
            let column = match universal(token) {
                Some(column) => column,
                None => match bench.translate(token) {
                    Some((name, MetricKind::Scalar)) => Column::Metric(name),
                    Some((name, MetricKind::Group))
                        if !bench.group_enabled(&name, &config.output) =>
                    {
                        debug!("{name} is switched off, no columns");
                        continue;
                    }
                    Some((name, MetricKind::Group)) => Column::Group(name),
                    None => {
                        return Err(BenchError::config(format!(
                            "unknown {} output format entry {token}",
                            bench.name()
                        )));
                    }
                },
            };
            columns.push(column);
        }

        if config.output.append_template && config.template.enabled {
            columns.extend(config.template.settings.keys().cloned().map(Column::Template));
        }
        if config.output.append_environment && config.environment.enabled {
            columns.push(Column::Environment);
        }
        if config.output.append_blktrace {
            columns.extend(TRACE_COLUMNS.into_iter().map(Column::Trace));
        }
        columns.push(Column::End);

        debug!("Resolved {} columns from {tokens:?}", columns.len());
        Ok(Self {
            columns,
            labels: HashMap::new(),
        })
    }

    /// Column names, available once every group has been fixed.
    pub fn header(&self) -> Option<Vec<String>> {
        let mut header = Vec::new();
        for column in &self.columns {
            match column {
                Column::Workload => header.push("workload".to_owned()),
                Column::Device => header.push("device".to_owned()),
                Column::Scheduler => header.push("scheduler".to_owned()),
                Column::Metric(name) | Column::Template(name) => header.push(name.clone()),
                Column::Group(name) => header.extend(self.labels.get(name)?.iter().cloned()),
                Column::Environment => header.push(ENVIRONMENT_COLUMN.to_owned()),
                Column::Trace(name) => header.push(name.to_string()),
                Column::End => header.push(TERMINAL_COLUMN.to_owned()),
            }
        }
        Some(header)
    }

    /// Turns one run's record into a row in column order.
    pub fn project(
        &mut self,
        record: &MetricRecord,
        ctx: &RowContext,
        ignore_missing: bool,
    ) -> Result<Vec<MetricValue>, BenchError> {
        let missing = |name: &str| match ignore_missing {
            true => Ok(MetricValue::None),
            false => Err(BenchError::MissingMetric(name.to_owned())),
        };

        let mut fixed: HashMap<String, Vec<String>> = HashMap::new();
        let mut row: Vec<MetricValue> = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            match column {
                Column::Workload => row.push(ctx.workload.into()),
                Column::Device => row.push(ctx.device.into()),
                Column::Scheduler => row.push(ctx.scheduler.into()),
                Column::Metric(name) => row.push(match record.get(name) {
                    Some(value) => value.clone(),
                    None => missing(name)?,
                }),
                Column::Group(name) => {
                    let known = self.labels.get(name).or_else(|| fixed.get(name)).cloned();
                    match (record.group(name), known) {
                        (Some(columns), Some(labels))
                            if columns.is_empty() && !labels.is_empty() =>
                        {
                            row.extend(labels.iter().map(|_| MetricValue::None));
                        }
                        (Some(columns), Some(labels)) => {
                            let found = columns.iter().map(|(label, _)| label);
                            if !found.eq(labels.iter()) {
                                return Err(BenchError::parse(
                                    name.as_str(),
                                    format!(
                                        "reported columns {:?} differ from {labels:?}",
                                        columns.iter().map(|(l, _)| l).collect::<Vec<_>>()
                                    ),
                                ));
                            }
                            row.extend(columns.iter().map(|(_, value)| value.clone()));
                        }
                        (Some(columns), None) => {
                            fixed.insert(
                                name.clone(),
                                columns.iter().map(|(label, _)| label.clone()).collect(),
                            );
                            row.extend(columns.iter().map(|(_, value)| value.clone()));
                        }
                        (None, Some(labels)) => {
                            let value = missing(name)?;
                            row.extend(labels.iter().map(|_| value.clone()));
                        }
                        (None, None) => {
                            missing(name)?;
                            fixed.insert(name.clone(), Vec::new());
                        }
                    }
                }
                Column::Template(key) => row.push(
                    ctx.params
                        .get(key)
                        .map(MetricValue::from)
                        .unwrap_or(MetricValue::None),
                ),
                Column::Environment => row.push(
                    ctx.env
                        .nomerges
                        .map(|n| MetricValue::Int(n.into()))
                        .unwrap_or(MetricValue::None),
                ),
                Column::Trace(name) => row.push(match (ctx.traced, record.get(name)) {
                    (false, _) => MetricValue::None,
                    (true, Some(value)) => value.clone(),
                    (true, None) => missing(name)?,
                }),
                Column::End => row.push(TERMINAL_COLUMN.into()),
            }
        }

        self.labels.extend(fixed);
        Ok(row)
    }
}

/// `<output_dir>/<input stem>.csv`
pub fn output_path(input: &Path, output_dir: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|x| x.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_owned());
    output_dir.join(format!("{stem}.csv"))
}

/// CSV file of one input. Created with its header in front of the first row,
/// every row is flushed as soon as it is written.
pub struct CsvOutput {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
}

impl CsvOutput {
    pub fn new(path: PathBuf) -> Self {
        Self { path, writer: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_row(&mut self, schema: &OutputSchema, row: &[MetricValue]) -> Result<(), BenchError> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => {
                let header = schema
                    .header()
                    .ok_or_else(|| BenchError::parse("output schema", "columns not fixed yet"))?;
                let mut writer =
                    csv::Writer::from_path(&self.path).map_err(|err| self.csv_error(err))?;
                writer
                    .write_record(&header)
                    .map_err(|err| self.csv_error(err))?;
                debug!("Created {}", self.path.display());
                writer
            }
        };
        let writer = self.writer.insert(writer);
        writer
            .write_record(row.iter().map(|x| x.to_string()))
            .map_err(|err| BenchError::io(&self.path, err.into()))?;
        writer
            .flush()
            .map_err(|err| BenchError::io(&self.path, err))?;
        Ok(())
    }

    fn csv_error(&self, err: csv::Error) -> BenchError {
        BenchError::io(&self.path, err.into())
    }
}
