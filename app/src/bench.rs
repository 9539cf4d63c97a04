use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Args;
use common::{
    bench::Bench,
    config::{Config, EnvironmentSetting, WorkloadType},
    device::{DeviceBackend, DeviceLease, DeviceState, SysfsBackend, check_devices},
    error::BenchError,
    metrics::{MetricRecord, MetricValue, aggregate},
    output::{CsvOutput, OutputSchema, RowContext, output_path},
    template::{Bindings, ParameterSet, TemplateFile, check_markers, parameter_sets},
    trace::{Blktrace, Tracer},
    util::{CommandRunner, SystemRunner, device_name},
};
use filebench::Filebench;
use fio::Fio;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::fs::create_dir_all;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Args)]
pub struct ExecuteOptions {
    /// Directory the CSV files are written to
    #[arg(short, long, default_value = ".")]
    pub output_directory: PathBuf,
    /// Attempts per run before it counts as failed
    #[arg(short, long, default_value_t = 1)]
    pub retry_count: usize,
    /// Keep going after a failed run or input file
    #[arg(short, long, default_value_t = false)]
    pub continue_on_failure: bool,
    /// Put every device back the way it was once an input file is done
    #[arg(long, default_value_t = false)]
    pub reset_device: bool,
    /// Keep interpolated workload files and trace artifacts
    #[arg(long, default_value_t = false)]
    pub keep_files: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            output_directory: PathBuf::from("."),
            retry_count: 1,
            continue_on_failure: false,
            reset_device: false,
            keep_files: false,
        }
    }
}

/// The outside world a sweep talks to.
pub struct Harness {
    pub runner: Box<dyn CommandRunner>,
    pub devices: Box<dyn DeviceBackend>,
    pub tracer: Box<dyn Tracer>,
}

impl Harness {
    pub fn system(keep_files: bool) -> Self {
        Self {
            runner: Box::new(SystemRunner),
            devices: Box::new(SysfsBackend::default()),
            tracer: Box::new(Blktrace { keep_files }),
        }
    }
}

#[derive(Debug, Default)]
pub struct FileReport {
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    pub rows: usize,
    pub failed_runs: usize,
    pub error: Option<String>,
}

impl FileReport {
    pub fn succeeded(&self) -> bool {
        self.failed_runs == 0 && self.error.is_none()
    }
}

pub fn bench_for(workload_type: WorkloadType) -> Box<dyn Bench> {
    match workload_type {
        WorkloadType::Fio => Box::new(Fio),
        WorkloadType::Filebench => Box::new(Filebench),
    }
}

/// An input file that passed every check that can run before the first run.
pub struct Prepared {
    pub config: Config,
    pub bench: Box<dyn Bench>,
    pub schema: OutputSchema,
}

pub async fn prepare(input: &Path, devices: &dyn DeviceBackend) -> Result<Prepared, BenchError> {
    let config = Config::load(input).await?;
    config.validate()?;
    let bench = bench_for(config.global.workload_type);
    let schema = OutputSchema::resolve(&config, bench.as_ref())?;
    check_devices(devices, &config.global.devices, &config.global.schedulers).await?;
    if config.template.enabled {
        let declared = config.template.settings.keys().collect::<Vec<_>>();
        for (_, workload) in config.workloads.iter() {
            check_markers(&workload.file, &declared).await?;
        }
    }
    Ok(Prepared {
        config,
        bench,
        schema,
    })
}

/// Identity of one execution.
struct Run<'a> {
    index: usize,
    workload: &'a str,
    file: &'a Path,
    traced: bool,
    device: &'a str,
    scheduler: &'a str,
    params: &'a ParameterSet,
    env: EnvironmentSetting,
    repetition: usize,
    repetitions: usize,
}

impl fmt::Display for Run<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "workload={} device={} scheduler={} params={} env={} repetition={}/{}",
            self.workload,
            self.device,
            self.scheduler,
            self.params,
            self.env,
            self.repetition + 1,
            self.repetitions
        )
    }
}

pub async fn execute(
    inputs: &[PathBuf],
    options: &ExecuteOptions,
    harness: &Harness,
    no_progress: bool,
) -> Vec<FileReport> {
    let mut reports = Vec::with_capacity(inputs.len());
    let mut outputs: HashMap<PathBuf, &Path> = HashMap::new();
    for input in inputs {
        let output = output_path(input, &options.output_directory);
        let report = match outputs.get(&output) {
            Some(first) => {
                let reason = format!(
                    "{} would overwrite {}, already written for {}",
                    input.display(),
                    output.display(),
                    first.display()
                );
                error!("{reason}");
                FileReport {
                    input: input.clone(),
                    error: Some(reason),
                    ..Default::default()
                }
            }
            None => {
                outputs.insert(output, input);
                execute_file(input, options, harness, no_progress).await
            }
        };
        let failed = !report.succeeded();
        reports.push(report);
        if failed && !options.continue_on_failure {
            warn!("Stopping after failure in {}", input.display());
            break;
        }
    }
    reports
}

pub async fn execute_file(
    input: &Path,
    options: &ExecuteOptions,
    harness: &Harness,
    no_progress: bool,
) -> FileReport {
    let mut report = FileReport {
        input: input.to_owned(),
        ..Default::default()
    };
    info!("Executing {}", input.display());

    let mut prepared = match prepare(input, harness.devices.as_ref()).await {
        Ok(prepared) => prepared,
        Err(err) => {
            error!("{}: {err}", input.display());
            report.error = Some(err.to_string());
            return report;
        }
    };

    let mut snapshots = Vec::new();
    if options.reset_device {
        for device in prepared.config.global.devices.iter() {
            let with_nomerges = prepared.config.environment.enabled;
            match DeviceState::capture(harness.devices.as_ref(), device, with_nomerges).await {
                Ok(state) => snapshots.push((device.clone(), state)),
                Err(err) => {
                    error!("{}: {err}", input.display());
                    report.error = Some(err.to_string());
                    return report;
                }
            }
        }
    }

    let result = sweep(input, &mut prepared, options, harness, no_progress, &mut report).await;

    for (device, state) in &snapshots {
        match state.apply(harness.devices.as_ref(), device).await {
            Ok(()) => debug!("Reset {device} to {state:?}"),
            Err(err) => {
                error!("Could not reset {device}: {err}");
                report.error.get_or_insert_with(|| err.to_string());
            }
        }
    }

    if let Err(err) = result {
        error!("{}: {err}", input.display());
        report.error = Some(err.to_string());
    }
    report
}

fn progress_bar(total: u64, no_progress: bool) -> ProgressBar {
    if no_progress {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} runs {msg}",
    )
    .map(|style| style.progress_chars("#>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}

async fn sweep(
    input: &Path,
    prepared: &mut Prepared,
    options: &ExecuteOptions,
    harness: &Harness,
    no_progress: bool,
    report: &mut FileReport,
) -> Result<(), BenchError> {
    let Prepared {
        config,
        bench,
        schema,
    } = prepared;
    let global = &config.global;
    let sets = parameter_sets(&config.template);
    let envs = config.environment.permutations()?;
    let total = config.workloads.len()
        * global.devices.len()
        * global.schedulers.len()
        * sets.len()
        * envs.len()
        * global.repetitions;

    create_dir_all(&options.output_directory)
        .await
        .map_err(|err| BenchError::io(&options.output_directory, err))?;
    let mut output = CsvOutput::new(output_path(input, &options.output_directory));
    report.output = Some(output.path().to_owned());
    let trace_root = options.output_directory.join(format!(
        "{}-blktrace",
        input
            .file_stem()
            .map(|x| x.to_string_lossy().into_owned())
            .unwrap_or_default()
    ));

    let pb = progress_bar(total as u64, no_progress);
    let mut index = 0;
    for (name, workload) in config.workloads.iter() {
        for device in global.devices.iter() {
            for scheduler in global.schedulers.iter() {
                for params in &sets {
                    for env in &envs {
                        let mut rows = Vec::with_capacity(global.repetitions);
                        for repetition in 0..global.repetitions {
                            let run = Run {
                                index,
                                workload: name,
                                file: &workload.file,
                                traced: workload.enable_blktrace,
                                device,
                                scheduler,
                                params,
                                env: *env,
                                repetition,
                                repetitions: global.repetitions,
                            };
                            index += 1;
                            pb.set_message(format!("{name} {device} {scheduler}"));
                            let result = run_once(
                                &run,
                                config,
                                &**bench,
                                schema,
                                options,
                                harness,
                                &trace_root,
                            )
                            .await;
                            pb.inc(1);
                            match result {
                                Ok(row) => rows.push(row),
                                Err(err) => {
                                    error!("Run failed ({run}): {err}");
                                    report.failed_runs += 1;
                                    if !options.continue_on_failure {
                                        pb.abandon();
                                        return Err(err);
                                    }
                                }
                            }
                        }

                        if rows.is_empty() {
                            continue;
                        }
                        output.write_row(schema, &aggregate(&rows))?;
                        report.rows += 1;
                    }
                }
            }
        }
    }
    pb.finish_and_clear();
    Ok(())
}

async fn run_once(
    run: &Run<'_>,
    config: &Config,
    bench: &dyn Bench,
    schema: &mut OutputSchema,
    options: &ExecuteOptions,
    harness: &Harness,
    trace_root: &Path,
) -> Result<Vec<MetricValue>, BenchError> {
    debug!("Starting run {}: {run}", run.index);
    let lease =
        DeviceLease::acquire(harness.devices.as_ref(), run.device, run.scheduler, run.env).await?;
    let collected = collect(run, config, bench, options, harness, trace_root).await;
    let released = lease.release().await;

    let record = match (collected, released) {
        (Ok(record), Ok(())) => record,
        (Err(err), Ok(())) => return Err(err),
        (Ok(_), Err(restore_err)) => return Err(restore_err),
        (Err(err), Err(restore_err)) => {
            error!("Could not restore {} after failed run: {restore_err}", run.device);
            return Err(err);
        }
    };

    let ctx = RowContext {
        workload: run.workload,
        device: run.device,
        scheduler: run.scheduler,
        params: run.params,
        env: run.env,
        traced: run.traced,
    };
    schema.project(&record, &ctx, config.output.ignore_missing)
}

/// Materializes the workload file, then runs the tool until it succeeds or
/// the attempts run out. Only execution failures are retried.
async fn collect(
    run: &Run<'_>,
    config: &Config,
    bench: &dyn Bench,
    options: &ExecuteOptions,
    harness: &Harness,
    trace_root: &Path,
) -> Result<MetricRecord, BenchError> {
    let bindings = Bindings {
        device: run.device,
        scheduler: run.scheduler,
        params: run.params,
    };
    let file = TemplateFile::materialize(
        run.file,
        &bindings,
        config.template.enabled,
        options.keep_files,
    )
    .await?;
    let cmd = bench.cmd(file.path());
    let limit = config.global.timeout.map(Duration::from_secs);
    let attempts = options.retry_count.max(1);

    let mut attempt = 1;
    loop {
        if config.global.clear_caches {
            if let Err(err) = harness.devices.clear_caches(run.device).await {
                warn!("Could not clear caches for {}: {err}", run.device);
            }
        }

        let session = match run.traced {
            true => {
                let dir = trace_root.join(format!(
                    "{}-{}-{}-{attempt}",
                    run.workload,
                    device_name(run.device).replace('/', "_"),
                    run.index
                ));
                Some(harness.tracer.start(run.device, &dir).await?)
            }
            false => None,
        };

        let output = harness.runner.run(&cmd, limit).await;
        let stats = match session {
            Some(session) => Some(session.finish().await),
            None => None,
        };

        let result = output.map_err(BenchError::from).and_then(|output| {
            let mut record = bench.extract(&output)?;
            if let Some(stats) = stats {
                stats?.add_to(&mut record);
            }
            Ok(record)
        });
        match result {
            Ok(record) => {
                debug!("{cmd} finished on attempt {attempt}");
                return Ok(record);
            }
            Err(err) if err.is_retryable() && attempt < attempts => {
                warn!("Attempt {attempt}/{attempts} of {cmd} failed ({run}): {err}");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
