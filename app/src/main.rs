use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use common::device::SysfsBackend;
use console::style;
use eyre::{Result, WrapErr};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    filter::Directive,
    fmt::{layer, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::bench::{ExecuteOptions, FileReport, Harness, execute, prepare};

mod bench;

const MODULES: [&str; 3] = ["common", "fio", "filebench"];

#[derive(Parser)]
#[command(version, about = "Sweeps block I/O workloads across devices, schedulers and parameters")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[arg(long, default_value_t = false)]
    no_progress: bool,
    /// Extra tracing directives, e.g. `common=debug`
    #[arg(short, long)]
    log: Vec<String>,
    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every input file's sweep and write one CSV per file
    Execute {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[command(flatten)]
        options: ExecuteOptions,
    },
    /// Check input files without running any workload
    Validate {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
}

fn init_logging(args: &Cli) -> Result<Option<WorkerGuard>> {
    let log_level = std::env::var("RUST_LOG").unwrap_or("warn".to_owned());
    let mut env_filter = EnvFilter::new(format!("iobs={log_level}"));
    for log in &args.log {
        let directive = log
            .parse::<Directive>()
            .wrap_err_with(|| format!("invalid --log directive {log}"))?;
        env_filter = env_filter.add_directive(directive);
    }
    for module in MODULES {
        if !args.log.iter().any(|x| x.starts_with(module)) {
            env_filter = env_filter.add_directive(format!("{module}={log_level}").parse()?);
        }
    }

    let (file_layer, guard) = match &args.log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|x| !x.as_os_str().is_empty())
                .map(|x| x.to_owned())
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| eyre::eyre!("--log-file {} has no file name", path.display()))?;
            let file_appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (
                Some(layer().with_ansi(false).with_writer(non_blocking)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            layer()
                .with_timer(ChronoLocal::new("%v %k:%M:%S %z".to_owned()))
                .compact(),
        )
        .with(file_layer)
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Cli::parse();
    let _guard = init_logging(&args)?;

    let ok = match &args.command {
        Commands::Execute { inputs, options } => {
            let harness = Harness::system(options.keep_files);
            let reports = execute(inputs, options, &harness, args.no_progress).await;
            print_summary(inputs.len(), &reports);
            reports.len() == inputs.len() && reports.iter().all(FileReport::succeeded)
        }
        Commands::Validate { inputs } => validate(inputs).await,
    };

    Ok(match ok {
        true => ExitCode::SUCCESS,
        false => ExitCode::FAILURE,
    })
}

async fn validate(inputs: &[PathBuf]) -> bool {
    let devices = SysfsBackend::default();
    let mut ok = true;
    for input in inputs {
        match prepare(input, &devices).await {
            Ok(prepared) => {
                info!(
                    "{} is a valid {} sweep",
                    input.display(),
                    prepared.bench.name()
                );
                println!("{} {}", style("ok").green(), input.display());
            }
            Err(err) => {
                error!("{}: {err}", input.display());
                println!("{} {}: {err}", style("invalid").red(), input.display());
                ok = false;
            }
        }
    }
    ok
}

fn print_summary(total: usize, reports: &[FileReport]) {
    for report in reports {
        let status = match (report.succeeded(), &report.error) {
            (true, _) => style("ok").green(),
            (false, Some(_)) => style("failed").red(),
            (false, None) => style("partial").yellow(),
        };
        let output = report
            .output
            .as_ref()
            .map(|x| x.display().to_string())
            .unwrap_or_else(|| "-".to_owned());
        println!(
            "{status} {} -> {output} ({} rows, {} failed runs)",
            report.input.display(),
            report.rows,
            report.failed_runs
        );
        if let Some(err) = &report.error {
            println!("    {}", style(err).dim());
        }
    }
    if reports.len() < total {
        println!(
            "{}",
            style(format!("{} input files skipped", total - reports.len())).yellow()
        );
    }
}
