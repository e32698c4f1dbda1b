// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use fsconverge::{
    config::ClientConfig, driver::Reconciler, entry::Specification, path::default_config_file,
    report::RunReport,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag,
};
use std::{
    fs,
    io::{stderr, IsTerminal},
    path::{Path, PathBuf},
    process::exit,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "fsconverge [options] <command> <specification>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to client configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Log debug output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<bool> {
        let config = load_config(self.config.as_deref())?;
        match self.command {
            Command::Verify(opts) => run_verify(config, opts),
            Command::Apply(opts) => run_apply(config, opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Verify system against specification without changing anything.
    #[command(override_usage = "fsconverge verify [options] <specification>")]
    Verify(RunOptions),

    /// Install every entry of specification that does not match.
    #[command(override_usage = "fsconverge apply [options] <specification>")]
    Apply(RunOptions),
}

#[derive(Args, Clone, Debug)]
struct RunOptions {
    /// Path to specification file.
    #[arg(required = true, value_name = "specification")]
    pub specification: PathBuf,

    /// Only report what would be installed.
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Ask before installing each entry.
    #[arg(short, long)]
    pub interactive: bool,

    /// Back up every file before overwriting it.
    #[arg(short = 'P', long)]
    pub paranoid: bool,

    /// Only install entries of given bundles.
    #[arg(short, long = "bundle", value_name = "name")]
    pub bundles: Vec<String>,

    /// Never install entries of given bundles.
    #[arg(short, long = "skip-bundle", value_name = "name")]
    pub skip_bundles: Vec<String>,

    /// Write run report to file instead of standard output.
    #[arg(short, long, value_name = "path")]
    pub report: Option<PathBuf>,
}

impl RunOptions {
    fn apply_to(&self, config: &mut ClientConfig) {
        config.dry_run |= self.dry_run;
        config.interactive |= self.interactive;
        config.paranoid.enabled |= self.paranoid;
        config.bundles.extend(self.bundles.iter().cloned());
        config.skip_bundles.extend(self.skip_bundles.iter().cloned());
    }
}

fn main() {
    let cli = Cli::parse();
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time()
        .with_writer(stderr);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(if cli.verbose { "debug" } else { "info" }))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    match cli.run() {
        Ok(true) => exit(0),
        Ok(false) => exit(2),
        Err(error) => {
            error!("{error:?}");
            exit(1);
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ClientConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_config_file() {
            Ok(path) if path.exists() => path,
            _ => return Ok(ClientConfig::default()),
        },
    };

    let data = fs::read_to_string(&path)
        .with_context(|| format!("failed to read configuration {}", path.display()))?;
    let config = data
        .parse::<ClientConfig>()
        .with_context(|| format!("failed to load configuration {}", path.display()))?;
    Ok(config)
}

fn run_verify(mut config: ClientConfig, opts: RunOptions) -> Result<bool> {
    opts.apply_to(&mut config);
    config.dry_run = true;
    reconcile(&config, &opts)
}

fn run_apply(mut config: ClientConfig, opts: RunOptions) -> Result<bool> {
    opts.apply_to(&mut config);
    reconcile(&config, &opts)
}

fn reconcile(config: &ClientConfig, opts: &RunOptions) -> Result<bool> {
    let data = fs::read_to_string(&opts.specification).with_context(|| {
        format!("failed to read specification {}", opts.specification.display())
    })?;
    let spec: Specification = data.parse()?;

    let reconciler = Reconciler::new(config).with_progress(progress_bar(config));
    let cancel = reconciler.cancel_flag();
    flag::register(SIGINT, cancel.clone())?;
    flag::register(SIGTERM, cancel)?;

    let report = reconciler.run(&spec);
    write_report(&report, opts.report.as_deref())?;
    Ok(report.is_clean())
}

fn progress_bar(config: &ClientConfig) -> ProgressBar {
    if config.interactive || !stderr().is_terminal() {
        return ProgressBar::hidden();
    }

    let style = ProgressStyle::with_template("{spinner} {msg} [{bar:30}] {pos}/{len}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    ProgressBar::new(0).with_style(style)
}

fn write_report(report: &RunReport, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => {
            fs::write(path, report.to_string())
                .with_context(|| format!("failed to write report {}", path.display()))?;
            info!("wrote run report to {}", path.display());
        }
        None => print!("{report}"),
    }

    Ok(())
}
