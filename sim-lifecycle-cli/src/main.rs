//! Simulation Lifecycle CLI Application
//!
//! This is the command-line interface for the simulation lifecycle library.
//! It uses the sim-lifecycle library and adds:
//! - Configuration file loading (sim-lifecycle.toml)
//! - Slurm submission and sacct-based polling
//! - Checkpoint conversion through the simulator executable
//! - Post-processing plugins (C FFI shared libraries)

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sim_lifecycle::{
    EndOptions, LifecycleError, Number, Orchestrator, RestartMode, RestartOptions, RestartOutcome,
};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

mod config;
mod converter;
mod plugin;
mod poller;
mod slurm;

use config::AppConfig;

/// Simulation Lifecycle - Drive checkpointed simulations through a batch scheduler
#[derive(Parser, Debug)]
#[command(name = "sim-lifecycle")]
#[command(about = "Drive checkpointed simulations through a batch scheduler", long_about = None)]
#[command(version)]
struct Args {
    /// Working directory of the simulation
    #[arg(short = 'C', long, value_name = "DIR", default_value = ".")]
    workdir: PathBuf,

    /// Path to configuration file (default: <workdir>/sim-lifecycle.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Also write log records to this file
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Do not log to the terminal (implies a log file)
    #[arg(long)]
    no_screen: bool,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interpret the template and create the lifecycle document
    Init {
        /// Restart mode: none, one, two or multiple. With none the template's
        /// checkpoint directive decides
        #[arg(long, default_value = "none")]
        restart_mode: RestartMode,

        /// Parameter overrides as a JSON object, e.g. '{"T": 450}'
        #[arg(long, value_name = "JSON")]
        params: Option<String>,
    },

    /// Resolve the newest checkpoint and submit the next run
    Restart {
        /// Use this step instead of reading the newest checkpoint
        #[arg(long)]
        step: Option<i64>,

        /// Only generate the script, do not submit
        #[arg(long)]
        test: bool,

        /// Do not start a poller for the submitted job
        #[arg(long)]
        no_auto: bool,
    },

    /// Hand the finished simulation to the post processor
    End {
        /// Skip the consistency checks
        #[arg(long)]
        anyway: bool,

        /// Leave the lifecycle state untouched
        #[arg(long)]
        ongoing: bool,

        /// Arguments passed to the post processor
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Show the lifecycle document
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a default configuration file
    Genconf,

    /// Poll a job and run a command once it finishes
    Poll {
        #[arg(long)]
        job_id: u64,

        /// Tag of the document the job belongs to
        #[arg(long)]
        tag: i64,

        /// Command to run on a restart-eligible final state
        #[arg(long)]
        command: Option<String>,

        /// Seconds between polls
        #[arg(long)]
        every: Option<u64>,

        /// Identical polls before the job counts as stuck
        #[arg(long)]
        times_criteria: Option<u32>,
    },
}

fn main() -> ExitCode {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    let log_file = args
        .log_file
        .clone()
        .or_else(|| args.no_screen.then(|| args.workdir.join("logs").join("main.log")));
    if let Err(e) = init_logging(args.verbose, args.quiet, log_file.as_deref(), !args.no_screen) {
        eprintln!("error: failed to open log file: {}", e);
        return ExitCode::FAILURE;
    }

    log::debug!("Simulation Lifecycle CLI v{}", env!("CARGO_PKG_VERSION"));
    log::debug!("Using lifecycle library v{}", sim_lifecycle::VERSION);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let kind = e
                .chain()
                .find_map(|cause| cause.downcast_ref::<LifecycleError>())
                .map(LifecycleError::kind)
                .unwrap_or("Error");
            log::error!("{:#}", e);
            eprintln!("error[{}]: {:#}", kind, e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let workdir = fs::canonicalize(&args.workdir)
        .with_context(|| format!("Working directory {:?} is not accessible", args.workdir))?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| workdir.join(config::CONFIG_FILE));

    if let Command::Genconf = args.command {
        config::write_default(&config_path)?;
        println!("Wrote {:?}", config_path);
        return Ok(());
    }

    log::debug!("Loading configuration from: {:?}", config_path);
    let app_config = config::load_config(&config_path)?;

    match &args.command {
        Command::Init { restart_mode, params } => {
            app_config.report_disabled();
            let overrides = parse_params(params.as_deref())?;
            let orchestrator = build_orchestrator(&app_config, &workdir, &config_path, &overrides)?;
            let document = orchestrator.initialize(*restart_mode)?;
            println!(
                "Initialized {} phases (tag {}, restart mode {})",
                document.timeline.len(),
                document.tag,
                document.restart_mode
            );
        }
        Command::Restart { step, test, no_auto } => {
            let orchestrator = build_orchestrator(&app_config, &workdir, &config_path, &BTreeMap::new())?;
            let options = RestartOptions {
                step_override: *step,
                generate_only: *test,
                no_auto: *no_auto,
            };
            match orchestrator.restart(&options)? {
                RestartOutcome::Submitted { job_id, phase, run } => {
                    println!("Submitted job {} for {}{}", job_id, phase, run)
                }
                RestartOutcome::Generated { script, .. } => println!("Generated {:?}", script),
                RestartOutcome::EndReached { last_step } => println!("End reached at step {}", last_step),
            }
        }
        Command::End { anyway, ongoing, args: extra } => {
            let Some(post) = &app_config.sbatch.post else {
                bail!("Post processing is disabled due to a missing [sbatch.post] section");
            };
            let plugin_dir = workdir.join(
                app_config
                    .post_processing
                    .plugin
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("post_processor")),
            );
            let processor = plugin::DylibPostProcessor::from_dir(&plugin_dir)?;
            let orchestrator = build_orchestrator(&app_config, &workdir, &config_path, &BTreeMap::new())?
                .with_post_processor(Box::new(processor));

            let mut end_args = app_config.post_processing.args.clone();
            end_args.extend(extra.iter().cloned());
            let options = EndOptions {
                anyway: *anyway,
                ongoing: *ongoing,
                args: end_args,
                worker_count: post.worker_count(),
            };
            let outcome = orchestrator.end(&options)?;
            println!("Submitted post-processing job {}", outcome.job_id);
        }
        Command::Status { json } => {
            let orchestrator = build_orchestrator(&app_config, &workdir, &config_path, &BTreeMap::new())?;
            let report = orchestrator.status()?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report);
            }
        }
        Command::Poll {
            job_id,
            tag,
            command,
            every,
            times_criteria,
        } => {
            let mut polling = app_config.polling.clone();
            if let Some(every) = every {
                polling.every_secs = *every;
            }
            if let Some(times) = times_criteria {
                polling.times_criteria = *times;
            }
            let monitor = build_monitor(&app_config, &polling, &config_path);
            log::info!("Polling job {} every {}s", job_id, polling.every_secs);

            let outcome = poller::poll_until_final(
                &monitor.settings(None),
                || monitor.query(*job_id),
                std::thread::sleep,
            )?;

            let orchestrator = build_orchestrator(&app_config, &workdir, &config_path, &BTreeMap::new())?;
            let current_tag = orchestrator.status()?.tag;
            let command = if current_tag == *tag {
                command.as_deref()
            } else {
                log::warn!("Document tag changed from {} to {}, not running the command", tag, current_tag);
                None
            };
            if !poller::handle_outcome(&workdir, *job_id, outcome, command)? {
                bail!("Job {} ended as {}", job_id, outcome.state);
            }
        }
        Command::Genconf => {}
    }

    Ok(())
}

fn parse_params(params: Option<&str>) -> Result<BTreeMap<String, Number>> {
    match params {
        Some(raw) => serde_json::from_str(raw).with_context(|| format!("Invalid --params JSON: {}", raw)),
        None => Ok(BTreeMap::new()),
    }
}

/// Command the poller runs to trigger the next restart
fn restart_command(workdir: &Path, config_path: &Path) -> String {
    let program = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "sim-lifecycle".to_string());
    format!(
        "{} --workdir {} --config {} --no-screen restart",
        program,
        workdir.display(),
        config_path.display()
    )
}

fn build_monitor(app_config: &AppConfig, polling: &config::PollingConfig, config_path: &Path) -> poller::SacctMonitor {
    let program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("sim-lifecycle"));
    poller::SacctMonitor::new(
        &app_config.execs.sacct,
        polling.every(),
        polling.times_criteria,
        program,
        config_path,
        app_config.layout().logs,
    )
}

fn build_orchestrator(
    app_config: &AppConfig,
    workdir: &Path,
    config_path: &Path,
    overrides: &BTreeMap<String, Number>,
) -> Result<Orchestrator> {
    let mut orch_config = app_config.orchestrator_config(workdir, restart_command(workdir, config_path));
    orch_config.user_variables.extend(overrides.iter().map(|(k, v)| (k.clone(), *v)));

    let scheduler = slurm::SlurmScheduler::new(
        &app_config.execs.sbatch,
        orch_config.layout.slurm.clone(),
        app_config.sbatch.clone(),
    );
    let monitor = build_monitor(app_config, &app_config.polling, config_path);
    let converter = converter::ExternalConverter::new(&app_config.execs.converter);

    Ok(Orchestrator::new(
        orch_config,
        Box::new(scheduler),
        Box::new(monitor),
        Box::new(converter),
    ))
}

/// Log sink writing to the terminal, a file, or both
struct LogSink {
    file: Option<File>,
    screen: bool,
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.screen {
            io::stderr().write_all(buf)?;
        }
        if let Some(file) = &mut self.file {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = &mut self.file {
            file.flush()?;
        }
        io::stderr().flush()
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool, log_file: Option<&Path>, screen: bool) -> io::Result<()> {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    let file = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            Some(OpenOptions::new().create(true).append(true).open(path)?)
        }
        None => None,
    };

    Builder::new()
        .filter_level(level)
        .target(Target::Pipe(Box::new(LogSink { file, screen })))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
    Ok(())
}
