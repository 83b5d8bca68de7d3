use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use cell_offload::engine::{Engine, SubmitRequest};
use cell_offload::relay::GenerationOutcome;
use cell_offload::shell::{Shell, TerminalSurface};
use cell_offload::{EngineConfig, event_log, worker};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

const LOG_FILTER_ENV: &str = "CELL_OFFLOAD_LOG";
const RUN_DESTINATION: &str = "run";

#[derive(Parser)]
#[command(name = "cell-offload")]
#[command(about = "Run cells in isolated worker processes and merge their results back", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<CliCommand>,

    /// Write a JSONL debug event log into this directory.
    #[arg(long, global = true)]
    debug_events_dir: Option<PathBuf>,

    /// Report which variables each background task merged.
    #[arg(long, global = true)]
    report_transfers: bool,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Read cells from stdin (the default).
    Shell,
    /// Internal: execute one job read from stdin.
    Worker,
    /// Run one file in the background and wait for it.
    Run {
        file: PathBuf,
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long)]
        key: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(target_family = "unix")]
    // Shell output may go to a pipe that closes early; surface EPIPE instead of dying.
    ignore_sigpipe();
    init_tracing();

    if worker::is_worker_mode() {
        return worker::run();
    }

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env()?;
    if cli.report_transfers {
        config = config.with_report_transfers(true);
    }
    let command = cli.command.unwrap_or(CliCommand::Shell);
    event_log::initialize(
        cli.debug_events_dir,
        event_log::StartupContext {
            mode: match &command {
                CliCommand::Shell => "shell",
                CliCommand::Worker => "worker",
                CliCommand::Run { .. } => "run",
            }
            .to_string(),
            worker_program: config.worker_program.display().to_string(),
            report_transfers: config.report_transfers,
        },
    )?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    match command {
        CliCommand::Worker => worker::run(),
        CliCommand::Shell => local.block_on(&runtime, run_shell(config)),
        CliCommand::Run {
            file,
            namespace,
            key,
        } => local.block_on(&runtime, run_file(config, file, namespace, key)),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

#[cfg(target_family = "unix")]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

async fn run_shell(config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!(
        "cell-offload shell: end cells with END | %%background [namespace] [--key KEY] | %ns %tasks %wait %stop | Ctrl-D to exit"
    );
    let engine = Engine::new(config, Rc::new(RefCell::new(Default::default())));
    let mut shell = Shell::new(
        engine,
        Rc::new(RefCell::new(std::io::stdout())),
        Rc::new(RefCell::new(std::io::stderr())),
    );
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    shell.run(stdin).await?;
    Ok(())
}

async fn run_file(
    config: EngineConfig,
    file: PathBuf,
    namespace: Option<String>,
    key: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let source = std::fs::read_to_string(&file)
        .map_err(|err| format!("failed to read {}: {err}", file.display()))?;
    let engine = Engine::new(config, Rc::new(RefCell::new(Default::default())));
    engine.relay().attach(
        RUN_DESTINATION,
        Box::new(TerminalSurface::new(
            "",
            Rc::new(RefCell::new(std::io::stdout())),
            Rc::new(RefCell::new(std::io::stderr())),
        )),
    );
    let request = SubmitRequest {
        task_key: key,
        destination: RUN_DESTINATION.to_string(),
        source,
        namespace,
    };
    let scheduled = engine.submit(request)?;
    engine.wait_idle().await;
    match engine.last_outcome(&scheduled.task_key) {
        Some(GenerationOutcome::Completed) => Ok(()),
        Some(outcome) => Err(format!("{} finished with {}", file.display(), outcome.as_str()).into()),
        None => Err(format!("{} did not finish", file.display()).into()),
    }
}
