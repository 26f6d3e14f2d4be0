//! `cellhub` command-line entry point.
//!
//! The same executable is both the hub front-end and the isolated worker
//! process that supervisors launch with the hidden `worker` subcommand.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{mpsc, Arc};

use cellhub::archive::FrameArchive;
use cellhub::backend::BackendRegistry;
use cellhub::error::HubError;
use cellhub::frame::{csv, raw};
use cellhub::ids::SimulationId;
use cellhub::manager::{InstanceManager, SimulationRequest};
use cellhub::options::HubOptions;
use cellhub::subscription::{
    ChannelSubscriber, Notification, Subscriber, SubscriptionRegistry,
};
use cellhub::worker::process::{open_log, run_process};
use cellhub::worker::{WorkerOutcome, WorkerParams};
use clap::{Parser, Subcommand};

/// Options file picked up when `--config` is not given.
const DEFAULT_CONFIG: &str = "cellhub.toml";

#[derive(Parser)]
#[command(name = "cellhub", version, about = "Cell simulation hub")]
struct Cli {
    /// TOML options file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one simulation worker over stdin/stdout.
    #[command(hide = true)]
    Worker {
        /// Simulation storage directory.
        #[arg(long)]
        root: PathBuf,
        /// Backend version tag.
        #[arg(long)]
        backend: String,
        /// Live cell limit (0 disables the guard).
        #[arg(long, default_value_t = 0)]
        max_cells: usize,
        /// `env_logger` filter directive, overridden by `RUST_LOG`.
        #[arg(long, default_value = "info")]
        log_filter: String,
    },
    /// Create a simulation and follow it until it stops.
    Run {
        /// Backend source file.
        source: PathBuf,
        /// Unique simulation title.
        #[arg(long)]
        title: String,
        /// Backend version tag.
        #[arg(long, default_value = "Colony")]
        backend: String,
        /// Owning user.
        #[arg(long, default_value = "local")]
        owner: String,
        /// Free-form description.
        #[arg(long, default_value = "")]
        description: String,
        /// Stop once this many frames are committed.
        #[arg(long)]
        frames: Option<u64>,
    },
    /// List the simulations of an owner.
    List {
        /// Owning user.
        #[arg(long, default_value = "local")]
        owner: String,
    },
    /// Export the cells of one frame as CSV.
    ExportCsv {
        /// Simulation id.
        id: SimulationId,
        /// Frame number.
        frame: u64,
        /// Output file (stdout when omitted).
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Print the JSON schema of the options file.
    Schema,
}

fn main() -> ExitCode {
    match execute(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn execute(cli: Cli) -> Result<ExitCode, HubError> {
    match cli.command {
        Command::Worker {
            root,
            backend,
            max_cells,
            log_filter,
        } => run_worker(
            &WorkerParams {
                root,
                backend_version: backend,
                max_cell_count: max_cells,
            },
            &log_filter,
        ),
        Command::Run {
            source,
            title,
            backend,
            owner,
            description,
            frames,
        } => {
            let options = setup(cli.config.as_deref())?;
            let request = SimulationRequest {
                owner,
                title,
                description,
                source: std::fs::read_to_string(&source)?,
                backend_version: backend,
            };
            run_simulation(&options, &request, frames)
        }
        Command::List { owner } => {
            let manager = open_manager(&setup(cli.config.as_deref())?)?;
            let mut out = std::io::stdout().lock();
            for header in manager.list(&owner) {
                let status = match &header.crash_message {
                    Some(_) => "crashed",
                    None if header.is_online => "online",
                    None => "offline",
                };
                writeln!(
                    out,
                    "{}\t{}\t{} frames\t{status}",
                    header.uuid, header.name, header.frame_count
                )?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::ExportCsv { id, frame, output } => {
            let options = setup(cli.config.as_deref())?;
            let archive = FrameArchive::from_options(&options.archive)?;
            let paths = archive.read_frame_files(id, frame)?.ok_or_else(|| {
                HubError::NotFound(format!("frame {frame} of {id}"))
            })?;
            let snapshot = raw::read_all_states(&paths.step)?;
            match output {
                Some(path) => {
                    csv::write_states(&mut File::create(path)?, &snapshot.cells)?;
                }
                None => {
                    let mut out = std::io::stdout().lock();
                    csv::write_states(&mut out, &snapshot.cells)?;
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Schema => {
            let schema =
                serde_json::to_string_pretty(&HubOptions::json_schema())?;
            writeln!(std::io::stdout().lock(), "{schema}")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Load the options file (if any) and start logging.
fn setup(config: Option<&Path>) -> Result<HubOptions, HubError> {
    let options = match config {
        Some(path) => HubOptions::load(path)?,
        None if Path::new(DEFAULT_CONFIG).is_file() => {
            HubOptions::load(Path::new(DEFAULT_CONFIG))?
        }
        None => HubOptions::default(),
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&options.logging.filter),
    )
    .init();
    Ok(options)
}

fn open_manager(options: &HubOptions) -> Result<Arc<InstanceManager>, HubError> {
    let archive = FrameArchive::from_options(&options.archive)?;
    let manager = InstanceManager::new(
        Arc::new(archive),
        Arc::new(SubscriptionRegistry::new()),
        BackendRegistry::builtin(),
        options.worker.clone(),
    )
    .with_log_filter(&options.logging.filter);
    Ok(Arc::new(manager))
}

/// Create a simulation and log its progress until it stops.
fn run_simulation(
    options: &HubOptions,
    request: &SimulationRequest,
    frames: Option<u64>,
) -> Result<ExitCode, HubError> {
    let manager = open_manager(options)?;
    let id = manager.create(request)?;
    log::info!("created simulation {id} '{}'", request.title);

    let (tx, rx) = mpsc::channel();
    let follower: Arc<dyn Subscriber> = Arc::new(ChannelSubscriber::new(tx));
    manager.subscriptions().add(id, Arc::clone(&follower));

    if manager.is_running(id) {
        for notification in rx {
            match notification {
                Notification::NewFrame { frame_count } => {
                    log::info!("frame {frame_count}");
                    if frames.is_some_and(|limit| frame_count >= limit) {
                        let _ = manager.stop(id);
                    }
                }
                Notification::NewShape => log::info!("shape list updated"),
                Notification::Error { message } => log::error!("{message}"),
                Notification::Stopped => break,
            }
        }
    }
    manager.subscriptions().remove(id, &follower);

    let header = manager.header(id)?;
    log::info!(
        "simulation {id} stopped with {} frames",
        header.frame_count
    );
    Ok(if header.crash_message.is_some() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Worker process: log to `<root>/log.txt` and run the step loop.
fn run_worker(
    params: &WorkerParams,
    log_filter: &str,
) -> Result<ExitCode, HubError> {
    let mut logger = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_filter),
    );
    match open_log(&params.root) {
        Ok(file) => logger.target(env_logger::Target::Pipe(Box::new(file))).init(),
        // stderr is redirected into the same file by the supervisor
        Err(_) => logger.init(),
    }
    std::panic::set_hook(Box::new(|info| {
        log::error!("panic: {info}");
    }));

    let outcome = run_process(params, &BackendRegistry::builtin())?;
    Ok(match outcome {
        WorkerOutcome::Finished | WorkerOutcome::Stopped => ExitCode::SUCCESS,
        WorkerOutcome::Crashed => ExitCode::from(2),
    })
}
