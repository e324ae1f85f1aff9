mod alert;
mod checker;
mod config;
mod control;
mod daemon;
mod event;
mod lock;
mod paths;
mod runner;
mod scheduler;
mod status;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::checker::{CheckerConfig, CommandSpec};
use crate::control::{Request, Response};
use crate::runner::RunnerConfig;

#[derive(Parser)]
#[command(
    name = "traynote-daemon",
    version,
    about = "Background notifier for pending yay/pacman updates",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    /// Directory holding settings.toml (default: ~/.config/yay-traynote)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Directory holding the lock, socket and status file
    /// (default: $XDG_RUNTIME_DIR/yay-traynote)
    #[arg(long, global = true)]
    runtime_dir: Option<PathBuf>,

    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground (the default)
    Run(RunArgs),
    /// Check for updates now and print the result
    Check,
    /// Open a terminal running the upgrade
    Upgrade,
    /// Dismiss the updates-available alert
    Clear,
    /// Set the automatic check interval in seconds (snapped to a supported value)
    Interval { secs: u64 },
    /// Print the daemon status
    Status,
}

const COMMAND_SYNTAX: &str =
    "Split on whitespace; quotes and escapes are not interpreted, so wrap shell syntax in a script";

#[derive(Args)]
struct RunArgs {
    /// Privileged database sync run before each query
    #[arg(
        long,
        default_value_t = checker::default_sync_command(),
        value_parser = parse_command,
        long_help = format!("Privileged database sync run before each query. {COMMAND_SYNTAX}.")
    )]
    sync_command: CommandSpec,

    /// Skip the database sync and only query
    #[arg(long)]
    no_sync: bool,

    /// Read-only query listing pending updates
    #[arg(
        long,
        default_value_t = checker::default_query_command(),
        value_parser = parse_command,
        long_help = format!("Read-only query listing pending updates. {COMMAND_SYNTAX}.")
    )]
    query_command: CommandSpec,

    /// Command run inside the terminal to upgrade
    #[arg(
        long,
        default_value_t = runner::default_upgrade_command(),
        value_parser = parse_command,
        long_help = format!("Command run inside the terminal to upgrade. {COMMAND_SYNTAX}.")
    )]
    upgrade_command: CommandSpec,

    #[arg(long, default_value_t = checker::DEFAULT_SYNC_TIMEOUT.as_secs())]
    sync_timeout_secs: u64,

    #[arg(long, default_value_t = checker::DEFAULT_QUERY_TIMEOUT.as_secs())]
    check_timeout_secs: u64,

    /// Terminal emulator to use instead of auto-detection
    #[arg(long)]
    terminal: Option<String>,
}

fn parse_command(line: &str) -> Result<CommandSpec, String> {
    CommandSpec::parse(line).ok_or_else(|| "command must not be empty".to_string())
}

impl RunArgs {
    fn checker_config(&self) -> CheckerConfig {
        CheckerConfig {
            sync: (!self.no_sync).then(|| self.sync_command.clone()),
            query: self.query_command.clone(),
            sync_timeout: Duration::from_secs(self.sync_timeout_secs),
            query_timeout: Duration::from_secs(self.check_timeout_secs),
        }
    }

    fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            upgrade: self.upgrade_command.clone(),
            terminal: self.terminal.clone(),
            ..RunnerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("traynote_daemon=info,warn")),
        )
        .init();

    let cli = Cli::parse();
    let paths = paths::Paths::resolve(cli.config_dir, cli.runtime_dir);

    let request = match cli.command {
        None => std::process::exit(run_daemon(paths, cli.run).await),
        Some(Command::Run(args)) => std::process::exit(run_daemon(paths, args).await),
        Some(Command::Check) => Request::Check,
        Some(Command::Upgrade) => Request::Upgrade,
        Some(Command::Clear) => Request::Clear,
        Some(Command::Interval { secs }) => Request::SetInterval { secs },
        Some(Command::Status) => Request::Status,
    };

    std::process::exit(run_client(&paths, &request).await);
}

async fn run_daemon(paths: paths::Paths, args: RunArgs) -> i32 {
    let options = daemon::Options {
        checker: args.checker_config(),
        runner: args.runner_config(),
        paths,
    };
    daemon::start(options).await
}

async fn run_client(paths: &paths::Paths, request: &Request) -> i32 {
    match control::send(&paths.socket_file(), request).await {
        Ok(Response::Ok { message }) => {
            println!("{message}");
            daemon::EXIT_OK
        }
        Ok(Response::Status { status }) => match toml::to_string_pretty(&status) {
            Ok(text) => {
                print!("{text}");
                daemon::EXIT_OK
            }
            Err(e) => {
                error!("Failed to render status: {e}");
                daemon::EXIT_STARTUP_FAILURE
            }
        },
        Ok(Response::Error { message }) => {
            eprintln!("{message}");
            daemon::EXIT_STARTUP_FAILURE
        }
        Err(e) => {
            error!("{e:#}");
            daemon::EXIT_STARTUP_FAILURE
        }
    }
}
