//! roadvault binary entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use roadvault::config::{ConfigError, ENV_CONFIG};

mod cli;

#[derive(Parser, Debug)]
#[command(
    name = "roadvault",
    version,
    about = "Archive road-test data onto a removable device"
)]
struct Cli {
    /// Enable verbose logging (debug to stdout)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Settings file (TOML)
    #[arg(long, env = ENV_CONFIG, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(flatten)]
    run: cli::run::RunArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Archive now (the default when no subcommand is given)
    Run,

    /// Show resolved settings
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => ExitCode::from(cli::run::cmd_run(cli.run, config_path, cli.verbose)),
        Commands::Config { json } => {
            match cli::config::run(cli::config::ConfigArgs { json }, config_path) {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    match err.downcast_ref::<ConfigError>() {
                        Some(config_err) => eprint!("{}", cli::error::HelpfulError::config(config_err)),
                        None => eprintln!("{:?}", err),
                    }
                    ExitCode::from(roadvault::orchestrator::EXIT_CONFIG)
                }
            }
        }
    }
}
