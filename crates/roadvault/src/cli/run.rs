//! Default command: one archive run.

use std::path::{Path, PathBuf};

use roadvault::cancel::{self, CancellationToken};
use roadvault::config::{
    ConfigError, RunContext, Settings, ENV_ARCHIVE_BASE, ENV_DEVICE_UUID, ENV_WEBHOOK_URL, ENV_WORKSPACE,
};
use roadvault::mount::SystemMount;
use roadvault::notify::WebhookNotifier;
use roadvault::orchestrator::{self, Orchestrator, RunError};
use roadvault_logging::{init_logging, LogConfig, RunLogHandle};
use tracing::{error, info, warn};

use super::error::HelpfulError;

/// Run environment, normally passed by the device trigger.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct RunArgs {
    /// Workspace root; category sources live under <workspace>/data
    #[arg(long, env = ENV_WORKSPACE, value_name = "DIR")]
    pub workspace: Option<PathBuf>,

    /// Stable identifier of the archive device (filesystem UUID)
    #[arg(long, env = ENV_DEVICE_UUID, value_name = "UUID")]
    pub device_uuid: Option<String>,

    /// Webhook receiving the run status message
    #[arg(long, env = ENV_WEBHOOK_URL, value_name = "URL", hide_env_values = true)]
    pub webhook_url: Option<String>,

    /// Directory holding the mount point [default: <workspace>/archive]
    #[arg(long, env = ENV_ARCHIVE_BASE, value_name = "DIR")]
    pub archive_base: Option<PathBuf>,
}

/// Execute one archive run and return the process exit code.
pub fn cmd_run(args: RunArgs, config_path: Option<&Path>, verbose: bool) -> u8 {
    let settings = match Settings::load(config_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprint!("{}", HelpfulError::config(&e));
            return orchestrator::EXIT_CONFIG;
        }
    };

    let run_log = match init_logging(LogConfig {
        app_name: "roadvault",
        verbose,
        syslog: settings.syslog,
    }) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("ERROR: Failed to initialize logging: {:#}", e);
            return orchestrator::EXIT_CONFIG;
        }
    };

    let cancel = CancellationToken::new();
    if let Err(e) = cancel::install_signal_handlers(&cancel) {
        warn!("Failed to install signal handlers: {}", e);
    }

    match execute(args, settings, run_log, &cancel) {
        Ok(code) => code,
        Err(err) => {
            error!("Archive run aborted: {}", err);
            eprint!("{}", HelpfulError::from(&err));
            if cancel.is_cancelled() {
                orchestrator::EXIT_INTERRUPTED
            } else {
                err.exit_code()
            }
        }
    }
}

fn execute(
    args: RunArgs,
    settings: Settings,
    run_log: RunLogHandle,
    cancel: &CancellationToken,
) -> Result<u8, RunError> {
    let context = RunContext::new(
        args.workspace,
        args.device_uuid,
        args.webhook_url,
        args.archive_base,
    )?;
    info!(
        "Archive run: device {} -> {}",
        context.device_id(),
        context.mount_point().display()
    );

    let backend = SystemMount::new(settings.mount_timeout(), cancel.clone())
        .with_fstype(settings.mount_fstype.clone())
        .with_options(settings.mount_options.clone())
        .with_mount_table(settings.mount_table.clone());
    let notifier = WebhookNotifier::new(context.webhook_url(), settings.notify_timeout())
        .map_err(|e| ConfigError::Invalid {
            name: "webhook client",
            reason: e.to_string(),
        })?;

    let outcome = Orchestrator::new(settings, backend, notifier, cancel.clone())
        .with_run_log(run_log)
        .run(&context)?;

    let code = outcome.exit_code();
    info!(
        "Archive run complete: status={} snapshot={} notified={} unmounted={} exit={}",
        outcome.report.verdict.status,
        outcome.report.snapshot.dir().display(),
        outcome.notified,
        outcome.unmounted,
        code
    );
    Ok(code)
}
