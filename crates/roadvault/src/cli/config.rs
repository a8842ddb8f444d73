//! `roadvault config`: show the resolved settings.

use std::path::Path;

use roadvault::config::{Settings, ARCHIVE_SUBDIR};
use roadvault::lock;

#[derive(Debug, clap::Args)]
pub struct ConfigArgs {
    /// Show resolved settings in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Print the settings the next run would use.
pub fn run(args: ConfigArgs, config_path: Option<&Path>) -> anyhow::Result<()> {
    let settings = Settings::load(config_path)?;
    let source = config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults)".to_string());

    if args.json {
        let config = serde_json::json!({
            "source": source,
            "settings": settings,
            "lock": {
                "path": settings.lock_path.to_string_lossy(),
                "sidecar": lock::sidecar_path_for(&settings.lock_path).to_string_lossy(),
                "held": settings.lock_path.exists(),
            },
            "device_dir": {
                "path": settings.device_dir.to_string_lossy(),
                "exists": settings.device_dir.is_dir(),
            },
        });
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        println!("ROADVAULT CONFIGURATION");
        println!("=======================");
        println!();
        println!("Source:          {}", source);
        println!();
        println!("Lock:            {}", settings.lock_path.display());
        println!(
            "                 {}",
            if settings.lock_path.exists() { "(present: a run may be in progress)" } else { "(free)" }
        );
        println!("Device dir:      {}", settings.device_dir.display());
        println!("Mount table:     {}", settings.mount_table.display());
        println!(
            "Mount:           -t {} -o {}",
            settings.mount_fstype.as_deref().unwrap_or("auto"),
            settings.mount_options.as_deref().unwrap_or("defaults")
        );
        println!("Mount point:     <archive base>/{}", ARCHIVE_SUBDIR);
        println!();
        println!("Timeouts:        mount {}s, sync {}s per category, notify {}s",
            settings.mount_timeout().as_secs(),
            settings.sync_timeout().as_secs(),
            settings.notify_timeout().as_secs()
        );
        println!("Empty archive:   {}", settings.empty_archive);
        println!("Syslog:          {}", if settings.syslog { "on" } else { "off" });
    }

    Ok(())
}
