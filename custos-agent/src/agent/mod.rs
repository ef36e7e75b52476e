//! Agent lifecycle: the daemon loop plus systemd service management.

pub mod cycle;
pub mod daemon;

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use tracing::info;

pub use cycle::{Agent, CycleStats};
pub use daemon::run;

const SERVICE_NAME: &str = "custos-agent";
const SERVICE_FILE: &str = "/etc/systemd/system/custos-agent.service";

pub fn install_service(config_path: Option<&Path>) -> Result<()> {
    let exe_path = std::env::current_exe().context("Unable to resolve binary path")?;
    let config_arg = config_path
        .map(|p| format!(" --config {}", p.display()))
        .unwrap_or_default();
    let service_content = format!(
        "[Unit]
Description=Custos compliance agent
After=network-online.target
Wants=network-online.target

[Service]
ExecStart={} agent run --headless{}
Restart=always
RestartSec=5
User=root
Environment=RUST_LOG=info

[Install]
WantedBy=multi-user.target
",
        exe_path.display(),
        config_arg
    );

    std::fs::write(SERVICE_FILE, &service_content)
        .context("Failed to write systemd service file")?;

    Command::new("systemctl").args(["daemon-reload"]).status()?;
    Command::new("systemctl")
        .args(["enable", SERVICE_NAME])
        .status()?;
    Command::new("systemctl")
        .args(["start", SERVICE_NAME])
        .status()?;

    info!("Installed and started systemd service at {}", SERVICE_FILE);
    Ok(())
}

pub fn uninstall_service() -> Result<()> {
    if Path::new(SERVICE_FILE).exists() {
        Command::new("systemctl")
            .args(["stop", SERVICE_NAME])
            .status()
            .ok();
        Command::new("systemctl")
            .args(["disable", SERVICE_NAME])
            .status()
            .ok();
        std::fs::remove_file(SERVICE_FILE).context("Failed to remove service file")?;
        Command::new("systemctl")
            .args(["daemon-reload"])
            .status()
            .ok();
        info!("Uninstalled custos agent service");
    } else {
        info!("Service not found, nothing to uninstall");
    }

    Ok(())
}

pub fn status_service() -> Result<()> {
    let output = Command::new("systemctl")
        .args(["status", SERVICE_NAME])
        .output()
        .context("Failed to query service status")?;

    let msg = match output.stdout.len() == 0 {
        true => String::from_utf8_lossy(&output.stderr),
        false => String::from_utf8_lossy(&output.stdout),
    };
    println!("{}", msg);
    Ok(())
}
