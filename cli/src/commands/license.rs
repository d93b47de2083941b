use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use corebit_core::license::{is_update_entitled, DeviceAllowance, LicenseGate};
use corebit_core::repository::models::License;
use std::path::PathBuf;

/// License management commands
#[derive(Subcommand)]
pub enum LicenseCommands {
    /// Show the host fingerprint and installed licenses
    Show,

    /// Install a license from a JSON key file
    Add {
        /// Path to the license key file
        key_file: PathBuf,
    },
}

pub async fn execute(cmd: LicenseCommands, config_path: Option<PathBuf>) -> Result<()> {
    let config = super::load_config(config_path)?;
    let gate = LicenseGate::load(&config.license.file_path)
        .with_context(|| format!("failed to load {}", config.license.file_path.display()))?;

    match cmd {
        LicenseCommands::Show => show(&gate),
        LicenseCommands::Add { key_file } => add(&gate, &key_file),
    }
}

fn show(gate: &LicenseGate) -> Result<()> {
    println!("Server fingerprint: {}", gate.fingerprint().bold());

    match gate.allowance() {
        DeviceAllowance::Unlimited => println!("Device limit:       {}", "unlimited (Pro)".green()),
        DeviceAllowance::Limited(limit) => println!("Device limit:       {limit}"),
    }

    let licenses = gate.licenses();
    if licenses.is_empty() {
        println!("\nNo licenses installed (free tier).");
        return Ok(());
    }

    println!("\nInstalled licenses:");
    for license in &licenses {
        let entitled = if is_update_entitled(license) {
            "updates current".green()
        } else {
            "updates expired".yellow()
        };
        println!(
            "  {:<24} {:?} limit={} {}",
            license.license_key, license.tier, license.device_limit, entitled
        );
    }
    Ok(())
}

fn add(gate: &LicenseGate, key_file: &PathBuf) -> Result<()> {
    let raw = std::fs::read_to_string(key_file)
        .with_context(|| format!("failed to read {}", key_file.display()))?;
    let license: License =
        serde_json::from_str(&raw).context("key file is not a valid license")?;
    let key = license.license_key.clone();
    gate.add(license).context("license rejected")?;
    println!("Installed license {}", key.bold());
    Ok(())
}
