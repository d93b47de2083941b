use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use corebit_core::probers::ProberFactory;
use corebit_core::repository::models::ScanProbeType;
use corebit_core::repository::MemoryRepository;
use corebit_core::scan::{NetworkScanner, ScanEvent, ScanRequest};
use std::path::PathBuf;
use std::sync::Arc;

/// Arguments for the scan command
#[derive(Args)]
pub struct ScanArgs {
    /// IP range: CIDR (10.0.0.0/24) or dashed (10.0.0.1-10.0.0.50)
    #[arg(short, long)]
    range: String,

    /// Probe types: mikrotik, snmp, server, find_all (repeatable)
    #[arg(short, long, value_delimiter = ',')]
    probe_types: Vec<String>,
}

pub async fn execute(args: ScanArgs, _config_path: Option<PathBuf>) -> Result<()> {
    let probe_types = parse_probe_types(&args.probe_types)?;

    let scanner = NetworkScanner::new(
        Arc::new(MemoryRepository::new()),
        Arc::new(ProberFactory::default()),
    );
    let mut events = scanner
        .start(ScanRequest {
            ip_range: args.range.clone(),
            credential_profile_ids: Vec::new(),
            probe_types,
        })
        .await
        .context("failed to start the scan")?;

    let mut discovered = 0;
    while let Some(event) = events.recv().await {
        match &event {
            ScanEvent::Start { total_ips } => {
                println!("Scanning {} ({} addresses)", args.range.bold(), total_ips);
            }
            ScanEvent::PingFound { ip, rtt, already_exists } => {
                let marker = if *already_exists { " (known)".dimmed() } else { "".dimmed() };
                println!("  {} {:>8.1} ms{}", ip.green(), rtt, marker);
            }
            ScanEvent::PhaseComplete { phase, found } if phase == "ping_sweep" => {
                println!("Ping sweep finished: {} hosts up", found.to_string().bold());
            }
            ScanEvent::FingerprintResult {
                ip,
                device_type,
                fingerprint,
                ..
            } => {
                println!(
                    "  {} {} {}",
                    ip.cyan(),
                    device_type.bold(),
                    format!("(via {})", fingerprint.detected_via).dimmed()
                );
            }
            ScanEvent::Complete { discovered: count } => {
                discovered = *count;
            }
            ScanEvent::Error { message } => {
                eprintln!("{} {message}", "scan error:".red());
            }
            _ => {}
        }
    }

    println!("Discovered {} device(s)", discovered.to_string().bold());
    Ok(())
}

fn parse_probe_types(raw: &[String]) -> Result<Vec<ScanProbeType>> {
    raw.iter()
        .map(|t| match t.as_str() {
            "mikrotik" => Ok(ScanProbeType::Mikrotik),
            "snmp" => Ok(ScanProbeType::Snmp),
            "server" => Ok(ScanProbeType::Server),
            "find_all" => Ok(ScanProbeType::FindAll),
            other => bail!("unknown probe type {other:?} (expected mikrotik, snmp, server, find_all)"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_types() {
        let parsed = parse_probe_types(&["mikrotik".to_string(), "snmp".to_string()]).unwrap();
        assert_eq!(parsed, vec![ScanProbeType::Mikrotik, ScanProbeType::Snmp]);
        assert!(parse_probe_types(&["bogus".to_string()]).is_err());
    }
}
