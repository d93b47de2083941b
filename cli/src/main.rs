use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;

mod commands;

use commands::{license, scan, serve};

/// CoreBit - network topology monitoring server and tooling
#[derive(Parser)]
#[command(name = "corebit")]
#[command(author = "CoreBit Contributors")]
#[command(version)]
#[command(about = "Network topology manager and monitoring engine", long_about = None)]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a configuration file (default: ./corebit.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitoring server
    #[command(visible_alias = "s")]
    Serve(serve::ServeArgs),

    /// Run a one-shot network scan and print discoveries
    Scan(scan::ScanArgs),

    /// License management commands
    #[command(subcommand)]
    License(license::LicenseCommands),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let result = match cli.command {
        Commands::Serve(args) => serve::execute(args, cli.config).await,
        Commands::Scan(args) => scan::execute(args, cli.config).await,
        Commands::License(cmd) => license::execute(cmd, cli.config).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        if cli.verbose {
            eprintln!("\nCaused by:");
            for cause in e.chain().skip(1) {
                eprintln!("  {cause}");
            }
        }
        process::exit(1);
    }
}
