//! Breakout trading bot - main entry point
//!
//! Subcommands:
//! - run: the trading bot (plus the monitoring API)
//! - serve: the monitoring API alone
//! - status / performance / export / reset: operator tooling

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "breakout-bot")]
#[command(about = "Breakout-entry / trailing-stop trading bot for equities and crypto", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the trading bot
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,

        /// Listen address for the monitoring API, e.g. 0.0.0.0:8080
        /// (omit to run without it)
        #[arg(long)]
        api_addr: Option<String>,
    },

    /// Run the read-only monitoring API without the bot
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,

        /// Listen address
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: String,
    },

    /// Print symbol states, active orders, and recent events
    Status {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },

    /// Print the performance report
    Performance {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },

    /// Export closed trades to CSV
    Export {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,

        /// Output file
        #[arg(short, long, default_value = "trades.csv")]
        output: String,
    },

    /// Reset the paper account (close positions, cancel orders)
    Reset {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Filter out noisy HTTP internals
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run { .. } => "run",
        Commands::Serve { .. } => "serve",
        Commands::Status { .. } => "status",
        Commands::Performance { .. } => "performance",
        Commands::Export { .. } => "export",
        Commands::Reset { .. } => "reset",
    };

    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Run { config, api_addr } => commands::run::run(config, api_addr),
        Commands::Serve { config, addr } => commands::serve::run(config, addr),
        Commands::Status { config } => commands::tools::status(config),
        Commands::Performance { config } => commands::tools::performance(config),
        Commands::Export { config, output } => commands::tools::export(config, output),
        Commands::Reset { config } => commands::tools::reset(config),
    }
}
