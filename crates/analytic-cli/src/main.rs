mod cmd;
mod output;

use analytic_cli::settings::DEFAULT_SETTINGS_FILE;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "analytic-orchestrator",
    about = "Keep analytic triggers armed to match a manifest and run analyses when they fire",
    version,
    propagate_version = true
)]
struct Cli {
    /// Settings file
    #[arg(long, short = 'c', global = true, env = "ANALYTIC_SETTINGS", default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Reconciliation period in milliseconds
    #[arg(long, global = true, env = "UPDATE_ANALYTIC_QUEUE_TIMER")]
    reconcile_period: Option<String>,

    /// Duration report period in milliseconds
    #[arg(long, global = true, env = "ANALYTIC_REPORT_TIMER")]
    report_period: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator until interrupted
    Run {
        /// Reconcile once, print what was armed, release everything and exit
        #[arg(long)]
        once: bool,
    },

    /// Check the settings and manifest without arming anything
    Validate,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let overrides = cmd::Overrides {
        reconcile_period: cli.reconcile_period.as_deref(),
        report_period: cli.report_period.as_deref(),
    };

    let result = match cli.command {
        Commands::Run { once } => cmd::run::run(&cli.config, overrides, once, cli.json),
        Commands::Validate => cmd::validate::run(&cli.config, overrides, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
