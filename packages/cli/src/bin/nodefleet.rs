use clap::Parser;
use colored::*;
use nodefleet_cli::{handle_config, run_session, App, Cli, CliConfig, Commands, Mode};
use std::process;
use tracing_subscriber::EnvFilter;

/// Default filter when RUST_LOG is unset
const DEFAULT_LOG_FILTER: &str = "warn,nodefleet=info";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    if cli.json {
        colored::control::set_override(false);
    }

    if let Err(e) = handle_command(cli).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn handle_command(cli: Cli) -> anyhow::Result<()> {
    let mut config = CliConfig::load();
    let projects_root = config.projects_root(cli.projects_dir.as_deref());

    if let Commands::Config { set_projects_dir } = &cli.command {
        return handle_config(&mut config, set_projects_dir.as_deref(), &projects_root, cli.json);
    }

    let app = App::bootstrap(projects_root, config.settings_path, cli.json).await?;
    match cli.command {
        Commands::Session => run_session(&app).await,
        command => app.execute(command, Mode::Foreground).await,
    }
}
