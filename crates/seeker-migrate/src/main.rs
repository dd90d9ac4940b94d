use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use seeker_migrate::{load_config, Cli, LoggingConfig};
use tracing_subscriber::EnvFilter;

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries command output; logs go to stderr.
    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = cli.config.as_deref().unwrap_or(Path::new("seeker.toml"));
    let mut config = match load_config(Some(config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply_overrides(&mut config);

    init_tracing(&config.logging);
    tracing::debug!(
        database = %config.database.path,
        migrations_dir = %config.migrations.dir.display(),
        "configuration loaded"
    );

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match seeker_migrate::run(&cli.command, &config, &mut out) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("Migration failed: {e}");
            ExitCode::FAILURE
        }
    }
}
