mod cli;
mod commands;

use std::process::ExitCode;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use nearby_config::NearbyConfig;

fn load_config(args: &cli::Args) -> NearbyConfig {
    let loaded = match &args.config {
        Some(path) => nearby_config::load_config_from(path),
        None => nearby_config::load_config(),
    };
    loaded.unwrap_or_else(|e| {
        eprintln!("Config load failed, using defaults: {e}");
        NearbyConfig::default()
    })
}

fn init_logging(args: &cli::Args, config: &NearbyConfig) {
    let directive = args
        .log_level
        .as_deref()
        .unwrap_or(config.logging.level.as_directive());
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(directive.parse().unwrap_or_else(|_| LevelFilter::INFO.into())),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse();

    let mut config = load_config(&args);
    init_logging(&args, &config);
    tracing::info!("nearby v{} starting", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &args.config {
        tracing::info!(path = %path.display(), "Using config override");
    }

    let token = commands::apply_env(&mut config);
    match commands::run(args.command, config, token).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
