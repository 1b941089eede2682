use clap::Parser;
use convoy::cli::{self, Cli, Commands};
use convoy::config::AppConfig;
use convoy::error::Result;
use convoy::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config_dir)?;

    match cli.command {
        Some(Commands::CheckConfig) => cli::check_config(&config)?,
        Some(Commands::Migrate) => {
            init_logging(&config.logging);
            cli::migrate(&config).await?;
        }
        Some(Commands::Serve { bind }) => {
            let mut config = config;
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            run_serve(config).await?;
        }
        None => run_serve(config).await?,
    }

    Ok(())
}

async fn run_serve(config: AppConfig) -> Result<()> {
    init_logging(&config.logging);
    config.validate()?;
    tracing::info!(
        backend = ?config.persistence.backend,
        api = config.api.enabled,
        "starting convoy"
    );
    cli::serve(config).await
}
