use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use virtual_sensor_calc::cli::{Cli, Commands};
use virtual_sensor_calc::{commands, config};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let ok = match cli.command {
        Commands::Check(args) => commands::check(&args)?,
        Commands::Run(args) => {
            let config = config::CalcConfig::from_env()?;
            commands::run(args, &config).await?
        }
        Commands::List(args) => {
            let config = config::CalcConfig::from_env()?;
            commands::list(&args, &config).await?;
            true
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
