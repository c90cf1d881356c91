use conveyor_runner::config::RunnerConfig;
use conveyor_runner::error::RunnerError;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = match RunnerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            let e = RunnerError::Configuration {
                details: e.to_string(),
            };
            tracing::error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!("loaded configuration");

    match conveyor_runner::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            tracing::error!("{report}");
            ExitCode::FAILURE
        }
    }
}
