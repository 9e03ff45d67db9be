use std::process::ExitCode;

use tracing::{error, info};

use streamrelay::core::config::Config;
use streamrelay::core::shutdown::ShutdownCoordinator;
use streamrelay::observability::metrics as obs;
use streamrelay::relay::RelayServer;

#[tokio::main]
async fn main() -> ExitCode {
    // Install the metrics recorder before anything records. The handle
    // renders Prometheus exposition for whatever serves the /metrics
    // endpoint; the relay itself only records.
    let _metrics_handle = obs::install_prometheus_recorder();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());

    let config = match Config::load(&config_path).and_then(|cfg| {
        cfg.validate()?;
        Ok(cfg)
    }) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing();

    info!(version = env!("CARGO_PKG_VERSION"), config = %config_path, "streamrelay starting");

    obs::describe_all_metrics();

    let server = match RelayServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = ShutdownCoordinator::new();
    let cancel = shutdown.token();

    let run_handle = tokio::spawn(server.clone().run(cancel));

    shutdown.wait_for_signal_and_shutdown().await;

    // run() stops accepting once the token fires, then drains live
    // sessions with its own bounded wait.
    match run_handle.await {
        Ok(Ok(())) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "server task panicked");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match std::env::var("RELAY_LOG_FORMAT").as_deref() {
        Ok("json") => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
