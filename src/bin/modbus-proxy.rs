// ABOUTME: Daemon entry point: loads configuration, starts logging, runs the accept loop
// ABOUTME: Stops cleanly on Ctrl+C; in-flight connections are left to drain naturally

use std::sync::Arc;

use argh::FromArgs;
use tracing::{error, info};

#[derive(FromArgs)]
/// Transparent Modbus/TCP reconciliation proxy.
struct Args {
    /// path to the key=value configuration file
    #[argh(option, default = "String::from(\"/etc/modbus_proxy.conf\")")]
    config: String,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args: Args = argh::from_env();

    let cfg = match modbus_proxy::Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load configuration from {}: {e}", args.config);
            return std::process::ExitCode::FAILURE;
        }
    };
    if let Err(e) = cfg.validate() {
        eprintln!("invalid configuration: {e}");
        return std::process::ExitCode::FAILURE;
    }

    let _log_guard = match modbus_proxy::logging::init(&cfg) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    info!("modbus-proxy starting");
    let cfg = Arc::new(cfg);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    match modbus_proxy::accept::run(cfg, shutdown).await {
        Ok(mut in_flight) => {
            info!(in_flight = in_flight.len(), "accept loop stopped, draining in-flight connections");
            while in_flight.join_next().await.is_some() {}
            info!("modbus-proxy stopped");
            std::process::ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "accept loop failed");
            std::process::ExitCode::FAILURE
        }
    }
}
