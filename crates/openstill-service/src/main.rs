//! OpenStill daemon (stilld).

use openstill_service::{Daemon, ServiceConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "openstill_service=debug,openstill_engine=debug,info".into()),
        )
        .init();

    info!("starting stilld v{}", env!("CARGO_PKG_VERSION"));

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(flag) if flag == "--config" => {
            let path = args.next().ok_or("--config requires a path")?;
            ServiceConfig::load_from_path(path)?
        }
        Some(other) => {
            error!("unknown argument: {other}. Usage: stilld [--config <path>]");
            std::process::exit(2);
        }
        None => ServiceConfig::load()?,
    };

    let daemon = Daemon::new(config)?;
    info!(devices = daemon.device_count(), "daemon ready");

    if let Err(err) = daemon.run().await {
        error!(error = %err, "daemon error");
        std::process::exit(1);
    }

    info!("stopped");
    Ok(())
}
