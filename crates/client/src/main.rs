use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use common::{logging, ClientConfig};
use tracing::{error, info};
use transport::QuicDialer;
use tunnel::{stats, Client, ClientOptions};

async fn run(config: ClientConfig) -> tunnel::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "quictun client starting");
    config.log_summary();

    let remote = tunnel::resolve(&config.target).await?;
    let dialer = QuicDialer::new(&tunnel::transport_options(remote, &config.common))?;

    tokio::spawn(stats::run_logger(
        config.common.snmplog.clone(),
        Duration::from_secs(config.common.snmpperiod),
    ));

    let client = Client::bind(&config.listen, dialer, ClientOptions::from_config(&config)).await?;
    client.run().await
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match ClientConfig::parse().load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("quictun-client: {e}");
            return ExitCode::from(2);
        }
    };

    let _guard = match logging::init_logging(config.common.log_file()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("quictun-client: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(%e, "fatal error");
            ExitCode::FAILURE
        }
    }
}
