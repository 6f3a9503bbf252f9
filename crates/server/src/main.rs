use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use common::{logging, ServerConfig};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use transport::QuicListener;
use tunnel::{diagnostics, stats, Server, TunnelError};

async fn run(config: ServerConfig) -> tunnel::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "quictun server starting");
    config.log_summary();

    let listen: SocketAddr = tunnel::resolve(&config.listen).await?;
    let listener = QuicListener::bind(&tunnel::transport_options(listen, &config.common))?;

    tokio::spawn(stats::run_logger(
        config.common.snmplog.clone(),
        Duration::from_secs(config.common.snmpperiod),
    ));

    if config.pprof {
        let addr = diagnostics::DEFAULT_ADDR;
        let http = TcpListener::bind(addr)
            .await
            .map_err(|source| TunnelError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        tokio::spawn(async move {
            if let Err(e) = diagnostics::serve(http).await {
                warn!(%e, "diagnostics endpoint stopped");
            }
        });
    }

    Server::new(listener, &config.target, config.common.quiet)
        .run()
        .await
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match ServerConfig::parse().load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("quictun-server: {e}");
            return ExitCode::from(2);
        }
    };

    let _guard = match logging::init_logging(config.common.log_file()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("quictun-server: {e}");
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
