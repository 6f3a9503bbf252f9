//! Local HTTP endpoint exposing the stats counters.

use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::info;

use crate::error::Result;
use crate::stats::{Snapshot, STATS};

/// Where `--pprof` serves the endpoint.
pub const DEFAULT_ADDR: &str = "127.0.0.1:6060";

pub fn router() -> Router {
    Router::new().route("/debug/stats", get(stats))
}

async fn stats() -> Json<Snapshot> {
    Json(STATS.snapshot())
}

/// Serve the diagnostics router on `listener` until the process exits.
pub async fn serve(listener: TcpListener) -> Result<()> {
    info!(addr = %listener.local_addr()?, "diagnostics endpoint listening");
    axum::serve(listener, router()).await?;
    Ok(())
}
