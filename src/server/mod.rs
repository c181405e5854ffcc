//! HTTP surface
//!
//! Exposes the liveness probe, the status report and the tenant resource
//! read/write paths over HTTP/1.1.

mod api;
pub mod headers;

pub use api::{ApiServer, BoxBody, Route};

use anyhow::Result;
use crate::core::Core;

/// Start background maintenance and serve HTTP on `listen`
///
/// # Arguments
/// * `core` - Shared pool, breaker, cache and limiter
/// * `listen` - The address to listen on (e.g., "0.0.0.0:8080")
pub async fn run_server(core: &Core, listen: &str) -> Result<()> {
    let _background = core.start_background();

    if let Err(e) = core.warm_up().await {
        // The database may come up later; reads are served from defaults meanwhile
        tracing::warn!(error = %e, "pool_warm_up_failed");
    }

    let server = ApiServer::new(core.clone(), listen.to_string());
    server.run().await
}
