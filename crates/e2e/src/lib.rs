//! wgmesh E2E test harness
//!
//! Runs the whole control plane in-process on an ephemeral port, backed by an
//! in-memory store and [`MemoryBroker`](wgmesh_daemon::publish::MemoryBroker),
//! and drives it over real HTTP and WebSocket connections.

pub mod client;
pub mod error;
pub mod idp;
pub mod server;

pub use client::{ApiClient, Ending, WsClient};
pub use error::{E2eError, E2eResult};
pub use idp::MockIdp;
pub use server::{ServerConfig, ServerHandle, MASTER_KEY};

use std::future::Future;
use std::time::Duration;

/// Poll `check` until it yields a value or `timeout` passes
pub async fn eventually<T, F, Fut>(what: &str, timeout: Duration, mut check: F) -> E2eResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Ok(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(E2eError::Timeout(what.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Route test logs through `RUST_LOG`; safe to call from every test
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
