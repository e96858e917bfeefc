//! `skv-server [addr] [password]`
//!
//! Runs the framed test server until Ctrl-C. `RUST_LOG` controls logging.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use skv_server::{serve, ServerState};

const DEFAULT_ADDR: &str = "127.0.0.1:8888";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let password = args.next();

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let state = Arc::new(ServerState::new(password));

    serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
    .context("server loop failed")?;
    Ok(())
}
