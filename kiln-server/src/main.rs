//! kiln-server – entry point.
//!
//! Startup order:
//! 1. Parse the listen address from the command line.
//! 2. Read environment configuration (`LLAMACPP_PARALLEL`, logging).
//! 3. Initialise structured tracing (JSON optional).
//! 4. Build the route tree and start the HTTP server.
//!
//! The inference runtime starts lazily on the first successful LoadModel
//! call; Health answers before that.

mod config;
mod error;
mod loader;
mod routes;
mod schemas;
mod state;

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::loader::BuiltinLoader;
use crate::state::AppState;

const DEFAULT_ADDR: &str = "localhost:50051";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let addr = match parse_addr(std::env::args().skip(1)) {
        Ok(addr) => addr,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(1);
        }
    };

    let cfg = Config::from_env();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cfg.log_level.parse().unwrap_or_default()),
        )
        .with_target(true);
    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        n_parallel = cfg.n_parallel,
        "kiln-server starting"
    );

    let state = Arc::new(AppState::new(cfg, Arc::new(BuiltinLoader)));
    let app = routes::build(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Parse `--addr=<host:port>` / `--addr <host:port>` / `-a <host:port>`.
fn parse_addr<I: Iterator<Item = String>>(mut args: I) -> Result<String, String> {
    let mut addr = DEFAULT_ADDR.to_string();
    while let Some(arg) = args.next() {
        if let Some(value) = arg.strip_prefix("--addr=") {
            addr = value.to_string();
        } else if arg == "--addr" || arg == "-a" {
            match args.next() {
                Some(value) => addr = value,
                None => return Err(usage()),
            }
        } else {
            return Err(usage());
        }
    }
    Ok(addr)
}

fn usage() -> String {
    "Usage: kiln-server [--addr=<host:port>] or [-a <host:port>]".to_string()
}

// ── Tests ──────────────────────────────────────────────────────────────────────
