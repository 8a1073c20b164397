//! AP Coins ledger server
//!
//! Every balance change goes through the transaction recorder; markets, the
//! shop and rewards are clients of it.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use apcoin_ledger::{
    api::{create_router, AppState},
    config::Args,
    events::spawn_event_logger,
    ledger::{InMemoryLedgerStore, LedgerStore, SqliteLedgerStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let settings = Args::parse().into_settings()?;

    let store: Arc<dyn LedgerStore> = if settings.in_memory {
        info!("Using in-memory ledger store");
        Arc::new(InMemoryLedgerStore::new())
    } else {
        info!(db_path = %settings.db_path, "Opening SQLite ledger store");
        Arc::new(
            SqliteLedgerStore::new(&settings.db_path)
                .with_context(|| format!("Failed to open ledger at {}", settings.db_path))?,
        )
    };

    let state = AppState::new(store, &settings);
    let _event_logger = spawn_event_logger(state.events.subscribe());

    let app = create_router(state);

    let listener = TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.bind_addr))?;
    info!(
        addr = %settings.bind_addr,
        welcome_bonus = settings.welcome_bonus,
        policy = ?settings.unfulfilled_policy,
        "AP Coins ledger listening"
    );

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "apcoin_ledger=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // Also try the crate root when launched from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
