//! Applies the ledger schema to the database named by `DATABASE_URL`.

use anyhow::Context;

use keeper_infra::{PgLedgerStore, StoreConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    keeper_observability::init();

    let config = StoreConfig::from_env().context("invalid store configuration")?;
    let store = PgLedgerStore::connect(&config)
        .await
        .context("failed to connect to ledger database")?;

    let result = store.migrate().await.context("failed to apply schema");
    store.close().await;
    result?;

    tracing::info!("ledger schema is up to date");
    Ok(())
}
