//! Aggregator daemon entry point: wires configuration, persistence, the
//! settings store, the network client factory, the challenge solver, and
//! the refresh scheduler together. The HTTP surface itself is out of
//! scope; this binary's job ends at "the pieces are constructed and the
//! scheduler is ticking."

use std::sync::Arc;
use std::time::Duration;

use gist_core::challenge::Solver;
use gist_core::config::Config;
use gist_core::id;
use gist_core::net::{NetworkClientFactory, SettingsProxyProvider};
use gist_core::scheduler::{RefreshCollaborator, RefreshFuture, RefreshScheduler};
use gist_core::settings::{SettingsStore, SqliteSettingsStore};
use gist_core::store::Store;
use rusqlite::Connection;

/// The feed-refresh sequence itself (fetch -> detect challenge -> solve ->
/// replay -> persist) is out of scope; this collaborator only reports how
/// many feeds it would have refreshed, giving the scheduler a real
/// collaborator to drive while that pipeline is built out separately.
struct FeedRefreshCollaborator {
    store: Arc<Store>,
}

impl RefreshCollaborator for FeedRefreshCollaborator {
    fn refresh(&self) -> RefreshFuture {
        let store = self.store.clone();
        Box::pin(async move {
            let feed_count = tokio::task::spawn_blocking(move || {
                store.with_connection(|conn| conn.query_row("SELECT COUNT(*) FROM feeds", [], |row| row.get::<_, i64>(0)))
            })
            .await
            .map_err(|e| Box::new(e) as gist_core::scheduler::RefreshError)??;
            tracing::info!(feed_count, "refresh tick");
            Ok(())
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.log_level.as_str()))
        .init();

    tracing::info!(listen_addr = %config.listen_addr, db_path = %config.db_path.display(), "starting gistd");

    id::init(config.node_id)?;

    let store = Arc::new(Store::open(&config.db_path)?);

    let settings_conn = Connection::open(&config.db_path)?;
    let settings_store: Arc<dyn SettingsStore> = Arc::new(SqliteSettingsStore::new(settings_conn)?);

    let net = Arc::new(NetworkClientFactory::new(Arc::new(SettingsProxyProvider::new(settings_store.clone()))));
    let _solver = Solver::new(net.clone(), settings_store.clone());

    let scheduler = RefreshScheduler::new(FeedRefreshCollaborator { store: store.clone() }, Duration::from_secs(60));
    scheduler.start()?;

    tracing::info!("gistd is running; press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    scheduler.stop().await?;

    Ok(())
}
