use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Result;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tokio::runtime::Handle;

use crate::{
    config::Config,
    db::SqliteStore,
    explorer::{ExplorerClient, MAINNET_EXPLORER_URL},
    sync::{SyncConfig, SyncEngine},
};

type Connection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Where a wallet session gets its explorer, database and tunables from
#[derive(Clone, Debug)]
pub struct CoinDef {
    pub explorer_url: String,
    pub pool: Option<Pool<SqliteConnectionManager>>,
    pub sync: SyncConfig,
}

impl Default for CoinDef {
    fn default() -> Self {
        Self {
            explorer_url: MAINNET_EXPLORER_URL.to_string(),
            pool: None,
            sync: SyncConfig::default(),
        }
    }
}

impl CoinDef {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut coin = Self::default();
        coin.set_url(&config.explorer_url);
        coin.set_db_path(&config.db_path)?;
        coin.sync = config.sync_config();
        Ok(coin)
    }

    pub fn set_db_path<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::new(manager)?;
        self.pool = Some(pool);
        Ok(())
    }

    pub fn set_url(&mut self, url: &str) {
        self.explorer_url = url.to_string();
    }

    fn pool(&self) -> Result<&Pool<SqliteConnectionManager>> {
        self.pool
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No db path set"))
    }

    pub fn connection(&self) -> Result<Connection> {
        let connection = self.pool()?.get()?;
        connection.busy_timeout(Duration::from_secs(60))?;
        Ok(connection)
    }

    pub fn store(&self) -> Result<SqliteStore> {
        SqliteStore::new(self.pool()?.clone())
    }

    pub fn explorer(&self) -> ExplorerClient {
        ExplorerClient::new(&self.explorer_url)
    }

    pub fn sync_engine(&self, runtime: Handle) -> Result<SyncEngine> {
        Ok(SyncEngine::new(
            Arc::new(self.explorer()),
            Arc::new(self.store()?),
            self.sync.clone(),
            runtime,
        ))
    }
}
