use anyhow::Result;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::types::{AddressTransaction, AddressTransactionToken, TxState};

pub mod tx;

pub fn reset_tables(connection: &Connection) -> Result<()> {
    tracing::info!("Reset Tables");

    connection.execute(
        "CREATE TABLE IF NOT EXISTS addr_txs(
        id_tx INTEGER PRIMARY KEY AUTOINCREMENT,
        address TEXT NOT NULL,
        tx_id TEXT NOT NULL,
        inclusion_height INTEGER,
        timestamp INTEGER NOT NULL,
        erg_delta INTEGER NOT NULL,
        message TEXT,
        state INTEGER NOT NULL,
        UNIQUE (address, tx_id))",
        [],
    )?;

    connection.execute(
        "CREATE TABLE IF NOT EXISTS addr_tx_tokens(
        id_token INTEGER PRIMARY KEY,
        address TEXT NOT NULL,
        tx_id TEXT NOT NULL,
        token_id TEXT NOT NULL,
        token_name TEXT NOT NULL,
        token_delta INTEGER NOT NULL,
        decimals INTEGER NOT NULL,
        UNIQUE (address, tx_id, token_id))",
        [],
    )?;

    connection.execute(
        "CREATE INDEX IF NOT EXISTS i_addr_txs_state ON addr_txs(address, state)",
        [],
    )?;

    Ok(())
}

/// Ledger storage used by the sync engine
pub trait TransactionStore: Send + Sync {
    /// Every row below `CONFIRMED_SECURE` plus the most recent secure one
    fn load_unsettled(&self, address: &str) -> Result<Vec<AddressTransaction>>;
    fn get_transaction(&self, address: &str, tx_id: &str) -> Result<Option<AddressTransaction>>;
    /// Writes the row and its tokens atomically. A previous row for the
    /// same (address, tx id) and its tokens are deleted first.
    fn store_transaction(
        &self,
        tx: &AddressTransaction,
        tokens: &[AddressTransactionToken],
    ) -> Result<u32>;
    fn update_transaction(
        &self,
        address: &str,
        tx_id: &str,
        inclusion_height: Option<u32>,
        state: TxState,
        timestamp: Option<u64>,
    ) -> Result<()>;
    fn delete_transaction(&self, address: &str, tx_id: &str) -> Result<()>;
    fn delete_address(&self, address: &str) -> Result<()>;
    fn list_transactions(&self, address: &str) -> Result<Vec<AddressTransaction>>;
    fn list_tokens(&self, address: &str, tx_id: &str) -> Result<Vec<AddressTransactionToken>>;
}

#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    pub fn new(pool: Pool<SqliteConnectionManager>) -> Result<Self> {
        let connection = pool.get()?;
        reset_tables(&connection)?;
        Ok(Self { pool })
    }

    fn connection(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }
}

impl TransactionStore for SqliteStore {
    fn load_unsettled(&self, address: &str) -> Result<Vec<AddressTransaction>> {
        tx::load_unsettled(&*self.connection()?, address)
    }

    fn get_transaction(&self, address: &str, tx_id: &str) -> Result<Option<AddressTransaction>> {
        tx::get_transaction(&*self.connection()?, address, tx_id)
    }

    fn store_transaction(
        &self,
        tx: &AddressTransaction,
        tokens: &[AddressTransactionToken],
    ) -> Result<u32> {
        let mut connection = self.connection()?;
        let db_tx = connection.transaction()?;
        let id = tx::store_transaction(&db_tx, tx, tokens)?;
        db_tx.commit()?;
        Ok(id)
    }

    fn update_transaction(
        &self,
        address: &str,
        tx_id: &str,
        inclusion_height: Option<u32>,
        state: TxState,
        timestamp: Option<u64>,
    ) -> Result<()> {
        tx::update_transaction(
            &*self.connection()?,
            address,
            tx_id,
            inclusion_height,
            state,
            timestamp,
        )
    }

    fn delete_transaction(&self, address: &str, tx_id: &str) -> Result<()> {
        let mut connection = self.connection()?;
        let db_tx = connection.transaction()?;
        tx::delete_transaction(&db_tx, address, tx_id)?;
        db_tx.commit()?;
        Ok(())
    }

    fn delete_address(&self, address: &str) -> Result<()> {
        let mut connection = self.connection()?;
        let db_tx = connection.transaction()?;
        tx::delete_address(&db_tx, address)?;
        db_tx.commit()?;
        Ok(())
    }

    fn list_transactions(&self, address: &str) -> Result<Vec<AddressTransaction>> {
        tx::list_transactions(&*self.connection()?, address)
    }

    fn list_tokens(&self, address: &str, tx_id: &str) -> Result<Vec<AddressTransactionToken>> {
        tx::list_tokens(&*self.connection()?, address, tx_id)
    }
}
