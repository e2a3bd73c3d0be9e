use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use crate::types::{AddressTransaction, AddressTransactionToken, TxState};

const TX_COLUMNS: &str =
    "id_tx, address, tx_id, inclusion_height, timestamp, erg_delta, message, state";

fn row_to_tx(r: &Row) -> rusqlite::Result<AddressTransaction> {
    let state = r.get::<_, i32>(7)?;
    let state = TxState::from_code(state)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(7, state as i64))?;
    Ok(AddressTransaction {
        id: r.get::<_, u32>(0)?,
        address: r.get::<_, String>(1)?,
        tx_id: r.get::<_, String>(2)?,
        inclusion_height: r.get::<_, Option<u32>>(3)?,
        timestamp: r.get::<_, i64>(4)? as u64,
        erg_delta: r.get::<_, i64>(5)?,
        message: r.get::<_, Option<String>>(6)?,
        state,
    })
}

pub fn load_unsettled(connection: &Connection, address: &str) -> Result<Vec<AddressTransaction>> {
    let mut s = connection.prepare(&format!(
        "SELECT {TX_COLUMNS} FROM addr_txs
        WHERE address = ?1 AND (state < ?2 OR id_tx =
            (SELECT id_tx FROM addr_txs WHERE address = ?1 AND state = ?2
            ORDER BY inclusion_height DESC LIMIT 1))"
    ))?;
    let rows = s.query_map(
        params![address, TxState::ConfirmedSecure.code()],
        row_to_tx,
    )?;
    let mut txs = vec![];
    for r in rows {
        txs.push(r?);
    }
    Ok(txs)
}

pub fn get_transaction(
    connection: &Connection,
    address: &str,
    tx_id: &str,
) -> Result<Option<AddressTransaction>> {
    let tx = connection
        .query_row(
            &format!("SELECT {TX_COLUMNS} FROM addr_txs WHERE address = ?1 AND tx_id = ?2"),
            [address, tx_id],
            row_to_tx,
        )
        .optional()?;
    Ok(tx)
}

pub fn store_transaction(
    connection: &Transaction,
    tx: &AddressTransaction,
    tokens: &[AddressTransactionToken],
) -> Result<u32> {
    delete_transaction(connection, &tx.address, &tx.tx_id)?;
    let mut s_tx = connection.prepare_cached(
        "INSERT INTO addr_txs
        (address, tx_id, inclusion_height, timestamp, erg_delta, message, state)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        RETURNING id_tx",
    )?;
    let id = s_tx.query_row(
        params![
            tx.address,
            tx.tx_id,
            tx.inclusion_height,
            tx.timestamp as i64,
            tx.erg_delta,
            tx.message,
            tx.state.code()
        ],
        |r| r.get::<_, u32>(0),
    )?;

    let mut s_token = connection.prepare_cached(
        "INSERT INTO addr_tx_tokens
        (address, tx_id, token_id, token_name, token_delta, decimals)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for t in tokens {
        s_token.execute(params![
            tx.address,
            tx.tx_id,
            t.token_id,
            t.token_name,
            t.token_delta,
            t.decimals
        ])?;
    }
    Ok(id)
}

pub fn update_transaction(
    connection: &Connection,
    address: &str,
    tx_id: &str,
    inclusion_height: Option<u32>,
    state: TxState,
    timestamp: Option<u64>,
) -> Result<()> {
    connection.execute(
        "UPDATE addr_txs SET inclusion_height = ?3, state = ?4,
        timestamp = COALESCE(?5, timestamp)
        WHERE address = ?1 AND tx_id = ?2",
        params![
            address,
            tx_id,
            inclusion_height,
            state.code(),
            timestamp.map(|t| t as i64)
        ],
    )?;
    Ok(())
}

pub fn delete_transaction(connection: &Transaction, address: &str, tx_id: &str) -> Result<()> {
    connection.execute(
        "DELETE FROM addr_tx_tokens WHERE address = ?1 AND tx_id = ?2",
        [address, tx_id],
    )?;
    connection.execute(
        "DELETE FROM addr_txs WHERE address = ?1 AND tx_id = ?2",
        [address, tx_id],
    )?;
    Ok(())
}

pub fn delete_address(connection: &Transaction, address: &str) -> Result<()> {
    connection.execute("DELETE FROM addr_tx_tokens WHERE address = ?1", [address])?;
    connection.execute("DELETE FROM addr_txs WHERE address = ?1", [address])?;
    Ok(())
}

/// Pending transactions first, then newest first
pub fn list_transactions(connection: &Connection, address: &str) -> Result<Vec<AddressTransaction>> {
    let mut s = connection.prepare(&format!(
        "SELECT {TX_COLUMNS} FROM addr_txs WHERE address = ?1
        ORDER BY inclusion_height IS NULL DESC, inclusion_height DESC, timestamp DESC"
    ))?;
    let rows = s.query_map([address], row_to_tx)?;
    let mut txs = vec![];
    for r in rows {
        txs.push(r?);
    }
    Ok(txs)
}

pub fn list_tokens(
    connection: &Connection,
    address: &str,
    tx_id: &str,
) -> Result<Vec<AddressTransactionToken>> {
    let mut s = connection.prepare(
        "SELECT id_token, token_id, token_name, token_delta, decimals FROM addr_tx_tokens
        WHERE address = ?1 AND tx_id = ?2 ORDER BY token_id",
    )?;
    let rows = s.query_map([address, tx_id], |r| {
        Ok((
            r.get::<_, u32>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, i64>(3)?,
            r.get::<_, u32>(4)?,
        ))
    })?;
    let mut tokens = vec![];
    for r in rows {
        let (id, token_id, token_name, token_delta, decimals) = r?;
        tokens.push(AddressTransactionToken {
            id,
            address: address.to_string(),
            tx_id: tx_id.to_string(),
            token_id,
            token_name,
            token_delta,
            decimals,
        });
    }
    Ok(tokens)
}
