use std::collections::HashMap;

use anyhow::Result;
use tokio::sync::broadcast;

use crate::{
    db::TransactionStore,
    explorer::Explorer,
    types::{AddressTransaction, RawTransaction, TxState},
    utils::now_millis,
};

use super::{to_address_transaction, SyncConfig, SyncEvent};

/// One pass over one address. Everything merged before an error stays
/// committed; the rest is picked up by the next pass.
pub(crate) struct Refresh<'a> {
    pub explorer: &'a dyn Explorer,
    pub store: &'a dyn TransactionStore,
    pub config: &'a SyncConfig,
    pub events: &'a broadcast::Sender<SyncEvent>,
}

impl Refresh<'_> {
    pub async fn refresh(&self, address: &str) -> Result<()> {
        let mut tracked = HashMap::new();
        let mut high_water = None;
        for tx in self.store.load_unsettled(address)? {
            if tx.state.is_final() {
                high_water = high_water.max(tx.inclusion_height);
            } else {
                tracked.insert(tx.tx_id.clone(), tx);
            }
        }
        tracing::debug!(
            "{address}: {} unsettled, secure up to {high_water:?}",
            tracked.len()
        );
        self.load(address, high_water, Some(self.config.first_sync_cap), tracked)
            .await
    }

    pub async fn download_all(&self, address: &str) -> Result<()> {
        self.store.delete_address(address)?;
        self.load(address, None, None, HashMap::new()).await
    }

    async fn load(
        &self,
        address: &str,
        high_water: Option<u32>,
        cap: Option<usize>,
        mut tracked: HashMap<String, AddressTransaction>,
    ) -> Result<()> {
        let page_size = self.config.page_size.max(1);
        let mut offset = 0;
        let mut highest_executed = high_water.unwrap_or_default();
        loop {
            let page = self
                .explorer
                .confirmed_transactions(address, page_size, offset)
                .await?;
            offset += page.len();
            tracing::debug!("{address}: page of {} at {offset}", page.len());
            let _ = self.events.send(SyncEvent::Progress {
                address: address.to_string(),
                loaded: offset,
            });

            if let Some(h) = page.first().and_then(|tx| tx.inclusion_height) {
                highest_executed = highest_executed.max(h);
            }
            let oldest = page
                .last()
                .and_then(|tx| tx.inclusion_height)
                .unwrap_or_default();

            for tx in page.iter() {
                // already durably known
                if let (Some(h), Some(height)) = (high_water, tx.inclusion_height) {
                    if height <= h {
                        continue;
                    }
                }
                let existing = tracked.remove(&tx.id);
                self.merge(address, tx, existing, true)?;
            }

            let done = match high_water {
                Some(h) => oldest <= h,
                None => oldest == 0 || cap.map(|cap| offset >= cap).unwrap_or(false),
            };
            if done || page.len() < page_size {
                break;
            }
        }

        let mempool = self
            .explorer
            .mempool_transactions(address, self.config.mempool_page_size, 0)
            .await?;
        for tx in mempool.iter() {
            let existing = tracked.remove(&tx.id);
            self.merge(address, tx, existing, false)?;
        }

        let grace = self.config.cancel_grace.as_millis() as u64;
        let deadline = now_millis().saturating_sub(grace);
        for tx in tracked.into_values() {
            if tx.state == TxState::Cancelled || tx.timestamp >= deadline {
                continue;
            }
            // sorts it next to the transactions it vanished among
            let height = tx
                .inclusion_height
                .unwrap_or(highest_executed.saturating_add(1));
            tracing::info!("{address}: {} cancelled", tx.tx_id);
            self.store.update_transaction(
                address,
                &tx.tx_id,
                Some(height),
                TxState::Cancelled,
                None,
            )?;
        }
        Ok(())
    }

    fn merge(
        &self,
        address: &str,
        tx: &RawTransaction,
        existing: Option<AddressTransaction>,
        confirmed: bool,
    ) -> Result<()> {
        let state = if !confirmed {
            TxState::Waiting
        } else if tx.num_confirmations < self.config.secure_confirmations {
            TxState::ConfirmedUnsecure
        } else {
            TxState::ConfirmedSecure
        };
        let inclusion_height = if confirmed { tx.inclusion_height } else { None };

        match existing {
            Some(existing)
                if !matches!(existing.state, TxState::Submitted | TxState::Cancelled) =>
            {
                // a block time replaces the submission time
                let timestamp = if confirmed { Some(tx.timestamp) } else { None };
                self.store.update_transaction(
                    address,
                    &tx.id,
                    inclusion_height,
                    state,
                    timestamp,
                )?;
            }
            existing => {
                // locally built rows may be incomplete: rebuild from chain data
                let timestamp = match (&existing, confirmed) {
                    (_, true) => tx.timestamp,
                    (Some(existing), false) => existing.timestamp,
                    (None, false) => now_millis(),
                };
                let message = existing.as_ref().and_then(|e| e.message.clone());
                match to_address_transaction(
                    address,
                    tx,
                    inclusion_height,
                    timestamp,
                    state,
                    message,
                )? {
                    Some((row, tokens)) => {
                        tracing::debug!("{address}: saving {} as {state:?}", tx.id);
                        self.store.store_transaction(&row, &tokens)?;
                    }
                    None => {
                        if existing.is_some() {
                            self.store.delete_transaction(address, &tx.id)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
