use anyhow::{Context as _, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize};

use crate::types::{RawTransaction, TxBox};

pub const MAINNET_EXPLORER_URL: &str = "https://api.ergoplatform.com";

/// Read side of the block explorer. Pages come back newest first.
#[async_trait]
pub trait Explorer: Send + Sync {
    async fn confirmed_transactions(
        &self,
        address: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RawTransaction>>;
    async fn mempool_transactions(
        &self,
        address: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RawTransaction>>;
    async fn box_by_id(&self, box_id: &str) -> Result<Option<TxBox>>;
    async fn transaction_by_id(&self, tx_id: &str) -> Result<Option<RawTransaction>>;
}

#[derive(Deserialize)]
struct Items<T> {
    items: Vec<T>,
}

#[derive(Clone, Debug)]
pub struct ExplorerClient {
    url: String,
    client: reqwest::Client,
}

impl ExplorerClient {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}{path}", self.url);
        tracing::debug!("GET {url}");
        let rep = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        if rep.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let rep = rep.error_for_status()?;
        let value = rep
            .json::<T>()
            .await
            .with_context(|| format!("Invalid response from {url}"))?;
        Ok(Some(value))
    }

    async fn get_page(&self, path: &str) -> Result<Vec<RawTransaction>> {
        let page = self.get::<Items<RawTransaction>>(path).await?;
        Ok(page.map(|p| p.items).unwrap_or_default())
    }
}

#[async_trait]
impl Explorer for ExplorerClient {
    async fn confirmed_transactions(
        &self,
        address: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RawTransaction>> {
        self.get_page(&format!(
            "/api/v1/addresses/{address}/transactions?offset={offset}&limit={limit}"
        ))
        .await
    }

    async fn mempool_transactions(
        &self,
        address: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RawTransaction>> {
        self.get_page(&format!(
            "/api/v1/mempool/transactions/byAddress/{address}?offset={offset}&limit={limit}"
        ))
        .await
    }

    async fn box_by_id(&self, box_id: &str) -> Result<Option<TxBox>> {
        self.get(&format!("/api/v1/boxes/{box_id}")).await
    }

    async fn transaction_by_id(&self, tx_id: &str) -> Result<Option<RawTransaction>> {
        self.get(&format!("/api/v1/transactions/{tx_id}")).await
    }
}
