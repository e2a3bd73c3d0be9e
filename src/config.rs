use std::time::Duration;

use anyhow::Result;
use figment::{
    providers::{Env, Format as _, Toml},
    Figment,
};
use serde::Deserialize;

use crate::{explorer::MAINNET_EXPLORER_URL, sync::SyncConfig};

fn default_db_path() -> String {
    "ergo-sigsync.db".to_string()
}

fn default_explorer_url() -> String {
    MAINNET_EXPLORER_URL.to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_explorer_url")]
    pub explorer_url: String,
    pub secure_confirmations: Option<u32>,
    pub cancel_grace_secs: Option<u64>,
    pub debounce_secs: Option<u64>,
    pub page_size: Option<usize>,
    pub first_sync_cap: Option<usize>,
    pub mempool_page_size: Option<usize>,
}

impl Config {
    /// Unset values keep their defaults
    pub fn sync_config(&self) -> SyncConfig {
        let d = SyncConfig::default();
        SyncConfig {
            secure_confirmations: self.secure_confirmations.unwrap_or(d.secure_confirmations),
            cancel_grace: self
                .cancel_grace_secs
                .map(Duration::from_secs)
                .unwrap_or(d.cancel_grace),
            debounce: self
                .debounce_secs
                .map(Duration::from_secs)
                .unwrap_or(d.debounce),
            page_size: self.page_size.unwrap_or(d.page_size),
            first_sync_cap: self.first_sync_cap.unwrap_or(d.first_sync_cap),
            mempool_page_size: self.mempool_page_size.unwrap_or(d.mempool_page_size),
        }
    }
}

fn load(figment: Figment) -> Result<Config> {
    let config: Config = figment
        .merge(Env::prefixed("ERGO_SIGSYNC_"))
        .extract()?;
    Ok(config)
}

pub fn init_config() -> Result<Config> {
    load(Figment::new().merge(Toml::file("App.toml")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_defaults() {
        let config = load(Figment::new().merge(Toml::string(
            r#"
            db_path = "/tmp/wallet.db"
            secure_confirmations = 30
            cancel_grace_secs = 120
            "#,
        )))
        .unwrap();
        assert_eq!(config.db_path, "/tmp/wallet.db");
        assert_eq!(config.explorer_url, MAINNET_EXPLORER_URL);
        let sync = config.sync_config();
        assert_eq!(sync.secure_confirmations, 30);
        assert_eq!(sync.cancel_grace, Duration::from_secs(120));
        assert_eq!(sync.debounce, Duration::from_secs(30));
        assert_eq!(sync.page_size, 20);
        assert_eq!(sync.first_sync_cap, 500);
    }
}
