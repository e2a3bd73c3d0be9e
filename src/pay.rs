use anyhow::Context as _;
use async_trait::async_trait;
use base64::{
    alphabet,
    engine::{general_purpose::STANDARD, DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine as _,
};

use crate::types::{InputRef, UnsignedTxView};

pub mod cold;
pub mod paylink;

/// Key handling and transaction serialization live outside this crate
pub trait Signer: Send + Sync {
    fn sign(&self, reduced_tx: &[u8], key: &[u8]) -> anyhow::Result<Vec<u8>>;
    /// Id, spent box ids and outputs of a reduced transaction
    fn inspect(&self, reduced_tx: &[u8]) -> anyhow::Result<UnsignedTxView>;
    /// Decodes a serialized input box sent along as signing evidence
    fn parse_box(&self, serialized_box: &[u8]) -> anyhow::Result<InputRef>;
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str) -> anyhow::Result<String>;
    async fn post_json(&self, url: &str, body: String) -> anyhow::Result<()>;
}

#[derive(Clone, Default)]
pub struct ReqwestHttp {
    client: reqwest::Client,
}

impl ReqwestHttp {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttp {
    async fn get(&self, url: &str) -> anyhow::Result<String> {
        let rep = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        let status = rep.status();
        if !status.is_success() {
            anyhow::bail!("GET {url}: unexpected response code {status}");
        }
        Ok(rep.text().await?)
    }

    async fn post_json(&self, url: &str, body: String) -> anyhow::Result<()> {
        let rep = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json; charset=utf-8")
            .body(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        let status = rep.status();
        if !status.is_success() {
            anyhow::bail!("POST {url}: unexpected response code {status}");
        }
        Ok(())
    }
}

const LENIENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

pub fn encode_base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn decode_base64(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD_LENIENT.decode(s.trim())
}

pub fn decode_base64_url(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_LENIENT.decode(s.trim())
}
