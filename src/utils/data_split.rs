use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// QR capacity we target for a single code
pub const QR_DATA_LENGTH_LIMIT: usize = 2900;
/// For small screens and poor cameras
pub const QR_DATA_LENGTH_LOW_RES: usize = 1000;

pub fn qr_size_limit(low_res: bool) -> usize {
    if low_res {
        QR_DATA_LENGTH_LOW_RES
    } else {
        QR_DATA_LENGTH_LIMIT
    }
}

const QR_PROPERTY_INDEX: &str = "p";
const QR_PROPERTY_COUNT: &str = "n";
const QR_HEADER_RESERVE: usize = 30;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QrChunk {
    pub index: usize,
    pub pages: usize,
    pub data: String,
}

/// Cuts `payload` into QR sized JSON envelopes keyed by `tag`.
/// A payload that fits goes out as a single `{tag: payload}`; otherwise
/// every page also carries its 1-based index `p` and the page count `n`.
pub fn split(payload: &str, size_limit: usize, tag: &str) -> Vec<String> {
    let slice_len = size_limit
        .saturating_sub(QR_HEADER_RESERVE + tag.len())
        .max(1);
    let chars = payload.chars().collect::<Vec<_>>();
    if chars.len() <= slice_len {
        let mut envelope = Map::new();
        envelope.insert(tag.to_string(), Value::String(payload.to_string()));
        return vec![Value::Object(envelope).to_string()];
    }

    let slices = chars.chunks(slice_len).collect::<Vec<_>>();
    let pages = slices.len();
    slices
        .iter()
        .enumerate()
        .map(|(i, slice)| {
            let mut envelope = Map::new();
            envelope.insert(tag.to_string(), Value::String(slice.iter().collect()));
            envelope.insert(QR_PROPERTY_INDEX.to_string(), Value::from(i + 1));
            envelope.insert(QR_PROPERTY_COUNT.to_string(), Value::from(pages));
            Value::Object(envelope).to_string()
        })
        .collect()
}

pub fn parse_chunk(wire: &str, tag: &str) -> Result<QrChunk> {
    let envelope: Map<String, Value> = serde_json::from_str(wire)
        .map_err(|e| Error::MalformedEnvelope(format!("QR chunk: {e}")))?;
    let data = envelope
        .get(tag)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MalformedEnvelope(format!("QR chunk has no {tag}")))?;
    let page_property = |key: &str| match envelope.get(key) {
        None => Ok(1),
        Some(v) => v
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| Error::MalformedEnvelope(format!("QR chunk property {key}"))),
    };
    let index = page_property(QR_PROPERTY_INDEX)?;
    let pages = page_property(QR_PROPERTY_COUNT)?;
    if index == 0 || index > pages {
        return Err(Error::ChunkMismatch(format!("page {index} of {pages}")));
    }
    Ok(QrChunk {
        index,
        pages,
        data: data.to_string(),
    })
}

/// Gathers the pages of one logical payload as they get scanned, in any order
#[derive(Debug)]
pub struct PagesCollector {
    tag: String,
    pages: usize,
    chunks: BTreeMap<usize, QrChunk>,
}

impl PagesCollector {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            pages: 0,
            chunks: BTreeMap::new(),
        }
    }

    /// Returns false and leaves the collector untouched when the chunk is
    /// unreadable or disagrees with the page count seen so far
    pub fn add_page(&mut self, wire: &str) -> bool {
        let chunk = match parse_chunk(wire, &self.tag) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!("Rejected QR chunk: {e}");
                return false;
            }
        };
        if self.pages != 0 && chunk.pages != self.pages {
            tracing::debug!("Rejected QR chunk for {} pages, expected {}", chunk.pages, self.pages);
            return false;
        }
        self.pages = chunk.pages;
        self.chunks.insert(chunk.index, chunk);
        true
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn collected(&self) -> usize {
        self.chunks.len()
    }

    pub fn has_all_pages(&self) -> bool {
        self.pages >= 1 && self.chunks.len() == self.pages
    }

    pub fn reassemble(&self) -> Result<String> {
        if !self.has_all_pages() {
            return Err(Error::ChunkMismatch(format!(
                "{} of {} pages collected",
                self.chunks.len(),
                self.pages
            )));
        }
        let mut payload = String::new();
        for chunk in self.chunks.values() {
            if chunk.pages != self.pages {
                return Err(Error::ChunkMismatch("QR code chunk sizes differ".to_string()));
            }
            payload.push_str(&chunk.data);
        }
        Ok(payload)
    }
}

/// Reassembles a complete set of chunks in one go
pub fn join_chunks<S: AsRef<str>>(chunks: &[S], tag: &str) -> Result<String> {
    let mut collector = PagesCollector::new(tag);
    for chunk in chunks {
        if !collector.add_page(chunk.as_ref()) {
            return Err(Error::ChunkMismatch(format!("Not a matching {tag} chunk")));
        }
    }
    collector.reassemble()
}
