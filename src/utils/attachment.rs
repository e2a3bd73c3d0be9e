//! Box attachments: a note a wallet stores in R9 of an output, serialized as
//! the sigma constant `(Coll[Byte], (Int, Coll[Byte]))` holding the magic
//! bytes, the content type and the content.

use anyhow::Result;

use crate::types::TxBox;

const ATTACHMENT_REGISTER: &str = "R9";
const MAGIC: [u8; 3] = [0x50, 0x52, 0x50];
// (Coll[Byte], (Int, Coll[Byte]))
const TYPE_HEADER: [u8; 4] = [0x3c, 0x0e, 0x40, 0x0e];
const PLAIN_TEXT: i32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BoxAttachment {
    PlainText(String),
    Other { content_type: i32, content: Vec<u8> },
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| anyhow::anyhow!("Unexpected end of register"))?;
        self.pos += 1;
        Ok(b)
    }

    fn vlq(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let b = self.byte()?;
            value |= ((b & 0x7f) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        anyhow::bail!("VLQ overflow")
    }

    fn int(&mut self) -> Result<i32> {
        let v = self.vlq()?;
        let v = ((v >> 1) as i64) ^ -((v & 1) as i64);
        Ok(i32::try_from(v)?)
    }

    fn coll_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.vlq()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| anyhow::anyhow!("Collection longer than register"))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }
}

/// Decodes a serialized R9 constant. `None` when it is some other value.
pub fn decode_attachment(serialized: &[u8]) -> Result<Option<BoxAttachment>> {
    if !serialized.starts_with(&TYPE_HEADER) {
        return Ok(None);
    }
    let mut r = Reader {
        data: serialized,
        pos: TYPE_HEADER.len(),
    };
    if r.coll_bytes()? != MAGIC {
        return Ok(None);
    }
    let content_type = r.int()?;
    let content = r.coll_bytes()?;
    let attachment = match content_type {
        PLAIN_TEXT => BoxAttachment::PlainText(String::from_utf8(content.to_vec())?),
        _ => BoxAttachment::Other {
            content_type,
            content: content.to_vec(),
        },
    };
    Ok(Some(attachment))
}

pub fn attachment(tx_box: &TxBox) -> Option<BoxAttachment> {
    let register = tx_box.registers.get(ATTACHMENT_REGISTER)?;
    let decoded = hex::decode(register.serialized_value())
        .map_err(anyhow::Error::from)
        .and_then(|bytes| decode_attachment(&bytes));
    match decoded {
        Ok(attachment) => attachment,
        Err(e) => {
            tracing::debug!("Unreadable attachment in {:?}: {e}", tx_box.box_id);
            None
        }
    }
}

pub fn attachment_text(tx_box: &TxBox) -> Option<String> {
    match attachment(tx_box)? {
        BoxAttachment::PlainText(text) => Some(text),
        BoxAttachment::Other { .. } => None,
    }
}
