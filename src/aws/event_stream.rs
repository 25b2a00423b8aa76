// Decoder for the binary `application/vnd.amazon.eventstream` framing

use anyhow::{bail, Result};
use bytes::{Buf, Bytes, BytesMut};
use once_cell::sync::Lazy;
use std::collections::HashMap;

const PRELUDE_LEN: usize = 12;
const CRC_LEN: usize = 4;
const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

static CRC32_TABLE: Lazy<[u32; 256]> = Lazy::new(|| {
    let mut table = [0u32; 256];
    for (i, entry) in table.iter_mut().enumerate() {
        let mut crc = i as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
        }
        *entry = crc;
    }
    table
});

pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for byte in data {
        crc = CRC32_TABLE[((crc ^ *byte as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    !crc
}

/// One decoded frame. Only string-valued headers are retained.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub headers: HashMap<String, String>,
    pub payload: Bytes,
}

impl Message {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|v| v.as_str())
    }

    pub fn message_type(&self) -> &str {
        self.header(":message-type").unwrap_or("event")
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header(":event-type")
    }

    pub fn exception_type(&self) -> Option<&str> {
        self.header(":exception-type")
    }
}

/// Incremental decoder; feed it network chunks of any size
#[derive(Debug, Default)]
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Message>> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();
        while let Some(message) = self.next_message()? {
            messages.push(message);
        }
        Ok(messages)
    }

    /// Bytes received but not yet forming a whole frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn next_message(&mut self) -> Result<Option<Message>> {
        if self.buffer.len() < PRELUDE_LEN {
            return Ok(None);
        }
        let total_len = read_u32(&self.buffer[0..4]) as usize;
        let headers_len = read_u32(&self.buffer[4..8]) as usize;
        let prelude_crc = read_u32(&self.buffer[8..12]);

        if crc32(&self.buffer[0..8]) != prelude_crc {
            bail!("event stream prelude checksum mismatch");
        }
        if total_len < PRELUDE_LEN + CRC_LEN + headers_len || total_len > MAX_MESSAGE_LEN {
            bail!("invalid event stream frame length {}", total_len);
        }
        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let frame = self.buffer.split_to(total_len).freeze();
        let message_crc = read_u32(&frame[total_len - CRC_LEN..]);
        if crc32(&frame[..total_len - CRC_LEN]) != message_crc {
            bail!("event stream message checksum mismatch");
        }

        let headers = parse_headers(&frame[PRELUDE_LEN..PRELUDE_LEN + headers_len])?;
        let payload = frame.slice(PRELUDE_LEN + headers_len..total_len - CRC_LEN);
        Ok(Some(Message { headers, payload }))
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn parse_headers(mut raw: &[u8]) -> Result<HashMap<String, String>> {
    let mut headers = HashMap::new();
    while raw.has_remaining() {
        let name_len = raw.get_u8() as usize;
        ensure_remaining(raw, name_len + 1)?;
        let name = String::from_utf8_lossy(&raw[..name_len]).into_owned();
        raw.advance(name_len);

        let value_type = raw.get_u8();
        let value_len = match value_type {
            // bool true / bool false carry no value bytes
            0 | 1 => 0,
            2 => 1,
            3 => 2,
            4 => 4,
            5 | 8 => 8,
            9 => 16,
            6 | 7 => {
                ensure_remaining(raw, 2)?;
                raw.get_u16() as usize
            }
            other => bail!("unknown event stream header type {}", other),
        };
        ensure_remaining(raw, value_len)?;
        if value_type == 7 {
            headers.insert(name, String::from_utf8_lossy(&raw[..value_len]).into_owned());
        }
        raw.advance(value_len);
    }
    Ok(headers)
}

fn ensure_remaining(raw: &[u8], needed: usize) -> Result<()> {
    if raw.len() < needed {
        bail!("truncated event stream header");
    }
    Ok(())
}
