//! Payload codecs for the telemetry bridge
//!
//! Outbound payloads are turned into broker-safe text by one of two schemes,
//! selected once at startup:
//!
//! - [`Encoding::Base64`] - reversible standard base64 of the raw payload
//! - [`Encoding::Summary`] - lossy JSON-like counter record built from the
//!   first four payload bytes
//!
//! Inbound control messages are always base64 and are decoded with [`decode`].
//!
//! Both encoders write into a caller-provided [`EncodeBuffer`] whose capacity
//! ([`ENCODE_CAPACITY`]) is a hard contract of this deployment. Payloads are
//! capped at [`MAX_PAYLOAD_SIZE`](crate::queue::MAX_PAYLOAD_SIZE) upstream so the
//! base64 form always fits.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use thiserror::Error;

/// Fixed capacity of the outbound encode buffer in bytes
pub const ENCODE_CAPACITY: usize = 64;

/// Payload encoding scheme, fixed for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Reversible base64 text
    #[default]
    Base64,
    /// Lossy `{'total':..,'ble':..,'wifi':..}` record
    Summary,
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Encoding::Base64 => f.write_str("base64"),
            Encoding::Summary => f.write_str("summary"),
        }
    }
}

/// Codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Encoded payload needs {needed} bytes but buffer holds {capacity}")]
    CapacityExceeded { needed: usize, capacity: usize },
}

/// Caller-provided fixed-capacity output buffer for [`encode`]
///
/// The delivery worker owns one of these and reuses it for every message.
#[derive(Clone)]
pub struct EncodeBuffer {
    buf: [u8; ENCODE_CAPACITY],
    len: usize,
}

impl EncodeBuffer {
    pub fn new() -> Self {
        Self {
            buf: [0u8; ENCODE_CAPACITY],
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        ENCODE_CAPACITY
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Encoded bytes from the last successful [`encode`]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    fn fill(&mut self, bytes: &[u8]) -> Result<usize, CodecError> {
        if bytes.len() > ENCODE_CAPACITY {
            return Err(CodecError::CapacityExceeded {
                needed: bytes.len(),
                capacity: ENCODE_CAPACITY,
            });
        }
        self.buf[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
        Ok(self.len)
    }
}

impl Default for EncodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EncodeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodeBuffer")
            .field("len", &self.len)
            .field("text", &String::from_utf8_lossy(self.as_bytes()))
            .finish()
    }
}

/// Length of the padded base64 form of `len` input bytes
pub fn base64_encoded_len(len: usize) -> usize {
    len.div_ceil(3) * 4
}

/// Encode `payload` into `out` using the selected scheme.
///
/// Returns the number of bytes written. On error `out` is left empty.
pub fn encode(mode: Encoding, payload: &[u8], out: &mut EncodeBuffer) -> Result<usize, CodecError> {
    out.clear();
    match mode {
        Encoding::Base64 => encode_base64(payload, out),
        Encoding::Summary => out.fill(summarize(payload).as_bytes()),
    }
}

fn encode_base64(payload: &[u8], out: &mut EncodeBuffer) -> Result<usize, CodecError> {
    let needed = base64_encoded_len(payload.len());
    if needed > ENCODE_CAPACITY {
        return Err(CodecError::CapacityExceeded {
            needed,
            capacity: ENCODE_CAPACITY,
        });
    }

    let written = BASE64_STANDARD
        .encode_slice(payload, &mut out.buf)
        .map_err(|_| CodecError::CapacityExceeded {
            needed,
            capacity: ENCODE_CAPACITY,
        })?;
    out.len = written;
    Ok(written)
}

/// Build the summary record for a counter payload.
///
/// Bytes 0-1 are the little-endian wifi count. Bytes 2-3 are the ble count,
/// read only when the payload has at least four bytes. Everything after byte 3
/// is ignored.
pub fn summarize(payload: &[u8]) -> String {
    let byte = |i: usize| payload.get(i).copied().unwrap_or(0);

    let wifi = u16::from_le_bytes([byte(0), byte(1)]) as u32;
    let ble = if payload.len() >= 4 {
        u16::from_le_bytes([byte(2), byte(3)]) as u32
    } else {
        0
    };

    let mut text = String::with_capacity(ENCODE_CAPACITY);
    // Writing to a String cannot fail
    let _ = write!(
        text,
        "{{'total':{},'ble':{},'wifi':{}}}",
        wifi + ble,
        ble,
        wifi
    );
    text
}

/// Decode base64 text from an inbound control message.
///
/// The output is sized to the exact decoded length. Malformed input yields an
/// empty vector, never partial output.
pub fn decode(text: &[u8]) -> Vec<u8> {
    let mut decoded = vec![0u8; decoded_len(text)];
    match BASE64_STANDARD.decode_slice(text, &mut decoded) {
        Ok(written) => {
            decoded.truncate(written);
            decoded
        }
        Err(_) => Vec::new(),
    }
}

/// Exact decoded size of well-formed padded base64 `text`
fn decoded_len(text: &[u8]) -> usize {
    let padding = text.iter().rev().take(2).filter(|&&b| b == b'=').count();
    (text.len() / 4 * 3).saturating_sub(padding) + (text.len() % 4) * 3 / 4
}
