//! Compression framing of data channel payloads.
//!
//! Nothing is ever compressed; the framing only tells the peer that the
//! payload is uncompressed, in the form the negotiated option expects.

use serde::{Deserialize, Serialize};

use crate::error::DataPathError;

/// `comp-lzo` marker of an uncompressed payload.
pub const NO_COMPRESS: u8 = 0xfa;

/// `compress` stub marker; the displaced first byte moves to the tail.
pub const NO_COMPRESS_SWAP: u8 = 0xfb;

/// LZO compressed payload marker.
pub const LZO_COMPRESS: u8 = 0x66;

/// LZ4 compressed payload marker (swap framing).
pub const LZ4_COMPRESS: u8 = 0x69;

/// `compress` v2 escape byte.
pub const V2_INDICATOR: u8 = 0x50;

/// Second byte of an escaped v2 uncompressed payload.
pub const V2_UNCOMPRESSED: u8 = 0x00;

/// Compression framing negotiated for the data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionFraming {
    /// No framing byte
    #[default]
    Disabled,
    /// `comp-lzo`: one leading marker byte
    CompLzo,
    /// `compress`: marker swapped with the first payload byte
    Compress,
    /// `compress` v2: escape only payloads starting with the indicator
    CompressV2,
}

impl CompressionFraming {
    /// Append `payload` to `out` with framing applied.
    pub fn frame(&self, payload: &[u8], out: &mut Vec<u8>) {
        match self {
            Self::Disabled => out.extend_from_slice(payload),
            Self::CompLzo => {
                out.push(NO_COMPRESS);
                out.extend_from_slice(payload);
            }
            Self::Compress => match payload.split_first() {
                Some((first, rest)) => {
                    out.push(NO_COMPRESS_SWAP);
                    out.extend_from_slice(rest);
                    out.push(*first);
                }
                None => out.push(NO_COMPRESS_SWAP),
            },
            Self::CompressV2 => {
                if payload.first() == Some(&V2_INDICATOR) {
                    out.push(V2_INDICATOR);
                    out.push(V2_UNCOMPRESSED);
                }
                out.extend_from_slice(payload);
            }
        }
    }

    /// Strip framing from `framed`.
    ///
    /// # Errors
    ///
    /// `DataPathError::Compression` for compressed or unknown markers.
    pub fn unframe(&self, framed: &[u8]) -> std::result::Result<Vec<u8>, DataPathError> {
        match self {
            Self::Disabled => Ok(framed.to_vec()),
            Self::CompLzo => match framed.split_first() {
                Some((&NO_COMPRESS, rest)) => Ok(rest.to_vec()),
                _ => Err(DataPathError::Compression),
            },
            Self::Compress => match framed.split_first() {
                Some((&NO_COMPRESS, rest)) => Ok(rest.to_vec()),
                Some((&NO_COMPRESS_SWAP, [])) => Ok(Vec::new()),
                Some((&NO_COMPRESS_SWAP, rest)) => {
                    let (last, body) = rest.split_last().ok_or(DataPathError::Compression)?;
                    let mut out = Vec::with_capacity(rest.len());
                    out.push(*last);
                    out.extend_from_slice(body);
                    Ok(out)
                }
                _ => Err(DataPathError::Compression),
            },
            Self::CompressV2 => match framed {
                [V2_INDICATOR, V2_UNCOMPRESSED, rest @ ..] => Ok(rest.to_vec()),
                [V2_INDICATOR, ..] => Err(DataPathError::Compression),
                _ => Ok(framed.to_vec()),
            },
        }
    }

    /// Whether the options string announces compression.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}
