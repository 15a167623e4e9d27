use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// XOR scrambling method applied to every link packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum XorMethod {
    /// XOR with a repeating mask
    XorMask(Vec<u8>),
    /// XOR each byte with its 1-based position
    XorPtrPos,
    /// Reverse everything after the first byte
    Reverse,
    /// `XorPtrPos`, `Reverse` and `XorMask` combined
    Obfuscate(Vec<u8>),
}

/// Direction a packet travels through the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards the server
    Outbound,
    /// From the server
    Inbound,
}

impl XorMethod {
    /// Apply the method in place.
    pub fn apply(&self, data: &mut [u8], direction: Direction) {
        match self {
            Self::XorMask(mask) => xor_mask(data, mask),
            Self::XorPtrPos => xor_ptr_pos(data),
            Self::Reverse => reverse(data),
            Self::Obfuscate(mask) => match direction {
                Direction::Outbound => {
                    xor_ptr_pos(data);
                    reverse(data);
                    xor_mask(data, mask);
                }
                Direction::Inbound => {
                    xor_mask(data, mask);
                    reverse(data);
                    xor_ptr_pos(data);
                }
            },
        }
    }
}

fn xor_mask(data: &mut [u8], mask: &[u8]) {
    if mask.is_empty() {
        return;
    }
    for (byte, m) in data.iter_mut().zip(mask.iter().cycle()) {
        *byte ^= m;
    }
}

fn xor_ptr_pos(data: &mut [u8]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= ((i + 1) & 0xff) as u8;
    }
}

fn reverse(data: &mut [u8]) {
    if data.len() > 1 {
        data[1..].reverse();
    }
}

impl fmt::Display for XorMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::XorMask(mask) => write!(f, "xormask {}", String::from_utf8_lossy(mask)),
            Self::XorPtrPos => f.write_str("xorptrpos"),
            Self::Reverse => f.write_str("reverse"),
            Self::Obfuscate(mask) => write!(f, "obfuscate {}", String::from_utf8_lossy(mask)),
        }
    }
}

/// Parses `scramble` arguments, e.g. `xormask secret` or `reverse`.
impl FromStr for XorMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().splitn(2, ' ');
        let method = parts.next().unwrap_or_default();
        let mask = parts.next().map(|m| m.as_bytes().to_vec());
        match (method, mask) {
            ("xormask", Some(mask)) => Ok(Self::XorMask(mask)),
            ("obfuscate", Some(mask)) => Ok(Self::Obfuscate(mask)),
            ("xorptrpos", None) => Ok(Self::XorPtrPos),
            ("reverse", None) => Ok(Self::Reverse),
            _ => Err(Error::config(format!("invalid scramble method '{}'", s))),
        }
    }
}

impl TryFrom<String> for XorMethod {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<XorMethod> for String {
    fn from(method: XorMethod) -> Self {
        method.to_string()
    }
}
