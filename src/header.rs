//! Text header shared by `.continuous`, `.spikes` and `.events` files.
//!
//! The first 1024 bytes of every legacy file hold `;`-separated
//! `header.key = value` pairs.

use std::collections::BTreeMap;
use std::io::Read;

use crate::error::{OpenEphysError, Result};

/// Size of the text header in bytes
pub const HEADER_BYTES: usize = 1024;

/// Oldest file version this crate decodes
pub const MIN_VERSION: f64 = 0.4;

/// First version treated as a future, incompatible layout
pub const UNSUPPORTED_VERSION: f64 = 1.0;

const FLOAT_KEYS: [&str; 2] = ["bitVolts", "sampleRate"];
const INT_KEYS: [&str; 3] = ["blockLength", "bufferSize", "header_bytes"];

/// A single coerced header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Float(f64),
    Int(i64),
    Text(String),
}

/// Parsed key/value header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    entries: BTreeMap<String, HeaderValue>,
}

impl Header {
    /// Parses a header from raw text, coercing the known numeric keys.
    pub fn parse(text: &str) -> Result<Self> {
        let cleaned = text.replace('\n', "").replace("header.", "");
        let mut entries = BTreeMap::new();

        for pair in cleaned.split(';') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            let parsed = if FLOAT_KEYS.contains(&key) {
                HeaderValue::Float(value.parse().map_err(|_| {
                    OpenEphysError::format(format!("header key {key} is not a float: {value:?}"))
                })?)
            } else if INT_KEYS.contains(&key) {
                HeaderValue::Int(value.parse().map_err(|_| {
                    OpenEphysError::format(format!("header key {key} is not an integer: {value:?}"))
                })?)
            } else {
                HeaderValue::Text(value.to_string())
            };
            entries.insert(key.to_string(), parsed);
        }

        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Microvolts per least significant bit
    pub fn bit_volts(&self) -> Result<f64> {
        self.float("bitVolts")
    }

    pub fn sample_rate(&self) -> Result<f64> {
        self.float("sampleRate")
    }

    /// Samples per continuous record
    pub fn block_length(&self) -> Result<usize> {
        let value = self.int("blockLength")?;
        usize::try_from(value)
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| OpenEphysError::format(format!("invalid blockLength {value}")))
    }

    /// Reads an integer stored as text, e.g. `num_channels` in spike headers.
    pub fn text_as_usize(&self, key: &str) -> Result<usize> {
        let text = self.text(key)?;
        text.parse()
            .map_err(|_| OpenEphysError::format(format!("header key {key} is not an integer: {text:?}")))
    }

    /// File format version, with any quoting removed
    pub fn version(&self) -> Result<f64> {
        let text = self.text("version")?;
        text.parse()
            .map_err(|_| OpenEphysError::format(format!("unreadable header version {text:?}")))
    }

    /// Fails with a format error unless the version lies in the supported range.
    pub fn require_supported_version(&self) -> Result<f64> {
        let version = self.version()?;
        if version < MIN_VERSION {
            return Err(OpenEphysError::format(format!(
                "file version {version} is older than {MIN_VERSION}"
            )));
        }
        if version >= UNSUPPORTED_VERSION {
            return Err(OpenEphysError::format(format!(
                "file version {version} is newer than any known layout"
            )));
        }
        Ok(version)
    }

    fn float(&self, key: &str) -> Result<f64> {
        match self.entries.get(key) {
            Some(HeaderValue::Float(v)) => Ok(*v),
            Some(HeaderValue::Int(v)) => Ok(*v as f64),
            Some(HeaderValue::Text(t)) => Err(OpenEphysError::format(format!(
                "header key {key} is not numeric: {t:?}"
            ))),
            None => Err(OpenEphysError::missing(format!("header key {key}"))),
        }
    }

    fn int(&self, key: &str) -> Result<i64> {
        match self.entries.get(key) {
            Some(HeaderValue::Int(v)) => Ok(*v),
            Some(other) => Err(OpenEphysError::format(format!(
                "header key {key} is not an integer: {other:?}"
            ))),
            None => Err(OpenEphysError::missing(format!("header key {key}"))),
        }
    }

    fn text(&self, key: &str) -> Result<String> {
        match self.entries.get(key) {
            Some(HeaderValue::Text(t)) => Ok(t.trim_matches(|c| c == '\'' || c == '"').trim().to_string()),
            Some(HeaderValue::Int(v)) => Ok(v.to_string()),
            Some(HeaderValue::Float(v)) => Ok(v.to_string()),
            None => Err(OpenEphysError::missing(format!("header key {key}"))),
        }
    }
}

/// Reads exactly [`HEADER_BYTES`] from `reader` and parses them.
///
/// Leaves the reader positioned at the first record.
pub fn read_header<R: Read>(reader: &mut R) -> Result<Header> {
    let mut buffer = [0u8; HEADER_BYTES];
    reader.read_exact(&mut buffer)?;

    let text = std::str::from_utf8(&buffer)
        .map_err(|e| OpenEphysError::format(format!("header is not valid UTF-8: {e}")))?;

    // Writers pad the block with spaces or NULs
    Header::parse(text.trim_end_matches('\0'))
}

#[cfg(test)]
pub(crate) fn header_block(pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut text = String::new();
    for (key, value) in pairs {
        text.push_str(&format!("header.{key} = {value};\n"));
    }
    let mut block = text.into_bytes();
    block.resize(HEADER_BYTES, b' ');
    block
}
