//! Minimal NumPy `.npy` reader.
//!
//! Handles format versions 1 to 3 with C-ordered, little-endian (or
//! byte-sized) numeric dtypes and fixed-width byte records. This covers the
//! `timestamps.npy`, `channels.npy` and `data_array.npy` files written next to
//! binary recordings.

use byteorder::{ByteOrder, LittleEndian};
use ndarray::Array2;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::debug;

use crate::error::{OpenEphysError, Result};

const MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Element type of an `.npy` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    /// Opaque fixed-width records (`|V16`, `|S16`), one per element
    Bytes(usize),
}

impl Dtype {
    /// Parses a dtype descriptor such as `<f8` or `|u1`.
    pub fn from_descr(descr: &str) -> Result<Self> {
        let bad = || OpenEphysError::format(format!("unsupported npy dtype {descr:?}"));
        let mut chars = descr.chars();
        let order = chars.next().ok_or_else(bad)?;
        let kind = chars.next().ok_or_else(bad)?;
        let size: usize = chars.as_str().parse().map_err(|_| bad())?;

        let dtype = match (kind, size) {
            ('i', 1) => Dtype::I8,
            ('i', 2) => Dtype::I16,
            ('i', 4) => Dtype::I32,
            ('i', 8) => Dtype::I64,
            ('u', 1) | ('b', 1) => Dtype::U8,
            ('u', 2) => Dtype::U16,
            ('u', 4) => Dtype::U32,
            ('u', 8) => Dtype::U64,
            ('f', 4) => Dtype::F32,
            ('f', 8) => Dtype::F64,
            ('V', n) | ('S', n) if n > 0 => Dtype::Bytes(n),
            _ => return Err(bad()),
        };

        // Big-endian data is only readable when byte order is irrelevant
        match order {
            '<' | '|' => Ok(dtype),
            '>' if dtype.item_size() == 1 || matches!(dtype, Dtype::Bytes(_)) => Ok(dtype),
            _ => Err(bad()),
        }
    }

    pub fn item_size(&self) -> usize {
        match self {
            Dtype::I8 | Dtype::U8 => 1,
            Dtype::I16 | Dtype::U16 => 2,
            Dtype::I32 | Dtype::U32 | Dtype::F32 => 4,
            Dtype::I64 | Dtype::U64 | Dtype::F64 => 8,
            Dtype::Bytes(n) => *n,
        }
    }
}

/// An `.npy` array with its raw little-endian payload.
#[derive(Debug, Clone, PartialEq)]
pub struct NpyArray {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    data: Vec<u8>,
}

impl NpyArray {
    /// Number of elements
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Elements widened to `i64`, in C order.
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        let d = &self.data;
        let values: Vec<i64> = match self.dtype {
            Dtype::I8 => d.iter().map(|&b| i64::from(b as i8)).collect(),
            Dtype::U8 => d.iter().map(|&b| i64::from(b)).collect(),
            Dtype::I16 => d.chunks_exact(2).map(|c| i64::from(LittleEndian::read_i16(c))).collect(),
            Dtype::U16 => d.chunks_exact(2).map(|c| i64::from(LittleEndian::read_u16(c))).collect(),
            Dtype::I32 => d.chunks_exact(4).map(|c| i64::from(LittleEndian::read_i32(c))).collect(),
            Dtype::U32 => d.chunks_exact(4).map(|c| i64::from(LittleEndian::read_u32(c))).collect(),
            Dtype::I64 => d.chunks_exact(8).map(LittleEndian::read_i64).collect(),
            Dtype::U64 => d
                .chunks_exact(8)
                .map(|c| {
                    i64::try_from(LittleEndian::read_u64(c))
                        .map_err(|_| OpenEphysError::format("npy u64 value exceeds i64 range"))
                })
                .collect::<Result<Vec<_>>>()?,
            Dtype::F32 | Dtype::F64 | Dtype::Bytes(_) => {
                return Err(OpenEphysError::format(format!(
                    "npy dtype {:?} is not an integer type",
                    self.dtype
                )))
            }
        };
        Ok(values)
    }

    /// Elements converted to `f64`, in C order.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        match self.dtype {
            Dtype::F32 => Ok(self
                .data
                .chunks_exact(4)
                .map(|c| f64::from(LittleEndian::read_f32(c)))
                .collect()),
            Dtype::F64 => Ok(self.data.chunks_exact(8).map(LittleEndian::read_f64).collect()),
            Dtype::Bytes(_) => Err(OpenEphysError::format("npy byte records are not numeric")),
            _ => Ok(self.to_i64_vec()?.into_iter().map(|v| v as f64).collect()),
        }
    }

    /// Reinterprets the payload as rows of `width` little-endian `f32`.
    ///
    /// Accepts `(n, width)` float arrays as well as arrays whose rows are
    /// `4 * width` raw bytes, either as `(n, 4 * width)` `u1` or `(n,)` records.
    pub fn f32_rows(&self, width: usize) -> Result<Array2<f32>> {
        let row_bytes = 4 * width;
        let byte_rows = match (self.dtype, self.shape.as_slice()) {
            (Dtype::F32, [_, w]) if *w == width => true,
            (Dtype::U8 | Dtype::I8, [_, w]) if *w == row_bytes => true,
            (Dtype::Bytes(n), [_]) if n == row_bytes => true,
            (Dtype::F32 | Dtype::U8 | Dtype::I8 | Dtype::Bytes(_), _) if self.is_empty() => true,
            _ => false,
        };
        if !byte_rows {
            return Err(OpenEphysError::format(format!(
                "npy array {:?} {:?} does not hold rows of {width} f32",
                self.dtype, self.shape
            )));
        }

        let rows = self.data.len() / row_bytes.max(1);
        let values: Vec<f32> = self.data.chunks_exact(4).map(LittleEndian::read_f32).collect();
        Array2::from_shape_vec((rows, width), values)
            .map_err(|e| OpenEphysError::format(format!("npy row layout: {e}")))
    }
}

/// Loads an `.npy` file.
pub fn read_npy<P: AsRef<Path>>(file_path: P) -> Result<NpyArray> {
    let file = File::open(file_path.as_ref())?;
    let mut reader = BufReader::new(file);
    let array = decode_npy(&mut reader)?;
    debug!(
        path = %file_path.as_ref().display(),
        dtype = ?array.dtype,
        shape = ?array.shape,
        "loaded npy array"
    );
    Ok(array)
}

/// Decodes an `.npy` stream.
pub fn decode_npy<R: Read>(reader: &mut R) -> Result<NpyArray> {
    let mut preamble = [0u8; 8];
    reader.read_exact(&mut preamble)?;
    if &preamble[..6] != MAGIC {
        return Err(OpenEphysError::format("missing npy magic string"));
    }

    let header_len = match preamble[6] {
        1 => {
            let mut len = [0u8; 2];
            reader.read_exact(&mut len)?;
            usize::from(LittleEndian::read_u16(&len))
        }
        2 | 3 => {
            let mut len = [0u8; 4];
            reader.read_exact(&mut len)?;
            LittleEndian::read_u32(&len) as usize
        }
        major => {
            return Err(OpenEphysError::format(format!(
                "unsupported npy format version {major}"
            )))
        }
    };

    let mut header = vec![0u8; header_len];
    reader.read_exact(&mut header)?;
    let header = String::from_utf8_lossy(&header);

    let dtype = Dtype::from_descr(quoted_value(&header, "descr")?)?;
    if raw_value(&header, "fortran_order")?.starts_with("True") {
        return Err(OpenEphysError::format("fortran-ordered npy arrays are not supported"));
    }
    let shape = parse_shape(raw_value(&header, "shape")?)?;

    let count: usize = shape.iter().product();
    let mut data = vec![0u8; count * dtype.item_size()];
    reader.read_exact(&mut data)?;

    Ok(NpyArray { dtype, shape, data })
}

/// Text following `'key':` in the header dict
fn raw_value<'a>(header: &'a str, key: &str) -> Result<&'a str> {
    let pattern = format!("'{key}':");
    let start = header
        .find(&pattern)
        .ok_or_else(|| OpenEphysError::format(format!("npy header lacks {key}")))?;
    Ok(header[start + pattern.len()..].trim_start())
}

fn quoted_value<'a>(header: &'a str, key: &str) -> Result<&'a str> {
    let value = raw_value(header, key)?;
    let bad = || OpenEphysError::format(format!("npy header {key} is not a string"));
    let rest = value.strip_prefix('\'').ok_or_else(bad)?;
    let end = rest.find('\'').ok_or_else(bad)?;
    Ok(&rest[..end])
}

fn parse_shape(value: &str) -> Result<Vec<usize>> {
    let bad = || OpenEphysError::format(format!("malformed npy shape {value:?}"));
    let inner = value.strip_prefix('(').ok_or_else(bad)?;
    let end = inner.find(')').ok_or_else(bad)?;

    inner[..end]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.trim_end_matches('L').parse().map_err(|_| bad()))
        .collect()
}

#[cfg(test)]
pub(crate) fn npy_bytes(descr: &str, shape: &[usize], payload: &[u8]) -> Vec<u8> {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    let shape_text = match dims.len() {
        1 => format!("({},)", dims[0]),
        _ => format!("({})", dims.join(", ")),
    };
    let mut dict = format!("{{'descr': '{descr}', 'fortran_order': False, 'shape': {shape_text}, }}");
    while (10 + dict.len() + 1) % 64 != 0 {
        dict.push(' ');
    }
    dict.push('\n');

    let mut bytes = MAGIC.to_vec();
    bytes.extend_from_slice(&[1, 0]);
    bytes.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    bytes.extend_from_slice(dict.as_bytes());
    bytes.extend_from_slice(payload);
    bytes
}
