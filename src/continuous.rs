use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use memmap2::Mmap;
use ndarray::{Array1, Array2};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{OpenEphysError, Result};
use crate::header::{read_header, Header, HEADER_BYTES};
use crate::types::{SampleFormat, SignalMatrix};

/// Sentinel closing every continuous record
pub const RECORD_MARKER: [u8; 10] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 255];

// Timestamp (8) + sample count (2) + recording number (2) + marker (10)
const RECORD_OVERHEAD: usize = 22;
const PRINT_PROGRESS_STEP: usize = 10;

/// Options controlling which records of a `.continuous` file are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuousReadOptions {
    /// First record to read (default: 0)
    pub start_record: Option<usize>,
    /// One past the last record to read (default: end of file)
    pub stop_record: Option<usize>,
    /// Skip the final record, which is usually a zero-padded partial block
    pub ignore_last_record: bool,
    /// Scale samples to microvolts or keep raw counts
    pub sample_format: SampleFormat,
}

impl Default for ContinuousReadOptions {
    fn default() -> Self {
        Self {
            start_record: None,
            stop_record: None,
            ignore_last_record: true,
            sample_format: SampleFormat::Microvolts,
        }
    }
}

/// Samples of a single channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSamples {
    Raw(Array1<i16>),
    Microvolts(Array1<f64>),
}

impl ChannelSamples {
    pub fn len(&self) -> usize {
        match self {
            ChannelSamples::Raw(s) => s.len(),
            ChannelSamples::Microvolts(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decoded content of one `.continuous` file.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuousChannel {
    pub header: Header,
    /// First sample number of each record read
    pub timestamps: Array1<i64>,
    /// Concatenated samples of all records read
    pub samples: ChannelSamples,
    /// Recording number of each record read
    pub recording_numbers: Array1<u16>,
}

impl ContinuousChannel {
    /// Expands the per-record timestamps into one timestamp per sample.
    pub fn sample_timestamps(&self) -> Result<Array1<i64>> {
        Ok(expand_record_timestamps(
            &self.timestamps,
            self.header.block_length()?,
        ))
    }
}

/// Decoded per-channel (legacy) layout, one row per channel file.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFiles {
    pub headers: Vec<Header>,
    /// [num_channels, num_samples]
    pub samples: SignalMatrix,
    /// Record timestamps of the first channel
    pub timestamps: Array1<i64>,
    pub block_length: usize,
}

/// Bytes taken by one record holding `block_length` samples.
pub fn record_length(block_length: usize) -> usize {
    2 * block_length + RECORD_OVERHEAD
}

/// Number of complete records following the header.
pub fn number_of_records(file_length: u64, block_length: usize) -> usize {
    let data_bytes = file_length.saturating_sub(HEADER_BYTES as u64);
    (data_bytes / record_length(block_length) as u64) as usize
}

/// Turns one timestamp per record into one timestamp per sample.
pub fn expand_record_timestamps(record_timestamps: &Array1<i64>, block_length: usize) -> Array1<i64> {
    let mut out = Array1::zeros(record_timestamps.len() * block_length);
    for (i, &ts) in record_timestamps.iter().enumerate() {
        for j in 0..block_length {
            out[i * block_length + j] = ts + j as i64;
        }
    }
    out
}

/// Loads a single `.continuous` file.
///
/// # Examples
///
/// ```no_run
/// use openephys_importer::continuous::{read_continuous_file, ContinuousReadOptions};
///
/// let channel = read_continuous_file("100_CH1.continuous", &ContinuousReadOptions::default()).unwrap();
/// println!("{} records", channel.timestamps.len());
/// ```
pub fn read_continuous_file<P: AsRef<Path>>(
    file_path: P,
    options: &ContinuousReadOptions,
) -> Result<ContinuousChannel> {
    let tic = Instant::now();

    let file = File::open(file_path.as_ref())?;
    let file_size = file.metadata()?.len();
    let mut reader = BufReader::with_capacity(65536, file);

    let channel = decode_continuous(&mut reader, file_size, options)?;

    info!(
        path = %file_path.as_ref().display(),
        records = channel.timestamps.len(),
        samples = channel.samples.len(),
        elapsed_s = tic.elapsed().as_secs_f64(),
        "decoded continuous file"
    );

    Ok(channel)
}

/// Decodes a `.continuous` byte source positioned at offset 0.
pub fn decode_continuous<R: Read + Seek>(
    reader: &mut R,
    file_size: u64,
    options: &ContinuousReadOptions,
) -> Result<ContinuousChannel> {
    let header = read_header(reader)?;
    let block_length = header.block_length()?;
    let bit_volts = match options.sample_format {
        SampleFormat::Microvolts => Some(header.bit_volts()?),
        SampleFormat::Raw => None,
    };

    let record_len = record_length(block_length);
    let num_records = number_of_records(file_size, block_length);
    let start = options.start_record.unwrap_or(0);
    let stop = options.stop_record.unwrap_or(num_records).min(num_records);
    let to_read = stop.saturating_sub(start);

    reader.seek(SeekFrom::Start(
        HEADER_BYTES as u64 + (start * record_len) as u64,
    ))?;

    let mut timestamps = Vec::with_capacity(to_read);
    let mut recording_numbers = Vec::with_capacity(to_read);
    let mut raw = Vec::with_capacity(to_read * block_length);
    let mut buffer = vec![0u8; record_len];

    let last_record_offset = file_size.checked_sub(record_len as u64);
    let mut percent_done = PRINT_PROGRESS_STEP;

    for i in 0..to_read {
        let position = HEADER_BYTES as u64 + ((start + i) * record_len) as u64;
        if options.ignore_last_record && Some(position) == last_record_offset {
            break;
        }

        reader.read_exact(&mut buffer)?;
        let record = read_one_record(&buffer, block_length, start + i, &mut raw)?;
        timestamps.push(record.0);
        recording_numbers.push(record.1);

        let progress = (i as f64 / to_read as f64) * 100.0;
        if progress >= percent_done as f64 {
            debug!("{}% done...", percent_done);
            percent_done += PRINT_PROGRESS_STEP;
        }
    }

    let timestamps = Array1::from(timestamps);
    check_timestamps(&timestamps, block_length);

    let samples = match bit_volts {
        Some(scale) => ChannelSamples::Microvolts(scale_samples(&raw, scale)),
        None => ChannelSamples::Raw(Array1::from(raw)),
    };

    Ok(ContinuousChannel {
        header,
        timestamps,
        samples,
        recording_numbers: Array1::from(recording_numbers),
    })
}

/// Parses one record held in `buffer`, appending its samples to `samples`.
///
/// Returns the record timestamp and recording number.
fn read_one_record(
    buffer: &[u8],
    block_length: usize,
    index: usize,
    samples: &mut Vec<i16>,
) -> Result<(i64, u16)> {
    let timestamp = LittleEndian::read_i64(&buffer[0..8]);

    let count = LittleEndian::read_u16(&buffer[8..10]) as usize;
    if count != block_length {
        return Err(OpenEphysError::corrupt(
            index,
            format!("sample count {count} does not match block length {block_length}"),
        ));
    }

    let recording_number = BigEndian::read_u16(&buffer[10..12]);

    let data_end = 12 + 2 * block_length;
    samples.extend(
        buffer[12..data_end]
            .chunks_exact(2)
            .map(BigEndian::read_i16),
    );

    if buffer[data_end..data_end + RECORD_MARKER.len()] != RECORD_MARKER {
        return Err(OpenEphysError::corrupt(index, "record marker mismatch"));
    }

    Ok((timestamp, recording_number))
}

/// Scales raw counts to microvolts
fn scale_samples(raw: &[i16], bit_volts: f64) -> Array1<f64> {
    raw.iter().map(|&x| f64::from(x) * bit_volts).collect()
}

// Records should follow each other by exactly one block
fn check_timestamps(timestamps: &Array1<i64>, block_length: usize) {
    let num_gaps = timestamps
        .windows(2)
        .into_iter()
        .filter(|window| window[1] - window[0] != block_length as i64)
        .count();

    if num_gaps > 0 {
        warn!(
            gaps = num_gaps,
            "gaps in record timestamps found, time scale will not be uniform"
        );
    }
}

/// Loads one `.continuous` file per channel and stacks them into a matrix.
///
/// Every file must hold the same number of samples.
pub fn read_channel_files<P: AsRef<Path>>(
    file_paths: &[P],
    options: &ContinuousReadOptions,
) -> Result<ChannelFiles> {
    let mut headers = Vec::with_capacity(file_paths.len());
    let mut rows: Vec<ChannelSamples> = Vec::with_capacity(file_paths.len());
    let mut timestamps = Array1::zeros(0);
    let mut block_length = 0;

    for (i, path) in file_paths.iter().enumerate() {
        let channel = read_continuous_file(path, options)?;
        if let Some(first) = rows.first() {
            if channel.samples.len() != first.len() {
                return Err(OpenEphysError::ChannelLengthMismatch {
                    channel: i,
                    expected: first.len(),
                    found: channel.samples.len(),
                });
            }
        } else {
            timestamps = channel.timestamps.clone();
            block_length = channel.header.block_length()?;
        }
        headers.push(channel.header);
        rows.push(channel.samples);
    }

    let num_samples = rows.first().map(ChannelSamples::len).unwrap_or(0);
    let samples = stack_rows(rows, num_samples, options.sample_format)?;

    Ok(ChannelFiles {
        headers,
        samples,
        timestamps,
        block_length,
    })
}

fn stack_rows(
    rows: Vec<ChannelSamples>,
    num_samples: usize,
    format: SampleFormat,
) -> Result<SignalMatrix> {
    let num_channels = rows.len();
    match format {
        SampleFormat::Microvolts => {
            let mut matrix = Array2::<f64>::zeros((num_channels, num_samples));
            for (ch, row) in rows.into_iter().enumerate() {
                if let ChannelSamples::Microvolts(values) = row {
                    matrix.row_mut(ch).assign(&values);
                }
            }
            Ok(SignalMatrix::Microvolts(matrix))
        }
        SampleFormat::Raw => {
            let mut matrix = Array2::<i16>::zeros((num_channels, num_samples));
            for (ch, row) in rows.into_iter().enumerate() {
                if let ChannelSamples::Raw(values) = row {
                    matrix.row_mut(ch).assign(&values);
                }
            }
            Ok(SignalMatrix::Raw(matrix))
        }
    }
}

/// How the interleaved `continuous.dat` file is brought into memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinaryReadMode {
    /// Map the file and decode from the mapped view
    #[default]
    MemoryMapped,
    /// Stream the file through a buffered reader
    Buffered,
}

/// Loads an interleaved `[num_samples][num_channels]` int16 file.
///
/// Returns raw counts shaped [num_channels, num_samples]. A trailing
/// partial frame is ignored.
pub fn read_binary_file<P: AsRef<Path>>(
    file_path: P,
    num_channels: usize,
    mode: BinaryReadMode,
) -> Result<Array2<i16>> {
    if num_channels == 0 {
        return Err(OpenEphysError::InvalidArgument(
            "binary continuous data needs at least one channel".to_string(),
        ));
    }

    let file = File::open(file_path.as_ref())?;
    let file_size = file.metadata()?.len() as usize;
    let num_samples = file_size / (num_channels * 2);
    info!(
        path = %file_path.as_ref().display(),
        num_samples,
        num_channels,
        "reading binary continuous data"
    );

    match mode {
        BinaryReadMode::MemoryMapped => {
            if num_samples == 0 {
                return Ok(Array2::zeros((num_channels, 0)));
            }
            // SAFETY: the map is read-only and dropped before returning
            let mmap = unsafe { Mmap::map(&file)? };
            Ok(deinterleave_bytes(&mmap, num_channels, num_samples))
        }
        BinaryReadMode::Buffered => {
            let mut reader = BufReader::with_capacity(65536, file);
            decode_interleaved(&mut reader, num_channels, num_samples)
        }
    }
}

fn deinterleave_bytes(bytes: &[u8], num_channels: usize, num_samples: usize) -> Array2<i16> {
    Array2::from_shape_fn((num_channels, num_samples), |(ch, s)| {
        let idx = 2 * (s * num_channels + ch);
        LittleEndian::read_i16(&bytes[idx..idx + 2])
    })
}

/// Decodes `num_samples` interleaved frames from a reader.
pub fn decode_interleaved<R: Read>(
    reader: &mut R,
    num_channels: usize,
    num_samples: usize,
) -> Result<Array2<i16>> {
    let mut dest = Array2::<i16>::zeros((num_channels, num_samples));
    let mut frame = vec![0i16; num_channels];

    for s in 0..num_samples {
        reader.read_i16_into::<LittleEndian>(&mut frame)?;
        for (ch, &value) in frame.iter().enumerate() {
            dest[[ch, s]] = value;
        }
    }

    Ok(dest)
}

#[cfg(test)]
pub(crate) fn continuous_record(timestamp: i64, recording_number: u16, samples: &[i16]) -> Vec<u8> {
    let mut record = Vec::with_capacity(record_length(samples.len()));
    record.extend_from_slice(&timestamp.to_le_bytes());
    record.extend_from_slice(&(samples.len() as u16).to_le_bytes());
    record.extend_from_slice(&recording_number.to_be_bytes());
    for s in samples {
        record.extend_from_slice(&s.to_be_bytes());
    }
    record.extend_from_slice(&RECORD_MARKER);
    record
}
