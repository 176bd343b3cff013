//! `.spikes` file decoding.
//!
//! Each record carries one detected spike with its waveform on every
//! channel of the electrode, followed by per-channel gain and threshold.

use byteorder::{LittleEndian, ReadBytesExt};
use ndarray::{Array1, Array2, Array3};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use tracing::info;

use crate::error::{OpenEphysError, Result};
use crate::header::{read_header, Header, HEADER_BYTES};

/// Waveform samples are stored unsigned around this midpoint
const WAVEFORM_OFFSET: f64 = 32768.0;

// eventType + timestamp + software timestamp + 6 u16 fields + color + 2 f32 + sampleRate
const FIXED_RECORD_BYTES: usize = 1 + 8 + 8 + 6 * 2 + 3 + 2 * 4 + 2;

/// Limits applied while decoding a spike file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpikeReadOptions {
    /// Maximum number of spikes accepted from one file
    pub max_spikes: usize,
}

impl Default for SpikeReadOptions {
    fn default() -> Self {
        Self {
            max_spikes: 1_000_000,
        }
    }
}

/// Decoded content of one `.spikes` file.
#[derive(Debug, Clone, PartialEq)]
pub struct SpikeData {
    pub header: Header,
    /// Waveforms (μV), [spike, sample, channel]
    pub waveforms: Array3<f64>,
    /// Hardware sample number of each spike
    pub timestamps: Array1<i64>,
    /// Electrode (channel group) that detected each spike
    pub source: Array1<u16>,
    pub sorted_id: Array1<u16>,
    pub electrode_id: Array1<u16>,
    pub channel: Array1<u16>,
    /// Per-channel gain, [spike, channel]
    pub gain: Array2<f32>,
    /// Per-channel threshold, [spike, channel]
    pub threshold: Array2<u16>,
    /// Recording number of each spike, used as cluster label
    pub recording_number: Array1<u16>,
    pub num_channels: usize,
    pub samples_per_spike: usize,
}

impl SpikeData {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Distinct cluster labels in ascending order
    pub fn clusters(&self) -> Vec<u16> {
        self.recording_number
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Indices of the spikes belonging to `cluster`
    pub fn cluster_indices(&self, cluster: u16) -> Vec<usize> {
        self.recording_number
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c == cluster)
            .map(|(i, _)| i)
            .collect()
    }

    /// The single source id shared by every spike in the file.
    pub fn group_id(&self) -> Result<Option<u16>> {
        let sources: BTreeSet<u16> = self.source.iter().copied().collect();
        match sources.len() {
            0 => Ok(None),
            1 => Ok(sources.into_iter().next()),
            n => Err(OpenEphysError::format(format!(
                "spike file mixes {n} electrode sources"
            ))),
        }
    }
}

/// Loads a `.spikes` file.
pub fn read_spike_file<P: AsRef<Path>>(file_path: P, options: &SpikeReadOptions) -> Result<SpikeData> {
    let file = File::open(file_path.as_ref())?;
    let file_size = file.metadata()?.len();
    let mut reader = BufReader::with_capacity(65536, file);

    let data = decode_spikes(&mut reader, file_size, options)?;
    info!(
        path = %file_path.as_ref().display(),
        spikes = data.len(),
        channels = data.num_channels,
        "decoded spike file"
    );
    Ok(data)
}

// Per-spike values gathered while reading
struct SpikeBuffers {
    waveforms: Vec<f64>,
    timestamps: Vec<i64>,
    source: Vec<u16>,
    sorted_id: Vec<u16>,
    electrode_id: Vec<u16>,
    channel: Vec<u16>,
    gain: Vec<f32>,
    threshold: Vec<u16>,
    recording_number: Vec<u16>,
}

impl SpikeBuffers {
    fn with_capacity(spikes: usize, num_channels: usize) -> Self {
        Self {
            waveforms: Vec::new(),
            timestamps: Vec::with_capacity(spikes),
            source: Vec::with_capacity(spikes),
            sorted_id: Vec::with_capacity(spikes),
            electrode_id: Vec::with_capacity(spikes),
            channel: Vec::with_capacity(spikes),
            gain: Vec::with_capacity(spikes * num_channels),
            threshold: Vec::with_capacity(spikes * num_channels),
            recording_number: Vec::with_capacity(spikes),
        }
    }
}

/// Decodes a `.spikes` byte source positioned at offset 0.
pub fn decode_spikes<R: Read>(
    reader: &mut R,
    file_size: u64,
    options: &SpikeReadOptions,
) -> Result<SpikeData> {
    let header = read_header(reader)?;
    header.require_supported_version()?;
    let num_channels = header.text_as_usize("num_channels")?;

    let remaining = file_size.saturating_sub(HEADER_BYTES as u64) as usize;
    let min_record = FIXED_RECORD_BYTES + num_channels * (2 + 4 + 2) + 2;
    let capacity = options.max_spikes.min(remaining / min_record.max(1));

    let mut buffers = SpikeBuffers::with_capacity(capacity, num_channels);
    let mut samples_per_spike: Option<usize> = None;
    let mut position = HEADER_BYTES as u64;
    let mut current_spike = 0;

    while position < file_size {
        if current_spike == options.max_spikes {
            return Err(OpenEphysError::CapacityExceeded {
                limit: options.max_spikes,
            });
        }

        let bytes = read_one_spike(
            reader,
            current_spike,
            num_channels,
            &mut samples_per_spike,
            &mut buffers,
        )
        .map_err(|e| truncated_as_corrupt(e, current_spike))?;

        position += bytes as u64;
        current_spike += 1;
    }

    let samples = samples_per_spike.unwrap_or(0);
    let n = current_spike;
    let shape_err = |e: ndarray::ShapeError| OpenEphysError::format(format!("spike array shape: {e}"));

    Ok(SpikeData {
        header,
        waveforms: Array3::from_shape_vec((n, samples, num_channels), buffers.waveforms).map_err(shape_err)?,
        timestamps: Array1::from(buffers.timestamps),
        source: Array1::from(buffers.source),
        sorted_id: Array1::from(buffers.sorted_id),
        electrode_id: Array1::from(buffers.electrode_id),
        channel: Array1::from(buffers.channel),
        gain: Array2::from_shape_vec((n, num_channels), buffers.gain).map_err(shape_err)?,
        threshold: Array2::from_shape_vec((n, num_channels), buffers.threshold).map_err(shape_err)?,
        recording_number: Array1::from(buffers.recording_number),
        num_channels,
        samples_per_spike: samples,
    })
}

fn truncated_as_corrupt(error: OpenEphysError, index: usize) -> OpenEphysError {
    match error {
        OpenEphysError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            OpenEphysError::corrupt(index, "truncated spike record")
        }
        other => other,
    }
}

/// Reads one spike record, returning the number of bytes consumed.
fn read_one_spike<R: Read>(
    reader: &mut R,
    index: usize,
    expected_channels: usize,
    samples_per_spike: &mut Option<usize>,
    out: &mut SpikeBuffers,
) -> Result<usize> {
    let _event_type = reader.read_u8()?;
    let timestamp = reader.read_i64::<LittleEndian>()?;
    let _software_timestamp = reader.read_i64::<LittleEndian>()?;
    let source = reader.read_u16::<LittleEndian>()?;
    let num_channels = reader.read_u16::<LittleEndian>()? as usize;
    let num_samples = reader.read_u16::<LittleEndian>()? as usize;
    let sorted_id = reader.read_u16::<LittleEndian>()?;
    let electrode_id = reader.read_u16::<LittleEndian>()?;
    let channel = reader.read_u16::<LittleEndian>()?;
    let mut color = [0u8; 3];
    reader.read_exact(&mut color)?;
    let mut pc_projection = [0f32; 2];
    reader.read_f32_into::<LittleEndian>(&mut pc_projection)?;
    let _sample_rate = reader.read_u16::<LittleEndian>()?;

    if num_channels != expected_channels {
        return Err(OpenEphysError::corrupt(
            index,
            format!("record has {num_channels} channels, header declares {expected_channels}"),
        ));
    }
    match *samples_per_spike {
        Some(n) if n != num_samples => {
            return Err(OpenEphysError::corrupt(
                index,
                format!("record has {num_samples} samples per spike, expected {n}"),
            ));
        }
        Some(_) => {}
        None => *samples_per_spike = Some(num_samples),
    }

    // Stored as [channel][sample]
    let mut waveform = vec![0u16; num_channels * num_samples];
    reader.read_u16_into::<LittleEndian>(&mut waveform)?;

    let mut gain = vec![0f32; num_channels];
    reader.read_f32_into::<LittleEndian>(&mut gain)?;
    let mut threshold = vec![0u16; num_channels];
    reader.read_u16_into::<LittleEndian>(&mut threshold)?;
    let recording_number = reader.read_u16::<LittleEndian>()?;

    // Transpose to [sample][channel] while converting to microvolts
    for s in 0..num_samples {
        for ch in 0..num_channels {
            let raw = f64::from(waveform[ch * num_samples + s]);
            out.waveforms
                .push((raw - WAVEFORM_OFFSET) / (f64::from(gain[ch]) / 1000.0));
        }
    }

    out.timestamps.push(timestamp);
    out.source.push(source);
    out.sorted_id.push(sorted_id);
    out.electrode_id.push(electrode_id);
    out.channel.push(channel);
    out.gain.extend_from_slice(&gain);
    out.threshold.extend_from_slice(&threshold);
    out.recording_number.push(recording_number);

    Ok(FIXED_RECORD_BYTES + num_channels * num_samples * 2 + num_channels * (4 + 2) + 2)
}

#[cfg(test)]
pub(crate) struct SpikeFixture {
    pub timestamp: i64,
    pub source: u16,
    /// [channel][sample] raw waveform
    pub waveform: Vec<Vec<u16>>,
    pub gain: Vec<f32>,
    pub threshold: Vec<u16>,
    pub recording_number: u16,
}

#[cfg(test)]
pub(crate) fn spike_record(spike: &SpikeFixture) -> Vec<u8> {
    let num_channels = spike.waveform.len() as u16;
    let num_samples = spike.waveform.first().map(Vec::len).unwrap_or(0) as u16;
    let mut bytes = vec![4u8];
    bytes.extend_from_slice(&spike.timestamp.to_le_bytes());
    bytes.extend_from_slice(&0i64.to_le_bytes());
    bytes.extend_from_slice(&spike.source.to_le_bytes());
    bytes.extend_from_slice(&num_channels.to_le_bytes());
    bytes.extend_from_slice(&num_samples.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes()); // sorted id
    bytes.extend_from_slice(&spike.source.to_le_bytes()); // electrode id
    bytes.extend_from_slice(&0u16.to_le_bytes()); // channel
    bytes.extend_from_slice(&[255, 0, 0]);
    bytes.extend_from_slice(&0f32.to_le_bytes());
    bytes.extend_from_slice(&0f32.to_le_bytes());
    bytes.extend_from_slice(&30000u16.to_le_bytes());
    for channel in &spike.waveform {
        for s in channel {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
    }
    for g in &spike.gain {
        bytes.extend_from_slice(&g.to_le_bytes());
    }
    for t in &spike.threshold {
        bytes.extend_from_slice(&t.to_le_bytes());
    }
    bytes.extend_from_slice(&spike.recording_number.to_le_bytes());
    bytes
}
