//! Writers for synthetic Open Ephys files.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use openephys_importer::continuous::RECORD_MARKER;
use openephys_importer::events::EVENT_RECORD_BYTES;
use openephys_importer::header::HEADER_BYTES;
use openephys_importer::{ExperimentSettings, ProcessorIds, RecordFormat};

pub const SAMPLE_RATE: f64 = 100.0;
pub const START: i64 = 1000;
pub const BLOCK_LENGTH: usize = 10;
pub const RECORDS: usize = 10;
pub const NUM_CHANNELS: u32 = 4;
pub const BIT_VOLTS: f64 = 0.195;

pub const ACQUISITION: u16 = 100;
pub const SYNC: u16 = 105;
pub const TRACKING: u16 = 110;

pub fn header_block(pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut text = String::new();
    for (key, value) in pairs {
        text.push_str(&format!("header.{key} = {value};\n"));
    }
    let mut block = text.into_bytes();
    block.resize(HEADER_BYTES, b' ');
    block
}

pub fn continuous_record(timestamp: i64, samples: &[i16]) -> Vec<u8> {
    let mut record = Vec::new();
    record.extend_from_slice(&timestamp.to_le_bytes());
    record.extend_from_slice(&(samples.len() as u16).to_le_bytes());
    record.extend_from_slice(&0u16.to_be_bytes());
    for s in samples {
        record.extend_from_slice(&s.to_be_bytes());
    }
    record.extend_from_slice(&RECORD_MARKER);
    record
}

/// Writes a `.continuous` file made of `(timestamp, samples)` records.
pub fn write_continuous(
    path: &Path,
    bit_volts: f64,
    sample_rate: f64,
    records: &[(i64, Vec<i16>)],
) -> PathBuf {
    let block = records.first().map(|r| r.1.len()).unwrap_or(BLOCK_LENGTH).to_string();
    let bit_volts = bit_volts.to_string();
    let rate = sample_rate.to_string();
    let mut bytes = header_block(&[
        ("format", "'Open Ephys Data Format'"),
        ("version", "0.4"),
        ("header_bytes", "1024"),
        ("bitVolts", &bit_volts),
        ("blockLength", &block),
        ("sampleRate", &rate),
    ]);
    for (ts, samples) in records {
        bytes.extend(continuous_record(*ts, samples));
    }
    fs::write(path, bytes).unwrap();
    path.to_path_buf()
}

/// Raw count of `channel` at sample `index` in the synthetic recording.
pub fn raw_sample(channel: u32, index: usize) -> i16 {
    channel as i16 * 100 + index as i16 - 50
}

/// Writes one file per channel: `RECORDS` full records starting at
/// `START`, then a zero-padded trailing record.
pub fn write_channel_files(dir: &Path) -> Vec<PathBuf> {
    (0..NUM_CHANNELS)
        .map(|ch| {
            let mut records: Vec<(i64, Vec<i16>)> = (0..RECORDS)
                .map(|r| {
                    let samples = (0..BLOCK_LENGTH)
                        .map(|j| raw_sample(ch, r * BLOCK_LENGTH + j))
                        .collect();
                    (START + (r * BLOCK_LENGTH) as i64, samples)
                })
                .collect();
            records.push((START + (RECORDS * BLOCK_LENGTH) as i64, vec![0; BLOCK_LENGTH]));
            write_continuous(
                &dir.join(format!("100_CH{}.continuous", ch + 1)),
                BIT_VOLTS,
                SAMPLE_RATE,
                &records,
            )
        })
        .collect()
}

pub struct Spike {
    pub timestamp: i64,
    pub source: u16,
    pub cluster: u16,
    /// [channel][sample], raw counts around 32768
    pub waveform: Vec<Vec<u16>>,
}

pub fn spike_record(spike: &Spike) -> Vec<u8> {
    let num_channels = spike.waveform.len() as u16;
    let num_samples = spike.waveform.first().map(Vec::len).unwrap_or(0) as u16;
    let mut bytes = vec![4u8];
    bytes.extend_from_slice(&spike.timestamp.to_le_bytes());
    bytes.extend_from_slice(&0i64.to_le_bytes());
    bytes.extend_from_slice(&spike.source.to_le_bytes());
    bytes.extend_from_slice(&num_channels.to_le_bytes());
    bytes.extend_from_slice(&num_samples.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(&spike.source.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(&[0, 255, 0]);
    bytes.extend_from_slice(&0f32.to_le_bytes());
    bytes.extend_from_slice(&0f32.to_le_bytes());
    bytes.extend_from_slice(&(SAMPLE_RATE as u16).to_le_bytes());
    for channel in &spike.waveform {
        for s in channel {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
    }
    for _ in 0..num_channels {
        bytes.extend_from_slice(&1000f32.to_le_bytes());
    }
    for _ in 0..num_channels {
        bytes.extend_from_slice(&40u16.to_le_bytes());
    }
    bytes.extend_from_slice(&spike.cluster.to_le_bytes());
    bytes
}

pub fn write_spikes(path: &Path, num_channels: usize, spikes: &[Spike]) -> PathBuf {
    let channels = num_channels.to_string();
    let rate = SAMPLE_RATE.to_string();
    let mut bytes = header_block(&[
        ("version", "0.4"),
        ("num_channels", &channels),
        ("sampleRate", &rate),
    ]);
    for s in spikes {
        bytes.extend(spike_record(s));
    }
    fs::write(path, bytes).unwrap();
    path.to_path_buf()
}

/// A TTL event as `(timestamp, node_id, channel)`.
pub fn write_events(path: &Path, ttl: &[(i64, u8, u8)]) -> PathBuf {
    let rate = SAMPLE_RATE.to_string();
    let mut bytes = header_block(&[("version", "0.4"), ("sampleRate", &rate)]);
    for &(ts, node, chan) in ttl {
        let before = bytes.len();
        bytes.extend_from_slice(&ts.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&[3, node, 1, chan]);
        bytes.extend_from_slice(&0u16.to_le_bytes());
        debug_assert_eq!(bytes.len() - before, EVENT_RECORD_BYTES);
    }
    fs::write(path, bytes).unwrap();
    path.to_path_buf()
}

/// Writes a version 1.0 `.npy` file.
pub fn write_npy(path: &Path, descr: &str, shape: &[usize], payload: &[u8]) -> PathBuf {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    let shape = match dims.len() {
        1 => format!("({},)", dims[0]),
        _ => format!("({})", dims.join(", ")),
    };
    let mut dict = format!("{{'descr': '{descr}', 'fortran_order': False, 'shape': {shape}, }}");
    while (10 + dict.len() + 1) % 64 != 0 {
        dict.push(' ');
    }
    dict.push('\n');

    let mut bytes = b"\x93NUMPY\x01\x00".to_vec();
    bytes.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    bytes.extend_from_slice(dict.as_bytes());
    bytes.extend_from_slice(payload);
    fs::write(path, bytes).unwrap();
    path.to_path_buf()
}

pub fn i64_payload(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn write_sync_messages(path: &Path) -> PathBuf {
    let text = format!(
        "Software time: 1561978917183@1000Hz\n\
         Processor: Rhythm FPGA Id: {ACQUISITION} subProcessor: 0 start time: {START}@{SAMPLE_RATE}Hz\n"
    );
    fs::write(path, text).unwrap();
    path.to_path_buf()
}

pub fn settings(format: RecordFormat) -> ExperimentSettings {
    ExperimentSettings {
        format,
        channel_gains: (0..NUM_CHANNELS).map(|ch| (ch, BIT_VOLTS)).collect::<BTreeMap<_, _>>(),
        processors: ProcessorIds {
            acquisition: Some(ACQUISITION),
            tracking: Some(TRACKING),
            sync: Some(SYNC),
            stimulator: None,
        },
        date: Some("14 Mar 2018 10:22:31".to_string()),
    }
}
