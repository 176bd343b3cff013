//! `.events` file decoding and TTL edge extraction.
//!
//! Records are fixed 16-byte structs with no corruption sentinel, so a
//! damaged file can decode into nonsense. [`EventData::plausibility`] gives a
//! best-effort diagnostic.

use byteorder::{ByteOrder, LittleEndian};
use ndarray::Array1;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{info, warn};

use crate::error::{OpenEphysError, Result};
use crate::header::{read_header, Header, HEADER_BYTES};
use crate::types::{DigitalSignal, SyncSignal};

/// Bytes per event record: int64, uint16, 4 x uint8, uint16
pub const EVENT_RECORD_BYTES: usize = 16;

/// Event type code of TTL edges
pub const TTL_EVENT: u8 = 3;

/// Digital input lines on the acquisition board
pub const DIGITAL_INPUT_CHANNELS: usize = 8;

/// Decoded content of an `.events` file, as parallel arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    pub header: Header,
    pub timestamps: Array1<i64>,
    pub sample_num: Array1<u16>,
    pub event_type: Array1<u8>,
    pub node_id: Array1<u8>,
    pub event_id: Array1<u8>,
    pub channel: Array1<u8>,
    pub recording_number: Array1<u16>,
}

/// Counts of suspicious values found in an event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlausibilityReport {
    /// Events whose timestamp is smaller than the previous one
    pub non_monotonic: usize,
    /// Events whose channel lies outside the declared range
    pub channel_out_of_range: usize,
}

impl PlausibilityReport {
    pub fn is_clean(&self) -> bool {
        self.non_monotonic == 0 && self.channel_out_of_range == 0
    }
}

impl EventData {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Indices of TTL edges emitted by processor `node_id`, optionally on one channel.
    pub fn ttl_indices(&self, node_id: u8, channel: Option<u8>) -> Vec<usize> {
        (0..self.len())
            .filter(|&i| {
                self.event_type[i] == TTL_EVENT
                    && self.node_id[i] == node_id
                    && channel.map_or(true, |c| self.channel[i] == c)
            })
            .collect()
    }

    /// Distinct channels carrying TTL edges from `node_id`
    pub fn ttl_channels(&self, node_id: u8) -> Vec<u8> {
        self.ttl_indices(node_id, None)
            .into_iter()
            .map(|i| self.channel[i])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Checks timestamp ordering and channel range.
    pub fn plausibility(&self, num_channels: usize) -> PlausibilityReport {
        let non_monotonic = self
            .timestamps
            .windows(2)
            .into_iter()
            .filter(|w| w[1] < w[0])
            .count();
        let channel_out_of_range = self
            .channel
            .iter()
            .filter(|&&c| usize::from(c) >= num_channels)
            .count();
        PlausibilityReport {
            non_monotonic,
            channel_out_of_range,
        }
    }

    fn seconds(&self, indices: &[usize], start_timestamp: i64, sample_rate: f64) -> Array1<f64> {
        indices
            .iter()
            .map(|&i| (self.timestamps[i] - start_timestamp) as f64 / sample_rate)
            .collect()
    }
}

/// Loads an `.events` file.
pub fn read_event_file<P: AsRef<Path>>(file_path: P) -> Result<EventData> {
    let file = File::open(file_path.as_ref())?;
    let file_size = file.metadata()?.len();
    let mut reader = BufReader::with_capacity(65536, file);

    let data = decode_events(&mut reader, file_size)?;
    info!(
        path = %file_path.as_ref().display(),
        events = data.len(),
        "decoded event file"
    );
    Ok(data)
}

/// Decodes an `.events` byte source positioned at offset 0.
pub fn decode_events<R: Read>(reader: &mut R, file_size: u64) -> Result<EventData> {
    let header = read_header(reader)?;
    header.require_supported_version()?;

    let remaining = file_size.saturating_sub(HEADER_BYTES as u64) as usize;
    let num_events = remaining / EVENT_RECORD_BYTES;

    let mut timestamps = Vec::with_capacity(num_events);
    let mut sample_num = Vec::with_capacity(num_events);
    let mut event_type = Vec::with_capacity(num_events);
    let mut node_id = Vec::with_capacity(num_events);
    let mut event_id = Vec::with_capacity(num_events);
    let mut channel = Vec::with_capacity(num_events);
    let mut recording_number = Vec::with_capacity(num_events);

    let mut buffer = [0u8; EVENT_RECORD_BYTES];
    for _ in 0..num_events {
        reader.read_exact(&mut buffer)?;
        timestamps.push(LittleEndian::read_i64(&buffer[0..8]));
        sample_num.push(LittleEndian::read_u16(&buffer[8..10]));
        event_type.push(buffer[10]);
        node_id.push(buffer[11]);
        event_id.push(buffer[12]);
        channel.push(buffer[13]);
        recording_number.push(LittleEndian::read_u16(&buffer[14..16]));
    }

    if remaining % EVENT_RECORD_BYTES != 0 {
        return Err(OpenEphysError::corrupt(num_events, "truncated event record"));
    }

    Ok(EventData {
        header,
        timestamps: Array1::from(timestamps),
        sample_num: Array1::from(sample_num),
        event_type: Array1::from(event_type),
        node_id: Array1::from(node_id),
        event_id: Array1::from(event_id),
        channel: Array1::from(channel),
        recording_number: Array1::from(recording_number),
    })
}

/// Rising edges of the acquisition board's digital inputs.
///
/// Edges alternate rising/falling within each channel, so every second
/// edge starting at the first is kept. Times are relative to
/// `start_timestamp`, in seconds.
pub fn digital_inputs(
    events: &EventData,
    node_id: u8,
    start_timestamp: i64,
    sample_rate: f64,
) -> DigitalSignal {
    let channels = events.ttl_channels(node_id);
    let num_channels = channels
        .iter()
        .map(|&c| usize::from(c) + 1)
        .max()
        .unwrap_or(0)
        .max(DIGITAL_INPUT_CHANNELS);

    let mut times = vec![Array1::zeros(0); num_channels];
    for &chan in &channels {
        let rising: Vec<usize> = events
            .ttl_indices(node_id, Some(chan))
            .into_iter()
            .step_by(2)
            .collect();
        times[usize::from(chan)] = events.seconds(&rising, start_timestamp, sample_rate);
    }

    info!(ttl_channels = ?channels, "extracted digital inputs");
    DigitalSignal {
        channel_ids: (0..num_channels).map(|c| c as u8).collect(),
        times,
        sample_rate,
    }
}

/// All edges captured by the sync port, one time list per used channel.
pub fn sync_edges(
    events: &EventData,
    node_id: u8,
    start_timestamp: i64,
    sample_rate: f64,
) -> SyncSignal {
    let channels = events.ttl_channels(node_id);
    let times = channels
        .iter()
        .map(|&chan| {
            let edges = events.ttl_indices(node_id, Some(chan));
            events.seconds(&edges, start_timestamp, sample_rate)
        })
        .collect();

    SyncSignal {
        channel_ids: channels,
        times,
        sample_rate,
    }
}

/// Logs the plausibility report of `events` when it finds anything.
pub(crate) fn report_plausibility(events: &EventData, num_channels: usize) {
    let report = events.plausibility(num_channels);
    if !report.is_clean() {
        warn!(
            non_monotonic = report.non_monotonic,
            channel_out_of_range = report.channel_out_of_range,
            "event stream looks implausible"
        );
    }
}

#[cfg(test)]
pub(crate) fn event_record(
    timestamp: i64,
    event_type: u8,
    node_id: u8,
    event_id: u8,
    channel: u8,
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(EVENT_RECORD_BYTES);
    bytes.extend_from_slice(&timestamp.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(&[event_type, node_id, event_id, channel]);
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::header_block;
    use std::io::Cursor;

    fn events_file(records: &[Vec<u8>]) -> Vec<u8> {
        let mut bytes = header_block(&[("version", "0.4"), ("sampleRate", "30000")]);
        for r in records {
            bytes.extend(r);
        }
        bytes
    }

    fn decode(bytes: Vec<u8>) -> Result<EventData> {
        let len = bytes.len() as u64;
        decode_events(&mut Cursor::new(bytes), len)
    }

    fn sample_events() -> EventData {
        decode(events_file(&[
            event_record(1000, TTL_EVENT, 100, 1, 0),
            event_record(1010, TTL_EVENT, 100, 0, 0),
            event_record(1020, TTL_EVENT, 100, 1, 2),
            event_record(1030, 5, 100, 0, 2),
            event_record(1040, TTL_EVENT, 100, 0, 2),
            event_record(1050, TTL_EVENT, 100, 1, 0),
            event_record(1060, TTL_EVENT, 105, 1, 0),
            event_record(1070, TTL_EVENT, 105, 0, 0),
        ]))
        .unwrap()
    }

    #[test]
    fn test_decode_parallel_arrays() {
        let events = sample_events();
        assert_eq!(events.len(), 8);
        assert_eq!(events.timestamps[3], 1030);
        assert_eq!(events.event_type[3], 5);
        assert_eq!(events.node_id[6], 105);
        assert_eq!(events.channel[2], 2);
    }

    #[test]
    fn test_digital_inputs_keep_rising_edges() {
        let events = sample_events();
        let digital = digital_inputs(&events, 100, 1000, 10.0);
        assert_eq!(digital.channel_ids.len(), DIGITAL_INPUT_CHANNELS);
        assert_eq!(digital.times[0].to_vec(), vec![0.0, 5.0]);
        assert_eq!(digital.times[2].to_vec(), vec![2.0]);
        assert!(digital.times[1].is_empty());
    }

    #[test]
    fn test_sync_edges_keep_all_edges() {
        let events = sample_events();
        let sync = sync_edges(&events, 105, 1000, 10.0);
        assert_eq!(sync.channel_ids, vec![0]);
        assert_eq!(sync.times[0].to_vec(), vec![6.0, 7.0]);
    }

    #[test]
    fn test_truncated_trailing_record() {
        let mut bytes = events_file(&[event_record(1, TTL_EVENT, 1, 1, 0)]);
        bytes.extend_from_slice(&[0u8; 7]);
        assert!(matches!(
            decode(bytes),
            Err(OpenEphysError::CorruptRecord { record: 1, .. })
        ));
    }

    #[test]
    fn test_records_are_packed_sixteen_bytes_apart() {
        let mut bytes = header_block(&[("version", "0.4"), ("sampleRate", "30000")]);
        for i in 0..11i64 {
            bytes.extend_from_slice(&(1000 + 10 * i).to_le_bytes());
            bytes.extend_from_slice(&(i as u16).to_le_bytes());
            bytes.extend_from_slice(&[TTL_EVENT, 100, (i % 2) as u8, (i % 2) as u8]);
            bytes.extend_from_slice(&7u16.to_le_bytes());
        }
        assert_eq!(bytes.len(), HEADER_BYTES + 11 * 16);

        let events = decode(bytes).unwrap();
        assert_eq!(events.len(), 11);
        assert_eq!(events.timestamps.to_vec(), (0..11).map(|i| 1000 + 10 * i).collect::<Vec<i64>>());
        assert_eq!(events.channel.to_vec(), (0..11).map(|i| (i % 2) as u8).collect::<Vec<u8>>());
        assert!(events.node_id.iter().all(|&n| n == 100));
        assert!(events.event_type.iter().all(|&t| t == TTL_EVENT));
    }

    #[test]
    fn test_old_version_rejected() {
        let mut bytes = header_block(&[("version", "0.1")]);
        bytes.extend(event_record(1, TTL_EVENT, 1, 1, 0));
        assert!(matches!(decode(bytes), Err(OpenEphysError::Format(_))));
    }

    #[test]
    fn test_plausibility_report() {
        let events = decode(events_file(&[
            event_record(50, TTL_EVENT, 1, 1, 0),
            event_record(40, TTL_EVENT, 1, 0, 9),
            event_record(60, TTL_EVENT, 1, 1, 1),
        ]))
        .unwrap();
        let report = events.plausibility(8);
        assert_eq!(report.non_monotonic, 1);
        assert_eq!(report.channel_out_of_range, 1);
        assert!(sample_events().plausibility(8).is_clean());
    }
}
