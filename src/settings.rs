//! Values supplied by the settings collaborator.
//!
//! XML traversal happens elsewhere; this module holds the typed contract the
//! decoders consume, plus the small text formats that sit next to a
//! recording (`sync_messages.txt`, the settings date string).

use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use crate::error::{OpenEphysError, Result};

/// Format of the recording start date written by the acquisition software
pub const DEFAULT_DATE_FORMAT: &str = "%d %b %Y %H:%M:%S";

/// On-disk layout of the continuous data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    /// One `.continuous` file per channel with a 1024-byte text header
    OpenEphys,
    /// One interleaved `.dat` file plus `timestamps.npy`
    RawBinary,
}

impl FromStr for RecordFormat {
    type Err = OpenEphysError;

    fn from_str(tag: &str) -> Result<Self> {
        match tag.trim() {
            "OPENEPHYS" | "openephys" => Ok(RecordFormat::OpenEphys),
            "RAWBINARY" | "binary" => Ok(RecordFormat::RawBinary),
            other => Err(OpenEphysError::format(format!("unknown record format tag {other:?}"))),
        }
    }
}

/// Node ids of the processors the decoder cares about.
///
/// Ids are `u16` in the settings but only the low byte is written to event
/// records, see [`ProcessorIds::event_node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessorIds {
    pub acquisition: Option<u16>,
    pub tracking: Option<u16>,
    pub sync: Option<u16>,
    pub stimulator: Option<u16>,
}

impl ProcessorIds {
    /// Node id as it appears in event records.
    pub fn event_node(id: u16) -> Result<u8> {
        u8::try_from(id)
            .map_err(|_| OpenEphysError::format(format!("processor id {id} does not fit an event record")))
    }
}

/// Settings of one experiment, as delivered by the settings collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentSettings {
    pub format: RecordFormat,
    /// Gain (μV per count) of every recorded channel, keyed by channel number
    pub channel_gains: BTreeMap<u32, f64>,
    pub processors: ProcessorIds,
    /// Start date as written in the settings, e.g. "14 Mar 2018 10:22:31"
    pub date: Option<String>,
}

impl ExperimentSettings {
    /// Recorded channel numbers, ascending
    pub fn recorded_channels(&self) -> Vec<u32> {
        self.channel_gains.keys().copied().collect()
    }

    pub fn num_channels(&self) -> usize {
        self.channel_gains.len()
    }

    pub fn gain(&self, channel: u32) -> Option<f64> {
        self.channel_gains.get(&channel).copied()
    }

    /// Start date parsed with [`DEFAULT_DATE_FORMAT`].
    pub fn start_datetime(&self) -> Result<Option<NaiveDateTime>> {
        self.date
            .as_deref()
            .map(|d| parse_start_datetime(d, DEFAULT_DATE_FORMAT))
            .transpose()
    }
}

/// Parses a date with an explicit format; no locale state is involved.
pub fn parse_start_datetime(text: &str, format: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text.trim(), format)
        .map_err(|e| OpenEphysError::format(format!("cannot parse date {text:?} with {format:?}: {e}")))
}

/// Picks the settings file of experiment `experiment_id` among `names`.
///
/// Experiment 1 uses `settings.xml`; later experiments use the
/// `settings*.xml` file whose name contains the experiment id.
pub fn select_settings_file<S: AsRef<str>>(names: &[S], experiment_id: u32) -> Result<String> {
    let id = experiment_id.to_string();
    let matches: Vec<&str> = names
        .iter()
        .map(|name| name.as_ref())
        .filter(|name| {
            if experiment_id == 1 {
                *name == "settings.xml"
            } else {
                name.starts_with("settings") && name.ends_with(".xml") && name.contains(&id)
            }
        })
        .collect();

    match matches.as_slice() {
        [name] => Ok(name.to_string()),
        [] => Err(OpenEphysError::missing(format!(
            "no settings file for experiment {experiment_id}"
        ))),
        many => Err(OpenEphysError::missing(format!(
            "settings file for experiment {experiment_id} is ambiguous: {many:?}"
        ))),
    }
}

/// Start sample and rate of a recording clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clock {
    pub start: i64,
    /// Hz
    pub sample_rate: f64,
}

/// A timestamped text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMessage {
    pub time: i64,
    pub message: String,
}

/// Parsed `sync_messages.txt` of one recording.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncMessages {
    pub processor: Option<Clock>,
    pub software: Option<Clock>,
    pub messages: Vec<SyncMessage>,
}

impl SyncMessages {
    pub fn parse(text: &str) -> Result<Self> {
        let mut parsed = SyncMessages::default();

        for (lineno, line) in text.lines().enumerate() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let Some(last) = tokens.last() else {
                continue;
            };

            if tokens.contains(&"Software") {
                parsed.software = Some(parse_clock(last)?);
            } else if tokens.contains(&"Processor:") {
                let clock = parse_clock(last)?;
                if let Some(previous) = parsed.processor {
                    if previous.start != clock.start {
                        return Err(OpenEphysError::format(format!(
                            "processors started at different times ({} and {})",
                            previous.start, clock.start
                        )));
                    }
                }
                parsed.processor = Some(clock);
            } else {
                let time = tokens[0].parse().map_err(|_| {
                    OpenEphysError::format(format!(
                        "sync message line {} does not start with a time: {line:?}",
                        lineno + 1
                    ))
                })?;
                parsed.messages.push(SyncMessage {
                    time,
                    message: tokens[1..].join(" "),
                });
            }
        }

        Ok(parsed)
    }

    pub fn read<P: AsRef<Path>>(file_path: P) -> Result<Self> {
        let text = fs::read_to_string(file_path.as_ref())?;
        let parsed = Self::parse(&text)?;
        debug!(
            path = %file_path.as_ref().display(),
            processor = parsed.processor.is_some(),
            messages = parsed.messages.len(),
            "read sync messages"
        );
        Ok(parsed)
    }

    /// Recording clock: the processor clock when present, else the software clock.
    pub fn clock(&self) -> Result<Clock> {
        self.processor
            .or(self.software)
            .ok_or_else(|| OpenEphysError::missing("sync messages carry no start time"))
    }
}

/// Parses `<start>@<rate>Hz`.
fn parse_clock(token: &str) -> Result<Clock> {
    let bad = || OpenEphysError::format(format!("malformed start time {token:?}"));
    let (start, rate) = token.split_once('@').ok_or_else(bad)?;
    let rate = rate.find("Hz").map(|end| &rate[..end]).ok_or_else(bad)?;

    Ok(Clock {
        start: start.parse().map_err(|_| bad())?,
        sample_rate: rate.parse().map_err(|_| bad())?,
    })
}
