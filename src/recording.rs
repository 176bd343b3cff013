//! Session, experiment and recording model with lazily decoded streams.
//!
//! A [`Recording`] decodes each stream category on first access and keeps
//! the result. Channel groups refer back to their recording by id only;
//! samples are looked up by passing the recording in.

use chrono::NaiveDateTime;
use ndarray::{Array1, Axis};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::Cached;
use crate::continuous::{
    decode_continuous, expand_record_timestamps, read_binary_file, read_channel_files,
    BinaryReadMode, ContinuousReadOptions,
};
use crate::error::{OpenEphysError, Result};
use crate::events::{
    digital_inputs, read_event_file, report_plausibility, sync_edges, EventData,
    DIGITAL_INPUT_CHANNELS,
};
use crate::npy::read_npy;
use crate::probe::ProbeLayout;
use crate::settings::{Clock, ExperimentSettings, ProcessorIds, RecordFormat, SyncMessages};
use crate::spikes::{read_spike_file, SpikeData, SpikeReadOptions};
use crate::sync::{align_tracking, SyncOptions};
use crate::tracking::{read_tracking, TrackingSource};
use crate::types::{
    AnalogSignal, Channel, ChannelGroup, DigitalSignal, SampleFormat, SignalMatrix, SpikeTrain,
    SpikeTrainAttrs, SyncSignal, TrackingData,
};

/// A recording session holding one or more experiments.
#[derive(Debug)]
pub struct Session {
    pub name: String,
    experiments: Vec<Experiment>,
}

impl Session {
    pub fn new(name: impl Into<String>, experiments: Vec<Experiment>) -> Self {
        Self {
            name: name.into(),
            experiments,
        }
    }

    pub fn experiments(&self) -> &[Experiment] {
        &self.experiments
    }

    pub fn experiments_mut(&mut self) -> &mut [Experiment] {
        &mut self.experiments
    }

    /// Start date of the first experiment
    pub fn datetime(&self) -> Result<Option<NaiveDateTime>> {
        match self.experiments.first() {
            Some(experiment) => experiment.settings().start_datetime(),
            None => Ok(None),
        }
    }
}

/// Channel selection shared by every recording of an experiment.
#[derive(Debug, Clone, PartialEq)]
struct ExperimentLayout {
    settings: ExperimentSettings,
    /// Rows of the decoded matrix kept, in group order; `None` keeps all
    keep_rows: Option<Vec<usize>>,
    groups: Vec<(u32, Vec<Channel>)>,
}

/// One experiment: settings, channel layout and its recordings.
#[derive(Debug)]
pub struct Experiment {
    pub id: u32,
    layout: Arc<ExperimentLayout>,
    recordings: Vec<Recording>,
}

impl Experiment {
    /// Validates the probe layout against the recorded channels.
    ///
    /// Every `oe_channel` of the probe must be recorded, otherwise the
    /// experiment fails with [`OpenEphysError::ConfigurationMismatch`].
    /// Without a probe, all recorded channels form channel group 0.
    pub fn new(id: u32, settings: ExperimentSettings, probe: Option<&ProbeLayout>) -> Result<Self> {
        let recorded = settings.recorded_channels();

        let (keep_rows, groups) = match probe {
            Some(probe) => {
                let mut keep_rows = Vec::with_capacity(probe.channel_count());
                let mut groups = Vec::with_capacity(probe.groups.len());

                for (&group_id, group) in &probe.groups {
                    let mut channels = Vec::with_capacity(group.channels.len());
                    for (index, (&chan, &oe_chan)) in
                        group.channels.iter().zip(&group.oe_channels).enumerate()
                    {
                        let row = recorded.binary_search(&oe_chan).map_err(|_| {
                            OpenEphysError::ConfigurationMismatch {
                                channel: oe_chan,
                                group: group_id,
                            }
                        })?;
                        channels.push(Channel {
                            index,
                            id: chan,
                            row: keep_rows.len(),
                            name: format!("channel_{chan}_channel_group_{group_id}"),
                            gain: settings.gain(oe_chan).unwrap_or(1.0),
                        });
                        keep_rows.push(row);
                    }
                    groups.push((group_id, channels));
                }
                info!(selected = keep_rows.len(), "channels selected by probe file");
                (Some(keep_rows), groups)
            }
            None => {
                debug!("no probe file, using sequential channel mapping");
                let channels = recorded
                    .iter()
                    .enumerate()
                    .map(|(index, &oe_chan)| Channel {
                        index,
                        id: index as u32,
                        row: index,
                        name: format!("channel_{index}_channel_group_0"),
                        gain: settings.gain(oe_chan).unwrap_or(1.0),
                    })
                    .collect();
                (None, vec![(0, channels)])
            }
        };

        Ok(Self {
            id,
            layout: Arc::new(ExperimentLayout {
                settings,
                keep_rows,
                groups,
            }),
            recordings: Vec::new(),
        })
    }

    pub fn settings(&self) -> &ExperimentSettings {
        &self.layout.settings
    }

    /// Rows of the decoded matrix kept by the probe file
    pub fn keep_channels(&self) -> Option<&[usize]> {
        self.layout.keep_rows.as_deref()
    }

    /// Creates a recording sharing this experiment's channel layout.
    pub fn open_recording(&self, id: u32, sources: RecordingSources, options: RecordingOptions) -> Recording {
        Recording {
            id,
            layout: Arc::clone(&self.layout),
            sources,
            options,
            clock: None,
            analog: Cached::new(),
            spikes: Cached::new(),
            events: Cached::new(),
            tracking: Cached::new(),
            groups: Cached::new(),
        }
    }

    /// Opens a recording and keeps it in this experiment.
    pub fn add_recording(
        &mut self,
        id: u32,
        sources: RecordingSources,
        options: RecordingOptions,
    ) -> &mut Recording {
        let recording = self.open_recording(id, sources, options);
        self.recordings.push(recording);
        let last = self.recordings.len() - 1;
        &mut self.recordings[last]
    }

    pub fn recordings(&self) -> &[Recording] {
        &self.recordings
    }

    pub fn recording_mut(&mut self, id: u32) -> Option<&mut Recording> {
        self.recordings.iter_mut().find(|r| r.id == id)
    }
}

/// Files backing one recording. Discovery of these paths is up to the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordingSources {
    /// One `.continuous` file per recorded channel, in channel order
    pub continuous_files: Vec<PathBuf>,
    /// Interleaved `continuous.dat` of the binary layout
    pub binary_file: Option<PathBuf>,
    /// `timestamps.npy` of the binary layout
    pub timestamps_file: Option<PathBuf>,
    /// `.spikes` files, each named with the `TT{group}` of its source
    pub spike_files: Vec<PathBuf>,
    /// `all_channels.events`
    pub events_file: Option<PathBuf>,
    pub tracking: Vec<TrackingSource>,
    /// `sync_messages.txt`
    pub sync_messages: Option<PathBuf>,
}

/// Decoder options applied by a recording.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RecordingOptions {
    pub continuous: ContinuousReadOptions,
    pub spikes: SpikeReadOptions,
    pub binary_mode: BinaryReadMode,
    pub sync: SyncOptions,
}

/// Stream categories with their own lazy cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheCategory {
    Analog,
    Spikes,
    /// Digital inputs, sync edges and raw events share one decode
    Events,
    Tracking,
    ChannelGroups,
}

/// Time window for [`Recording::clip`], in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClipWindow {
    /// Keep everything after `t`
    Start(f64),
    /// Keep everything before `t`
    End(f64),
    /// Keep everything between the two times
    Between(f64, f64),
}

impl ClipWindow {
    fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(OpenEphysError::InvalidArgument(msg));
        match *self {
            ClipWindow::Start(t) | ClipWindow::End(t) if t.is_nan() => bad("clip time is NaN".into()),
            ClipWindow::Between(t0, t1) if t0.is_nan() || t1.is_nan() => {
                bad("clip time is NaN".into())
            }
            ClipWindow::Between(t0, t1) if t0 > t1 => {
                bad(format!("clip window starts at {t0} but ends at {t1}"))
            }
            _ => Ok(()),
        }
    }

    /// Sample-stream rule: strictly inside the window.
    fn contains(&self, t: f64) -> bool {
        match *self {
            ClipWindow::Start(t0) => t > t0,
            ClipWindow::End(t1) => t < t1,
            ClipWindow::Between(t0, t1) => t > t0 && t < t1,
        }
    }

    /// Analog time-axis rule: bounds are kept, except the start of a
    /// two-sided window.
    fn contains_time(&self, t: f64) -> bool {
        match *self {
            ClipWindow::Start(t0) => t >= t0,
            ClipWindow::End(t1) => t <= t1,
            ClipWindow::Between(t0, t1) => t > t0 && t <= t1,
        }
    }

    /// Shift applied to kept times
    fn offset(&self) -> f64 {
        match *self {
            ClipWindow::Start(t0) | ClipWindow::Between(t0, _) => t0,
            ClipWindow::End(_) => 0.0,
        }
    }

    /// Upper time bound after clipping a stream that ended at `t_stop`
    fn clipped_t_stop(&self, t_stop: f64) -> f64 {
        let end = match *self {
            ClipWindow::Start(_) => t_stop,
            ClipWindow::End(t1) | ClipWindow::Between(_, t1) => t1.min(t_stop),
        };
        (end - self.offset()).max(0.0)
    }

    fn indices(&self, times: &Array1<f64>, inclusive: bool) -> Vec<usize> {
        times
            .iter()
            .enumerate()
            .filter(|&(_, &t)| {
                if inclusive {
                    self.contains_time(t)
                } else {
                    self.contains(t)
                }
            })
            .map(|(i, _)| i)
            .collect()
    }
}

/// Decoded event streams.
#[derive(Debug, Clone, PartialEq)]
pub struct EventStreams {
    /// Raw event records, `None` without an events file
    pub data: Option<EventData>,
    pub digital: Vec<DigitalSignal>,
    pub sync: Vec<SyncSignal>,
}

#[derive(Debug, Clone, PartialEq)]
struct GroupIndex {
    groups: Vec<ChannelGroup>,
    by_channel: HashMap<u32, usize>,
    by_id: HashMap<u32, usize>,
}

/// One recording with lazily decoded streams.
///
/// Accessors take `&mut self`: the first call decodes the category and
/// stores it, later calls return the stored value.
#[derive(Debug)]
pub struct Recording {
    pub id: u32,
    layout: Arc<ExperimentLayout>,
    sources: RecordingSources,
    options: RecordingOptions,
    clock: Option<Clock>,
    analog: Cached<Vec<AnalogSignal>>,
    spikes: Cached<Vec<SpikeTrain>>,
    events: Cached<EventStreams>,
    tracking: Cached<Vec<TrackingData>>,
    groups: Cached<GroupIndex>,
}

impl Recording {
    pub fn format(&self) -> RecordFormat {
        self.layout.settings.format
    }

    pub fn processors(&self) -> ProcessorIds {
        self.layout.settings.processors
    }

    pub fn sources(&self) -> &RecordingSources {
        &self.sources
    }

    /// Decoder invocations for one category
    pub fn decode_count(&self, category: CacheCategory) -> usize {
        match category {
            CacheCategory::Analog => self.analog.decode_count(),
            CacheCategory::Spikes => self.spikes.decode_count(),
            CacheCategory::Events => self.events.decode_count(),
            CacheCategory::Tracking => self.tracking.decode_count(),
            CacheCategory::ChannelGroups => self.groups.decode_count(),
        }
    }

    /// Start sample and sample rate of the recording.
    ///
    /// Read from the sync messages when available, else from the first
    /// record of the first continuous file.
    pub fn clock(&mut self) -> Result<Clock> {
        if let Some(clock) = self.clock {
            return Ok(clock);
        }
        let clock = match &self.sources.sync_messages {
            Some(path) => SyncMessages::read(path)?.clock()?,
            None => self.clock_from_continuous()?,
        };
        self.clock = Some(clock);
        Ok(clock)
    }

    fn clock_from_continuous(&self) -> Result<Clock> {
        let path = self.sources.continuous_files.first().ok_or_else(|| {
            OpenEphysError::missing("recording has neither sync messages nor continuous files")
        })?;
        let file = std::fs::File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = std::io::BufReader::new(file);
        let options = ContinuousReadOptions {
            start_record: Some(0),
            stop_record: Some(1),
            ignore_last_record: false,
            sample_format: SampleFormat::Raw,
        };
        let first = decode_continuous(&mut reader, file_size, &options)?;
        let start = first
            .timestamps
            .first()
            .copied()
            .ok_or_else(|| OpenEphysError::missing(format!("{} holds no records", path.display())))?;
        Ok(Clock {
            start,
            sample_rate: first.header.sample_rate()?,
        })
    }

    pub fn sample_rate(&mut self) -> Result<f64> {
        Ok(self.clock()?.sample_rate)
    }

    pub fn start_timestamp(&mut self) -> Result<i64> {
        Ok(self.clock()?.start)
    }

    pub fn analog_signals(&mut self) -> Result<&[AnalogSignal]> {
        if !self.analog.is_computed() {
            let clock = self.clock()?;
            let layout = Arc::clone(&self.layout);
            let (sources, options) = (&self.sources, &self.options);
            self.analog
                .get_or_try_init(|| decode_analog(&layout, sources, options, clock))?;
        }
        Ok(self.analog.get().map(Vec::as_slice).unwrap_or(&[]))
    }

    pub fn spiketrains(&mut self) -> Result<&[SpikeTrain]> {
        if !self.spikes.is_computed() {
            let t_stop = self.duration()?;
            let clock = self.clock()?;
            let acquiring = self.layout.settings.processors.acquisition.is_some();
            let (sources, options) = (&self.sources, &self.options);
            self.spikes.get_or_try_init(|| {
                if !acquiring {
                    return Ok(Vec::new());
                }
                decode_spiketrains(sources, &options.spikes, clock.start, t_stop)
            })?;
        }
        Ok(self.spikes.get().map(Vec::as_slice).unwrap_or(&[]))
    }

    fn event_streams(&mut self) -> Result<&EventStreams> {
        if !self.events.is_computed() {
            let processors = self.processors();
            let needs_clock = self.sources.events_file.is_some();
            let clock = if needs_clock { Some(self.clock()?) } else { None };
            let sources = &self.sources;
            self.events
                .get_or_try_init(|| decode_events(sources, processors, clock))?;
        }
        self.events
            .get()
            .ok_or_else(|| OpenEphysError::format("event cache missing after decode"))
    }

    /// Rising edges on the acquisition board's digital inputs
    pub fn digital_in_signals(&mut self) -> Result<&[DigitalSignal]> {
        Ok(&self.event_streams()?.digital)
    }

    /// Edges seen by the sync port
    pub fn sync_signals(&mut self) -> Result<&[SyncSignal]> {
        Ok(&self.event_streams()?.sync)
    }

    /// Raw event records
    pub fn events(&mut self) -> Result<Option<&EventData>> {
        Ok(self.event_streams()?.data.as_ref())
    }

    pub fn tracking(&mut self) -> Result<&[TrackingData]> {
        if !self.tracking.is_computed() {
            let tracked = self.layout.settings.processors.tracking.is_some() && !self.sources.tracking.is_empty();
            let sample_rate = if tracked { self.sample_rate()? } else { 0.0 };
            let sources = &self.sources.tracking;
            self.tracking.get_or_try_init(|| {
                if !tracked {
                    return Ok(Vec::new());
                }
                sources.iter().map(|s| read_tracking(s, sample_rate)).collect()
            })?;
        }
        Ok(self.tracking.get().map(Vec::as_slice).unwrap_or(&[]))
    }

    /// Tracking streams resampled onto `pulses`, see [`align_tracking`].
    pub fn aligned_tracking(&mut self, pulses: &Array1<f64>) -> Result<Vec<TrackingData>> {
        let options = self.options.sync;
        self.tracking()?
            .iter()
            .map(|t| align_tracking(t, pulses, &options))
            .collect()
    }

    /// Recording duration (s): analog data when present, else tracking.
    pub fn duration(&mut self) -> Result<f64> {
        if let Some(signal) = self.analog_signals()?.first() {
            if signal.num_samples() > 0 {
                return Ok(signal.num_samples() as f64 / signal.sample_rate);
            }
        }
        if let Some(track) = self.tracking()?.first() {
            if let (Some(first), Some(last)) = (track.times.first(), track.times.last()) {
                return Ok(last - first);
            }
        }
        Ok(0.0)
    }

    /// Time axis (s): analog data when present, else tracking.
    pub fn times(&mut self) -> Result<Array1<f64>> {
        if let Some(signal) = self.analog_signals()?.first() {
            if signal.num_samples() > 0 {
                return Ok(signal.times.clone());
            }
        }
        if let Some(track) = self.tracking()?.first() {
            return Ok(track.times.clone());
        }
        Ok(Array1::zeros(0))
    }

    fn group_index(&mut self) -> Result<&GroupIndex> {
        let recording_id = self.id;
        let layout = &self.layout;
        let index = self.groups.get_or_try_init(|| {
            let groups: Vec<ChannelGroup> = layout
                .groups
                .iter()
                .map(|(id, channels)| ChannelGroup {
                    id: *id,
                    channels: channels.clone(),
                    recording_id,
                })
                .collect();

            let mut by_channel = HashMap::new();
            let mut by_id = HashMap::new();
            for (pos, group) in groups.iter().enumerate() {
                by_id.insert(group.id, pos);
                for channel in &group.channels {
                    by_channel.insert(channel.id, pos);
                }
            }
            Ok(GroupIndex {
                groups,
                by_channel,
                by_id,
            })
        })?;
        Ok(&*index)
    }

    pub fn channel_groups(&mut self) -> Result<&[ChannelGroup]> {
        Ok(&self.group_index()?.groups)
    }

    /// Group containing channel `channel_id`
    pub fn channel_group(&mut self, channel_id: u32) -> Result<Option<&ChannelGroup>> {
        let index = self.group_index()?;
        Ok(index.by_channel.get(&channel_id).map(|&pos| &index.groups[pos]))
    }

    pub fn channel_group_by_id(&mut self, group_id: u32) -> Result<Option<&ChannelGroup>> {
        let index = self.group_index()?;
        Ok(index.by_id.get(&group_id).map(|&pos| &index.groups[pos]))
    }

    /// Trims every stream to `window`.
    ///
    /// All categories are decoded first. Kept times are shifted so the
    /// window start becomes zero for [`ClipWindow::Start`] and
    /// [`ClipWindow::Between`].
    pub fn clip(&mut self, window: ClipWindow) -> Result<()> {
        window.validate()?;
        self.analog_signals()?;
        self.spiketrains()?;
        self.event_streams()?;
        self.tracking()?;
        let offset = window.offset();

        if let Some(signals) = self.analog.get_mut() {
            for signal in signals.iter_mut() {
                let keep = window.indices(&signal.times, true);
                signal.signal = signal.signal.select_samples(&keep);
                signal.times = signal.times.select(Axis(0), &keep).mapv(|t| t - offset);
                signal.timestamps = signal.timestamps.select(Axis(0), &keep);
            }
        }

        if let Some(streams) = self.events.get_mut() {
            for digital in streams.digital.iter_mut() {
                clip_time_lists(&mut digital.times, &window);
            }
            for sync in streams.sync.iter_mut() {
                clip_time_lists(&mut sync.times, &window);
            }
        }

        if let Some(tracks) = self.tracking.get_mut() {
            for track in tracks.iter_mut() {
                let keep = window.indices(&track.times, false);
                *track = track.select(&keep);
                track.times.mapv_inplace(|t| t - offset);
            }
        }

        if let Some(trains) = self.spikes.get_mut() {
            for train in trains.iter_mut() {
                let keep = window.indices(train.times(), false);
                *train = train.retain(&keep, offset, window.clipped_t_stop(train.t_stop()))?;
            }
        }

        info!(?window, recording = self.id, "clipped recording");
        Ok(())
    }
}

impl ChannelGroup {
    /// Analog rows of this group, looked up in `recording`.
    pub fn analog_signals(&self, recording: &mut Recording) -> Result<Vec<AnalogSignal>> {
        self.check_owner(recording)?;
        let rows: Vec<usize> = self.channels.iter().map(|c| c.row).collect();
        let ids: Vec<usize> = self.channels.iter().map(|c| c.id as usize).collect();

        recording
            .analog_signals()?
            .iter()
            .map(|signal| {
                if let Some(&bad) = rows.iter().find(|&&r| r >= signal.signal.num_channels()) {
                    return Err(OpenEphysError::InvalidArgument(format!(
                        "channel group {} refers to row {bad} of a {}-row signal",
                        self.id,
                        signal.signal.num_channels()
                    )));
                }
                Ok(AnalogSignal {
                    channel_ids: ids.clone(),
                    signal: signal.signal.select_channels(&rows),
                    times: signal.times.clone(),
                    timestamps: signal.timestamps.clone(),
                    sample_rate: signal.sample_rate,
                })
            })
            .collect()
    }

    /// Spike trains detected on this group.
    pub fn spiketrains(&self, recording: &mut Recording) -> Result<Vec<SpikeTrain>> {
        self.check_owner(recording)?;
        Ok(recording
            .spiketrains()?
            .iter()
            .filter(|t| t.attrs().channel_group_id == self.id)
            .cloned()
            .collect())
    }

    fn check_owner(&self, recording: &Recording) -> Result<()> {
        if recording.id != self.recording_id {
            return Err(OpenEphysError::InvalidArgument(format!(
                "channel group belongs to recording {}, not {}",
                self.recording_id, recording.id
            )));
        }
        Ok(())
    }
}

fn clip_time_lists(lists: &mut [Array1<f64>], window: &ClipWindow) {
    let offset = window.offset();
    for times in lists.iter_mut() {
        let keep = window.indices(times, false);
        *times = times.select(Axis(0), &keep).mapv(|t| t - offset);
    }
}

fn decode_analog(
    layout: &ExperimentLayout,
    sources: &RecordingSources,
    options: &RecordingOptions,
    clock: Clock,
) -> Result<Vec<AnalogSignal>> {
    let settings = &layout.settings;
    if settings.processors.acquisition.is_none() {
        return Ok(Vec::new());
    }

    let (signal, timestamps, sample_rate) = match settings.format {
        RecordFormat::OpenEphys => {
            if sources.continuous_files.len() != settings.num_channels() {
                return Err(OpenEphysError::missing(format!(
                    "{} channels recorded but {} continuous files given",
                    settings.num_channels(),
                    sources.continuous_files.len()
                )));
            }
            let files = read_channel_files(&sources.continuous_files, &options.continuous)?;
            let sample_rate = match files.headers.first() {
                Some(header) => header.sample_rate()?,
                None => clock.sample_rate,
            };
            let timestamps = expand_record_timestamps(&files.timestamps, files.block_length);
            (files.samples, timestamps, sample_rate)
        }
        RecordFormat::RawBinary => {
            let dat = sources
                .binary_file
                .as_ref()
                .ok_or_else(|| OpenEphysError::missing("binary recording without continuous.dat"))?;
            let ts_path = sources
                .timestamps_file
                .as_ref()
                .ok_or_else(|| OpenEphysError::missing("binary recording without timestamps.npy"))?;

            let raw = read_binary_file(dat, settings.num_channels(), options.binary_mode)?;
            let timestamps = Array1::from(read_npy(ts_path)?.to_i64_vec()?);
            if timestamps.len() != raw.ncols() {
                return Err(OpenEphysError::ChannelLengthMismatch {
                    channel: 0,
                    expected: raw.ncols(),
                    found: timestamps.len(),
                });
            }

            let raw = SignalMatrix::Raw(raw);
            let signal = match options.continuous.sample_format {
                SampleFormat::Raw => raw,
                SampleFormat::Microvolts => {
                    let gains: Vec<f64> = settings.channel_gains.values().copied().collect();
                    SignalMatrix::Microvolts(raw.to_microvolts(&gains)?)
                }
            };
            (signal, timestamps, clock.sample_rate)
        }
    };

    let signal = match &layout.keep_rows {
        Some(rows) => signal.select_channels(rows),
        None => signal,
    };
    let times = timestamps.mapv(|ts| (ts - clock.start) as f64 / sample_rate);

    Ok(vec![AnalogSignal {
        channel_ids: (0..signal.num_channels()).collect(),
        signal,
        times,
        timestamps,
        sample_rate,
    }])
}

fn decode_spiketrains(
    sources: &RecordingSources,
    options: &SpikeReadOptions,
    start_timestamp: i64,
    t_stop: f64,
) -> Result<Vec<SpikeTrain>> {
    let mut trains = Vec::new();
    for path in &sources.spike_files {
        let data = read_spike_file(path, options)?;
        let Some(group_id) = data.group_id()? else {
            debug!(path = %path.display(), "spike file holds no spikes");
            continue;
        };
        if !names_group(path, group_id) {
            return Err(OpenEphysError::format(format!(
                "{} holds spikes of group {group_id} but is not named TT{group_id}",
                path.display()
            )));
        }
        trains.extend(split_clusters(&data, u32::from(group_id), start_timestamp, t_stop)?);
    }
    Ok(trains)
}

/// Whether the file name carries `TT{group_id}` not followed by another digit.
fn names_group(path: &Path, group_id: u16) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let tag = format!("TT{group_id}");
    name.match_indices(&tag).any(|(at, _)| {
        !name[at + tag.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    })
}

/// One spike train per cluster label.
fn split_clusters(
    data: &SpikeData,
    group_id: u32,
    start_timestamp: i64,
    t_stop: f64,
) -> Result<Vec<SpikeTrain>> {
    let sample_rate = data.header.sample_rate()?;

    data.clusters()
        .into_iter()
        .map(|cluster| {
            let idx = data.cluster_indices(cluster);
            let times = data
                .timestamps
                .select(Axis(0), &idx)
                .mapv(|ts| (ts - start_timestamp) as f64 / sample_rate);
            // [spike, sample, channel] -> [spike, channel, sample]
            let waveforms = data
                .waveforms
                .select(Axis(0), &idx)
                .permuted_axes([0, 2, 1])
                .as_standard_layout()
                .into_owned();

            SpikeTrain::new(
                times,
                waveforms,
                idx.len(),
                data.num_channels,
                data.samples_per_spike,
                sample_rate,
                t_stop,
                SpikeTrainAttrs {
                    channel_group_id: group_id,
                    cluster_id: u32::from(cluster),
                    name: format!("Unit #{cluster}"),
                    gain: data.gain.select(Axis(0), &idx),
                    threshold: data.threshold.select(Axis(0), &idx),
                },
            )
        })
        .collect()
}

fn decode_events(
    sources: &RecordingSources,
    processors: ProcessorIds,
    clock: Option<Clock>,
) -> Result<EventStreams> {
    let (Some(path), Some(clock)) = (&sources.events_file, clock) else {
        return Ok(EventStreams {
            data: None,
            digital: Vec::new(),
            sync: Vec::new(),
        });
    };

    let data = read_event_file(path)?;
    report_plausibility(&data, DIGITAL_INPUT_CHANNELS);

    let digital = match processors.acquisition {
        Some(id) => vec![digital_inputs(
            &data,
            ProcessorIds::event_node(id)?,
            clock.start,
            clock.sample_rate,
        )],
        None => Vec::new(),
    };
    let sync = match processors.sync {
        Some(id) => vec![sync_edges(
            &data,
            ProcessorIds::event_node(id)?,
            clock.start,
            clock.sample_rate,
        )],
        None => Vec::new(),
    };

    Ok(EventStreams {
        data: Some(data),
        digital,
        sync,
    })
}
