use ndarray::{Array1, Array2, Array3, Axis};

use crate::error::{OpenEphysError, Result};

/// How continuous samples are returned by the decoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFormat {
    /// Raw samples multiplied by `bitVolts`
    #[default]
    Microvolts,
    /// Raw 16-bit samples, scaling left to the caller
    Raw,
}

/// Sample matrix of an analog signal.
///
/// - Shape: [num_channels, num_samples]
#[derive(Debug, Clone, PartialEq)]
pub enum SignalMatrix {
    /// Raw ADC counts
    Raw(Array2<i16>),
    /// Samples in microvolts (μV)
    Microvolts(Array2<f64>),
}

impl SignalMatrix {
    pub fn num_channels(&self) -> usize {
        match self {
            SignalMatrix::Raw(m) => m.nrows(),
            SignalMatrix::Microvolts(m) => m.nrows(),
        }
    }

    pub fn num_samples(&self) -> usize {
        match self {
            SignalMatrix::Raw(m) => m.ncols(),
            SignalMatrix::Microvolts(m) => m.ncols(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num_channels() == 0 || self.num_samples() == 0
    }

    /// Returns the samples in microvolts, scaling raw counts row by row with `gains`.
    pub fn to_microvolts(&self, gains: &[f64]) -> Result<Array2<f64>> {
        match self {
            SignalMatrix::Microvolts(m) => Ok(m.clone()),
            SignalMatrix::Raw(m) => {
                if gains.len() != m.nrows() {
                    return Err(OpenEphysError::InvalidArgument(format!(
                        "{} gains supplied for {} channels",
                        gains.len(),
                        m.nrows()
                    )));
                }
                let mut out = m.mapv(f64::from);
                for (mut row, gain) in out.axis_iter_mut(Axis(0)).zip(gains) {
                    row.mapv_inplace(|v| v * gain);
                }
                Ok(out)
            }
        }
    }

    /// Keeps the given rows, in the given order.
    pub fn select_channels(&self, rows: &[usize]) -> SignalMatrix {
        match self {
            SignalMatrix::Raw(m) => SignalMatrix::Raw(m.select(Axis(0), rows)),
            SignalMatrix::Microvolts(m) => SignalMatrix::Microvolts(m.select(Axis(0), rows)),
        }
    }

    /// Keeps the given sample columns.
    pub fn select_samples(&self, columns: &[usize]) -> SignalMatrix {
        match self {
            SignalMatrix::Raw(m) => SignalMatrix::Raw(m.select(Axis(1), columns)),
            SignalMatrix::Microvolts(m) => SignalMatrix::Microvolts(m.select(Axis(1), columns)),
        }
    }
}

/// Continuous analog traces of one acquisition source.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogSignal {
    /// Channel ids, one per matrix row
    pub channel_ids: Vec<usize>,
    /// Sample matrix, [num_channels, num_samples]
    pub signal: SignalMatrix,
    /// Sample times relative to the recording start (s)
    pub times: Array1<f64>,
    /// Absolute sample numbers, one per sample
    pub timestamps: Array1<i64>,
    /// Sample rate (Hz)
    pub sample_rate: f64,
}

impl AnalogSignal {
    pub fn empty(sample_rate: f64) -> Self {
        Self {
            channel_ids: Vec::new(),
            signal: SignalMatrix::Microvolts(Array2::zeros((0, 0))),
            times: Array1::zeros(0),
            timestamps: Array1::zeros(0),
            sample_rate,
        }
    }

    pub fn num_samples(&self) -> usize {
        self.signal.num_samples()
    }
}

/// Descriptive attributes attached to a spike train.
#[derive(Debug, Clone, PartialEq)]
pub struct SpikeTrainAttrs {
    /// Channel group (electrode source) the spikes were detected on
    pub channel_group_id: u32,
    /// Cluster id within the group
    pub cluster_id: u32,
    /// Display name, e.g. "Unit #3"
    pub name: String,
    /// Per-spike, per-channel gain, [spike_count, channel_count]
    pub gain: Array2<f32>,
    /// Per-spike, per-channel threshold, [spike_count, channel_count]
    pub threshold: Array2<u16>,
}

/// Spikes of one cluster with their waveforms.
///
/// Construction checks that `waveforms` has shape
/// `(spike_count, channel_count, samples_per_spike)` and that no spike time
/// exceeds `t_stop`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpikeTrain {
    times: Array1<f64>,
    waveforms: Array3<f64>,
    spike_count: usize,
    channel_count: usize,
    samples_per_spike: usize,
    sample_rate: f64,
    t_stop: f64,
    attrs: SpikeTrainAttrs,
}

impl SpikeTrain {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        times: Array1<f64>,
        waveforms: Array3<f64>,
        spike_count: usize,
        channel_count: usize,
        samples_per_spike: usize,
        sample_rate: f64,
        t_stop: f64,
        attrs: SpikeTrainAttrs,
    ) -> Result<Self> {
        let expected = [spike_count, channel_count, samples_per_spike];
        if waveforms.shape() != expected {
            return Err(OpenEphysError::InvalidSpikeTrain(format!(
                "waveforms have shape {:?}, expected {:?}",
                waveforms.shape(),
                expected
            )));
        }
        if times.len() != spike_count {
            return Err(OpenEphysError::InvalidSpikeTrain(format!(
                "{} spike times for {} spikes",
                times.len(),
                spike_count
            )));
        }
        if let Some(&last) = times.iter().max_by(|a, b| a.total_cmp(b)) {
            if last > t_stop {
                return Err(OpenEphysError::InvalidSpikeTrain(format!(
                    "spike time {last} exceeds duration {t_stop}"
                )));
            }
        }

        Ok(Self {
            times,
            waveforms,
            spike_count,
            channel_count,
            samples_per_spike,
            sample_rate,
            t_stop,
            attrs,
        })
    }

    /// Spike times (s)
    pub fn times(&self) -> &Array1<f64> {
        &self.times
    }

    /// Waveforms (μV), [spike_count, channel_count, samples_per_spike]
    pub fn waveforms(&self) -> &Array3<f64> {
        &self.waveforms
    }

    pub fn spike_count(&self) -> usize {
        self.spike_count
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn samples_per_spike(&self) -> usize {
        self.samples_per_spike
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn t_stop(&self) -> f64 {
        self.t_stop
    }

    pub fn attrs(&self) -> &SpikeTrainAttrs {
        &self.attrs
    }

    /// Keeps the spikes at `indices`, shifts their times by `-offset` and
    /// rebuilds the train against `t_stop`.
    pub(crate) fn retain(&self, indices: &[usize], offset: f64, t_stop: f64) -> Result<Self> {
        let times = self.times.select(Axis(0), indices).mapv(|t| t - offset);
        let attrs = SpikeTrainAttrs {
            gain: self.attrs.gain.select(Axis(0), indices),
            threshold: self.attrs.threshold.select(Axis(0), indices),
            ..self.attrs.clone()
        };
        SpikeTrain::new(
            times,
            self.waveforms.select(Axis(0), indices),
            indices.len(),
            self.channel_count,
            self.samples_per_spike,
            self.sample_rate,
            t_stop,
            attrs,
        )
    }
}

/// TTL edge times from digital inputs of the acquisition board.
///
/// `times[ch]` holds the rising edges of channel `ch`.
#[derive(Debug, Clone, PartialEq)]
pub struct DigitalSignal {
    pub channel_ids: Vec<u8>,
    /// Rising-edge times per channel (s)
    pub times: Vec<Array1<f64>>,
    pub sample_rate: f64,
}

impl DigitalSignal {
    pub fn empty(sample_rate: f64) -> Self {
        Self {
            channel_ids: Vec::new(),
            times: Vec::new(),
            sample_rate,
        }
    }
}

/// TTL edges captured by the sync port, both rising and falling.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSignal {
    pub channel_ids: Vec<u8>,
    /// All edge times per listed channel (s)
    pub times: Vec<Array1<f64>>,
    pub sample_rate: f64,
}

impl SyncSignal {
    pub fn empty(sample_rate: f64) -> Self {
        Self {
            channel_ids: Vec::new(),
            times: Vec::new(),
            sample_rate,
        }
    }
}

/// Position samples from one tracking source.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingData {
    /// Sample times (s)
    pub times: Array1<f64>,
    pub x: Array1<f64>,
    pub y: Array1<f64>,
    pub width: Array1<f64>,
    pub height: Array1<f64>,
    /// Source channel of each sample
    pub channels: Array1<i64>,
}

impl TrackingData {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Keeps the samples at `indices`.
    pub(crate) fn select(&self, indices: &[usize]) -> Self {
        Self {
            times: self.times.select(Axis(0), indices),
            x: self.x.select(Axis(0), indices),
            y: self.y.select(Axis(0), indices),
            width: self.width.select(Axis(0), indices),
            height: self.height.select(Axis(0), indices),
            channels: self.channels.select(Axis(0), indices),
        }
    }
}

/// A recorded channel within a channel group.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    /// Position within the group
    pub index: usize,
    /// Channel id from the probe file, or the sequential id without one
    pub id: u32,
    /// Row of the recording's analog matrix
    pub row: usize,
    pub name: String,
    /// Gain (μV per count)
    pub gain: f64,
}

/// Channels treated as one spatial unit, e.g. a tetrode or probe shank.
///
/// Holds identifiers and gains only. Samples are looked up through the
/// owning recording, see [`ChannelGroup::analog_signals`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelGroup {
    pub id: u32,
    pub channels: Vec<Channel>,
    /// Id of the recording this group belongs to
    pub recording_id: u32,
}
