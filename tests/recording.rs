mod common;

use ndarray::Array1;
use openephys_importer::continuous::BinaryReadMode;
use openephys_importer::probe::ProbeLayout;
use openephys_importer::tracking::TrackingSource;
use openephys_importer::{
    CacheCategory, ClipWindow, Experiment, OpenEphysError, RecordFormat, Recording,
    RecordingOptions, RecordingSources, Session, SignalMatrix,
};
use std::fs;
use tempfile::TempDir;

use common::*;

const PROBE: &str = "\
# two shanks
channel_groups = {
    0: {'channels': [0, 1],
        'oe_channels': [3, 1],
        'geometry': {0: (0, 0), 1: (0, 20)}},
    1: {'channels': [2], 'oe_channels': [0]},
}
";

fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-9, "{actual:?} vs {expected:?}");
    }
}

fn waveform(num_channels: usize) -> Vec<Vec<u16>> {
    (0..num_channels)
        .map(|ch| (0..8).map(|s| 32768 + (ch * 10 + s) as u16).collect())
        .collect()
}

/// Writes a complete recording in the per-channel layout.
fn write_recording(dir: &TempDir) -> RecordingSources {
    let root = dir.path();
    let continuous_files = write_channel_files(root);

    let spikes = [(1010, 1), (1030, 1), (1050, 2)].map(|(timestamp, cluster)| Spike {
        timestamp,
        source: 0,
        cluster,
        waveform: waveform(NUM_CHANNELS as usize),
    });
    let spike_file = write_spikes(&root.join("Electrode_TT0.spikes"), NUM_CHANNELS as usize, &spikes);

    let acq = ACQUISITION as u8;
    let sync = SYNC as u8;
    let events_file = write_events(
        &root.join("all_channels.events"),
        &[
            (1000, sync, 1),
            (1010, acq, 0),
            (1020, acq, 0),
            (1025, sync, 1),
            (1050, acq, 0),
            (1050, sync, 1),
            (1060, acq, 0),
            (1075, sync, 1),
        ],
    );

    let tracking_dir = root.join("tracking");
    fs::create_dir(&tracking_dir).unwrap();
    let floats: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    write_npy(&tracking_dir.join("data_array.npy"), "<f4", &[3, 4], &floats);
    write_npy(&tracking_dir.join("timestamps.npy"), "<i8", &[3], &i64_payload(&[0, 26, 76]));
    write_npy(&tracking_dir.join("channels.npy"), "<i8", &[3], &i64_payload(&[0, 0, 0]));

    RecordingSources {
        continuous_files,
        spike_files: vec![spike_file],
        events_file: Some(events_file),
        tracking: vec![TrackingSource::in_dir(&tracking_dir)],
        sync_messages: Some(write_sync_messages(&root.join("sync_messages.txt"))),
        ..Default::default()
    }
}

fn open(dir: &TempDir, probe: Option<&ProbeLayout>) -> Recording {
    let experiment = Experiment::new(1, settings(RecordFormat::OpenEphys), probe).unwrap();
    experiment.open_recording(0, write_recording(dir), RecordingOptions::default())
}

#[test]
fn test_analog_signals_are_decoded_once() {
    let dir = TempDir::new().unwrap();
    let mut recording = open(&dir, None);
    assert_eq!(recording.decode_count(CacheCategory::Analog), 0);

    let first = recording.analog_signals().unwrap().to_vec();
    let second = recording.analog_signals().unwrap().to_vec();
    assert_eq!(first, second);
    assert_eq!(recording.decode_count(CacheCategory::Analog), 1);

    let signal = &first[0];
    assert_eq!(signal.sample_rate, SAMPLE_RATE);
    let SignalMatrix::Microvolts(samples) = &signal.signal else {
        panic!("expected microvolts");
    };
    assert_eq!(samples.dim(), (4, 100));
    assert_eq!(samples[[2, 37]], f64::from(raw_sample(2, 37)) * BIT_VOLTS);
    assert_eq!(signal.times[0], 0.0);
    assert!((signal.times[99] - 0.99).abs() < 1e-12);
    assert_eq!(signal.timestamps.len(), 100);
    assert_eq!(signal.timestamps[0], START);
    assert_eq!(signal.timestamps[99], START + 99);
}

#[test]
fn test_duration_and_clock() {
    let dir = TempDir::new().unwrap();
    let mut recording = open(&dir, None);

    assert_eq!(recording.start_timestamp().unwrap(), START);
    assert_eq!(recording.sample_rate().unwrap(), SAMPLE_RATE);
    assert_eq!(recording.duration().unwrap(), 1.0);
    assert_eq!(recording.times().unwrap().len(), 100);
}

#[test]
fn test_clock_from_first_record_without_sync_messages() {
    let dir = TempDir::new().unwrap();
    let experiment = Experiment::new(1, settings(RecordFormat::OpenEphys), None).unwrap();
    let sources = RecordingSources {
        sync_messages: None,
        ..write_recording(&dir)
    };
    let mut recording = experiment.open_recording(0, sources, RecordingOptions::default());

    assert_eq!(recording.start_timestamp().unwrap(), START);
    assert_eq!(recording.analog_signals().unwrap()[0].times[0], 0.0);
}

#[test]
fn test_spiketrains_split_by_cluster() {
    let dir = TempDir::new().unwrap();
    let mut recording = open(&dir, None);

    let trains = recording.spiketrains().unwrap().to_vec();
    assert_eq!(trains.len(), 2);
    assert_eq!(recording.decode_count(CacheCategory::Spikes), 1);

    let unit = &trains[0];
    assert_eq!(unit.attrs().name, "Unit #1");
    assert_eq!(unit.attrs().channel_group_id, 0);
    assert_close(&unit.times().to_vec(), &[0.1, 0.3]);
    assert_eq!(unit.t_stop(), 1.0);
    assert_eq!(unit.waveforms().shape(), &[2, 4, 8]);
    // channel 3, sample 5
    assert_eq!(unit.waveforms()[[1, 3, 5]], 35.0);

    assert_eq!(trains[1].spike_count(), 1);
    assert_close(&trains[1].times().to_vec(), &[0.5]);
}

#[test]
fn test_spike_file_named_for_another_group() {
    let dir = TempDir::new().unwrap();
    let experiment = Experiment::new(1, settings(RecordFormat::OpenEphys), None).unwrap();
    let mut sources = write_recording(&dir);
    let renamed = dir.path().join("Electrode_TT3.spikes");
    fs::rename(&sources.spike_files[0], &renamed).unwrap();
    sources.spike_files = vec![renamed];
    let mut recording = experiment.open_recording(0, sources, RecordingOptions::default());

    assert!(matches!(recording.spiketrains(), Err(OpenEphysError::Format(_))));
}

#[test]
fn test_digital_and_sync_signals() {
    let dir = TempDir::new().unwrap();
    let mut recording = open(&dir, None);

    let digital = recording.digital_in_signals().unwrap().to_vec();
    assert_eq!(digital.len(), 1);
    assert_eq!(digital[0].channel_ids.len(), 8);
    assert_close(&digital[0].times[0].to_vec(), &[0.1, 0.5]);
    assert!(digital[0].times[1].is_empty());

    let sync = recording.sync_signals().unwrap().to_vec();
    assert_eq!(sync[0].channel_ids, vec![1]);
    assert_close(&sync[0].times[0].to_vec(), &[0.0, 0.25, 0.5, 0.75]);

    assert_eq!(recording.events().unwrap().map(|e| e.len()), Some(8));
    assert_eq!(recording.decode_count(CacheCategory::Events), 1);
}

#[test]
fn test_tracking_aligned_to_sync_pulses() {
    let dir = TempDir::new().unwrap();
    let mut recording = open(&dir, None);

    let tracking = recording.tracking().unwrap().to_vec();
    assert_close(&tracking[0].times.to_vec(), &[0.0, 0.26, 0.76]);
    assert_eq!(tracking[0].x.to_vec(), vec![1.0, 5.0, 9.0]);

    let pulses = recording.sync_signals().unwrap()[0].times[0].clone();
    let aligned = recording.aligned_tracking(&pulses).unwrap();
    let aligned = &aligned[0];
    assert_eq!(aligned.times, pulses);
    assert_eq!(aligned.x[0], 1.0);
    assert_eq!(aligned.x[1], 5.0);
    assert!(aligned.x[2].is_nan());
    assert_eq!(aligned.channels[2], -1);
    assert_eq!(aligned.y[3], 10.0);
}

#[test]
fn test_sequential_channel_group_without_probe() {
    let dir = TempDir::new().unwrap();
    let mut recording = open(&dir, None);

    let groups = recording.channel_groups().unwrap().to_vec();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].channels.len(), 4);
    assert_eq!(groups[0].recording_id, 0);
    assert_eq!(recording.channel_group(2).unwrap().map(|g| g.id), Some(0));
    assert!(recording.channel_group(9).unwrap().is_none());

    let analog = groups[0].analog_signals(&mut recording).unwrap();
    assert_eq!(analog[0].signal.num_channels(), 4);
    assert_eq!(groups[0].spiketrains(&mut recording).unwrap().len(), 2);
}

#[test]
fn test_probe_selects_and_orders_channels() {
    let dir = TempDir::new().unwrap();
    let probe = ProbeLayout::parse(PROBE).unwrap();
    let experiment = Experiment::new(1, settings(RecordFormat::OpenEphys), Some(&probe)).unwrap();
    assert_eq!(experiment.keep_channels(), Some(&[3, 1, 0][..]));

    let mut recording = experiment.open_recording(0, write_recording(&dir), RecordingOptions::default());
    let all = recording.analog_signals().unwrap().to_vec();
    assert_eq!(all[0].signal.num_channels(), 3);

    let second = recording.channel_group_by_id(1).unwrap().cloned().unwrap();
    assert_eq!(second.channels[0].name, "channel_2_channel_group_1");
    let analog = second.analog_signals(&mut recording).unwrap();
    let SignalMatrix::Microvolts(samples) = &analog[0].signal else {
        panic!("expected microvolts");
    };
    // oe channel 0
    assert_eq!(samples[[0, 10]], f64::from(raw_sample(0, 10)) * BIT_VOLTS);

    let first = recording.channel_group(1).unwrap().cloned().unwrap();
    assert_eq!(first.id, 0);
    assert_eq!(first.channels[1].row, 1);
    assert_eq!(recording.decode_count(CacheCategory::ChannelGroups), 1);
}

#[test]
fn test_probe_channel_not_recorded() {
    let probe = ProbeLayout::parse(
        "channel_groups = {0: {'channels': [0, 1], 'oe_channels': [1, 7]}}",
    )
    .unwrap();
    let err = Experiment::new(1, settings(RecordFormat::OpenEphys), Some(&probe)).unwrap_err();
    assert!(matches!(
        err,
        OpenEphysError::ConfigurationMismatch { channel: 7, group: 0 }
    ));
}

#[test]
fn test_channel_group_of_another_recording() {
    let dir = TempDir::new().unwrap();
    let mut experiment = Experiment::new(1, settings(RecordFormat::OpenEphys), None).unwrap();
    let sources = write_recording(&dir);
    experiment.add_recording(0, sources.clone(), RecordingOptions::default());
    experiment.add_recording(1, sources, RecordingOptions::default());

    let group = experiment
        .recording_mut(0)
        .unwrap()
        .channel_groups()
        .unwrap()[0]
        .clone();
    let other = experiment.recording_mut(1).unwrap();
    assert!(matches!(
        group.analog_signals(other),
        Err(OpenEphysError::InvalidArgument(_))
    ));
    assert_eq!(other.decode_count(CacheCategory::Analog), 0);
}

#[test]
fn test_clip_between() {
    let dir = TempDir::new().unwrap();
    let mut recording = open(&dir, None);
    recording.clip(ClipWindow::Between(0.2, 0.6)).unwrap();

    let analog = recording.analog_signals().unwrap()[0].clone();
    assert_eq!(analog.num_samples(), 40);
    assert_eq!(analog.times.len(), 40);
    assert!((analog.times[0] - 0.01).abs() < 1e-9);
    assert!((analog.times[39] - 0.4).abs() < 1e-9);
    assert_eq!(analog.timestamps.len(), 40);
    assert_eq!(analog.timestamps[0], START + 21);
    assert_eq!(analog.timestamps[39], START + 60);
    let SignalMatrix::Microvolts(samples) = &analog.signal else {
        panic!("expected microvolts");
    };
    assert_eq!(samples[[1, 0]], f64::from(raw_sample(1, 21)) * BIT_VOLTS);

    let digital = recording.digital_in_signals().unwrap()[0].clone();
    assert_close(&digital.times[0].to_vec(), &[0.3]);
    let sync = recording.sync_signals().unwrap()[0].clone();
    assert_close(&sync.times[0].to_vec(), &[0.05, 0.3]);

    let tracking = recording.tracking().unwrap()[0].clone();
    assert_close(&tracking.times.to_vec(), &[0.06]);
    assert_eq!(tracking.y.to_vec(), vec![6.0]);

    let trains = recording.spiketrains().unwrap().to_vec();
    assert_close(&trains[0].times().to_vec(), &[0.1]);
    assert_close(&trains[1].times().to_vec(), &[0.3]);
    assert!((trains[0].t_stop() - 0.4).abs() < 1e-9);
    assert_eq!(trains[0].waveforms().shape(), &[1, 4, 8]);

    for category in [
        CacheCategory::Analog,
        CacheCategory::Spikes,
        CacheCategory::Events,
        CacheCategory::Tracking,
    ] {
        assert_eq!(recording.decode_count(category), 1);
    }
}

#[test]
fn test_clip_start_and_end() {
    let dir = TempDir::new().unwrap();
    let mut recording = open(&dir, None);
    recording.clip(ClipWindow::Start(0.5)).unwrap();

    let analog = recording.analog_signals().unwrap()[0].clone();
    assert_eq!(analog.num_samples(), 50);
    assert_eq!(analog.times[0], 0.0);
    // strict bound drops the edge at exactly 0.5
    assert!(recording.digital_in_signals().unwrap()[0].times[0].is_empty());

    let dir = TempDir::new().unwrap();
    let mut recording = open(&dir, None);
    recording.clip(ClipWindow::End(0.5)).unwrap();
    let analog = recording.analog_signals().unwrap()[0].clone();
    assert_eq!(analog.num_samples(), 51);
    assert_eq!(analog.times[50], 0.5);
    assert_close(&recording.digital_in_signals().unwrap()[0].times[0].to_vec(), &[0.1]);
}

#[test]
fn test_invalid_clip_windows() {
    let dir = TempDir::new().unwrap();
    let mut recording = open(&dir, None);

    assert!(matches!(
        recording.clip(ClipWindow::Between(0.6, 0.2)),
        Err(OpenEphysError::InvalidArgument(_))
    ));
    assert!(recording.clip(ClipWindow::Start(f64::NAN)).is_err());
    assert_eq!(recording.decode_count(CacheCategory::Analog), 0);
}

#[test]
fn test_missing_continuous_files() {
    let dir = TempDir::new().unwrap();
    let experiment = Experiment::new(1, settings(RecordFormat::OpenEphys), None).unwrap();
    let mut sources = write_recording(&dir);
    sources.continuous_files.truncate(2);
    let mut recording = experiment.open_recording(0, sources, RecordingOptions::default());

    assert!(matches!(
        recording.analog_signals(),
        Err(OpenEphysError::MissingMetadata(_))
    ));
    assert!(recording.analog_signals().is_err());
    assert_eq!(recording.decode_count(CacheCategory::Analog), 2);
}

fn write_binary_recording(dir: &TempDir, timestamps: &[i64]) -> RecordingSources {
    let root = dir.path();
    let num_samples = 100;
    let mut dat = Vec::new();
    for s in 0..num_samples {
        for ch in 0..NUM_CHANNELS {
            dat.extend_from_slice(&raw_sample(ch, s).to_le_bytes());
        }
    }
    let binary_file = root.join("continuous.dat");
    fs::write(&binary_file, dat).unwrap();

    RecordingSources {
        binary_file: Some(binary_file),
        timestamps_file: Some(write_npy(
            &root.join("timestamps.npy"),
            "<i8",
            &[timestamps.len()],
            &i64_payload(timestamps),
        )),
        sync_messages: Some(write_sync_messages(&root.join("sync_messages.txt"))),
        ..Default::default()
    }
}

#[test]
fn test_binary_layout_mapped_and_buffered_agree() {
    let dir = TempDir::new().unwrap();
    let timestamps: Vec<i64> = (START..START + 100).collect();
    let sources = write_binary_recording(&dir, &timestamps);
    let experiment = Experiment::new(1, settings(RecordFormat::RawBinary), None).unwrap();

    let mut mapped = experiment.open_recording(0, sources.clone(), RecordingOptions::default());
    let mut buffered = experiment.open_recording(
        0,
        sources,
        RecordingOptions {
            binary_mode: BinaryReadMode::Buffered,
            ..Default::default()
        },
    );

    let a = mapped.analog_signals().unwrap().to_vec();
    let b = buffered.analog_signals().unwrap().to_vec();
    assert_eq!(a, b);

    let SignalMatrix::Microvolts(samples) = &a[0].signal else {
        panic!("expected microvolts");
    };
    assert_eq!(samples.dim(), (4, 100));
    assert_eq!(samples[[3, 42]], f64::from(raw_sample(3, 42)) * BIT_VOLTS);
    assert_eq!(a[0].times[10], 0.1);
    assert_eq!(a[0].timestamps.to_vec(), timestamps);
    assert_eq!(mapped.duration().unwrap(), 1.0);
}

#[test]
fn test_binary_timestamp_count_mismatch() {
    let dir = TempDir::new().unwrap();
    let timestamps: Vec<i64> = (START..START + 90).collect();
    let sources = write_binary_recording(&dir, &timestamps);
    let experiment = Experiment::new(1, settings(RecordFormat::RawBinary), None).unwrap();
    let mut recording = experiment.open_recording(0, sources, RecordingOptions::default());

    assert!(matches!(
        recording.analog_signals(),
        Err(OpenEphysError::ChannelLengthMismatch {
            expected: 100,
            found: 90,
            ..
        })
    ));
}

#[test]
fn test_session_datetime_and_recordings() {
    let dir = TempDir::new().unwrap();
    let mut experiment = Experiment::new(1, settings(RecordFormat::OpenEphys), None).unwrap();
    experiment.add_recording(0, write_recording(&dir), RecordingOptions::default());

    let mut session = Session::new("2018-03-14_10-22-31", vec![experiment]);
    let date = session.datetime().unwrap().unwrap();
    assert_eq!(date.format("%Y-%m-%d").to_string(), "2018-03-14");

    let experiment = &mut session.experiments_mut()[0];
    assert_eq!(experiment.recordings().len(), 1);
    let recording = experiment.recording_mut(0).unwrap();
    assert_eq!(recording.format(), RecordFormat::OpenEphys);
    assert_eq!(recording.duration().unwrap(), 1.0);
}

#[test]
fn test_recording_without_acquisition_processor() {
    let dir = TempDir::new().unwrap();
    let mut settings = settings(RecordFormat::OpenEphys);
    settings.processors.acquisition = None;
    settings.processors.tracking = None;
    let experiment = Experiment::new(1, settings, None).unwrap();
    let mut recording = experiment.open_recording(0, write_recording(&dir), RecordingOptions::default());

    assert!(recording.analog_signals().unwrap().is_empty());
    assert!(recording.spiketrains().unwrap().is_empty());
    assert!(recording.tracking().unwrap().is_empty());
    assert!(recording.digital_in_signals().unwrap().is_empty());
    assert_eq!(recording.sync_signals().unwrap().len(), 1);
    assert_eq!(recording.times().unwrap(), Array1::<f64>::zeros(0));
}
