use ndarray::s;
use openephys_importer::{
    load_continuous, Experiment, ExperimentSettings, ProcessorIds, RecordFormat,
    RecordingOptions, RecordingSources, SignalMatrix,
};
use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

// Files named like "100_CH1.continuous", "all_channels.events", "Electrode_TT0.spikes"
fn files_with_extension(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, Box<dyn Error>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|e| e == extension))
        .collect();
    files.sort();
    Ok(files)
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let dir = std::env::args().nth(1).unwrap_or_else(|| "data".to_string());
    let dir = Path::new(&dir);

    let continuous_files: Vec<PathBuf> = files_with_extension(dir, "continuous")?
        .into_iter()
        .filter(|p| p.to_string_lossy().contains("CH"))
        .collect();
    if continuous_files.is_empty() {
        println!("No .continuous files found in {}", dir.display());
        return Ok(());
    }

    // Without a settings.xml reader, gains come from the file headers
    let mut channel_gains = BTreeMap::new();
    let mut acquisition = None;
    for (ch, path) in continuous_files.iter().enumerate() {
        let channel = load_continuous(path)?;
        channel_gains.insert(ch as u32, channel.header.bit_volts()?);
        if acquisition.is_none() {
            acquisition = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.split('_').next())
                .and_then(|id| id.parse().ok());
        }
    }

    let settings = ExperimentSettings {
        format: RecordFormat::OpenEphys,
        channel_gains,
        processors: ProcessorIds {
            acquisition,
            ..Default::default()
        },
        date: None,
    };
    let sync_messages = dir.join("sync_messages.txt");
    let events_file = dir.join("all_channels.events");
    let sources = RecordingSources {
        continuous_files,
        spike_files: files_with_extension(dir, "spikes")?,
        events_file: events_file.exists().then_some(events_file),
        sync_messages: sync_messages.exists().then_some(sync_messages),
        ..Default::default()
    };

    let experiment = Experiment::new(1, settings, None)?;
    let mut recording = experiment.open_recording(0, sources, RecordingOptions::default());

    println!("Sample rate: {} Hz", recording.sample_rate()?);
    println!("Start timestamp: {}", recording.start_timestamp()?);
    println!("Duration: {:.3} seconds", recording.duration()?);

    if let Some(signal) = recording.analog_signals()?.first() {
        println!(
            "\nAnalog signal: {} channels x {} samples",
            signal.signal.num_channels(),
            signal.num_samples()
        );
        if let SignalMatrix::Microvolts(samples) = &signal.signal {
            let num_samples = std::cmp::min(5, samples.ncols());
            let first = samples.slice(s![0, ..num_samples]);
            println!("  First channel data (first {} samples):", num_samples);
            for (i, value) in first.iter().enumerate() {
                println!("    {}: {} μV", i, value);
            }
        }
    }

    let trains = recording.spiketrains()?;
    println!("\nSpike trains: {}", trains.len());
    for train in trains.iter().take(5) {
        println!(
            "  {} on group {}: {} spikes",
            train.attrs().name,
            train.attrs().channel_group_id,
            train.spike_count()
        );
    }

    if let Some(digital) = recording.digital_in_signals()?.first() {
        for (ch, times) in digital.times.iter().enumerate().filter(|(_, t)| !t.is_empty()) {
            println!("Digital input {}: {} rising edges", ch, times.len());
        }
    }

    Ok(())
}
