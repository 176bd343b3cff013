pub mod cache;
pub mod continuous;
pub mod error;
pub mod events;
pub mod header;
pub mod npy;
pub mod probe;
pub mod recording;
pub mod settings;
pub mod spikes;
pub mod sync;
pub mod tracking;
pub mod types;

use std::path::Path;

// Re-export types
pub use error::{OpenEphysError, Result};
pub use recording::{
    CacheCategory, ClipWindow, EventStreams, Experiment, Recording, RecordingOptions,
    RecordingSources, Session,
};
pub use settings::{ExperimentSettings, ProcessorIds, RecordFormat};
pub use sync::{align, assign_ttl, SyncOptions};
pub use types::*;

/// Loads a `.continuous` file with default options: samples in microvolts,
/// trailing partial record dropped.
///
/// # Examples
///
/// ```no_run
/// use openephys_importer::load_continuous;
///
/// match load_continuous("100_CH1.continuous") {
///     Ok(channel) => println!("{} records", channel.timestamps.len()),
///     Err(e) => println!("Error loading file: {}", e),
/// }
/// ```
pub fn load_continuous<P: AsRef<Path>>(file_path: P) -> Result<continuous::ContinuousChannel> {
    continuous::read_continuous_file(file_path, &continuous::ContinuousReadOptions::default())
}

/// Loads a `.spikes` file with the default capacity bound.
pub fn load_spikes<P: AsRef<Path>>(file_path: P) -> Result<spikes::SpikeData> {
    spikes::read_spike_file(file_path, &spikes::SpikeReadOptions::default())
}

/// Loads an `.events` file.
pub fn load_events<P: AsRef<Path>>(file_path: P) -> Result<events::EventData> {
    events::read_event_file(file_path)
}
