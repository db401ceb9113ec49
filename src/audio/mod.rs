//! Audio output: the process-wide playback queue and the sink collaborator
//! it drives. Synthesis/decoding internals live behind the [`AudioSink`]
//! trait and are not this crate's concern.

pub mod queue;

pub use queue::{AudioPlaybackQueue, AudioSink, PlaybackError, QueueItem, SimulatedSink};
