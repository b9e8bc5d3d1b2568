/// beatgrid - a step-sequencer playback engine
///
/// This library provides the playback core of a drum step sequencer:
/// - Pattern grid and tempo, shared lock-free with the UI
/// - Lookahead scheduler for drift-free, jitter-tolerant step timing
/// - Transport controller owning the background timing loop
/// - Synthesized drum voices on a cpal output stream

pub mod audio;
pub mod clock;
pub mod config;
pub mod error;
pub mod sequencer;
pub mod timer;

// Re-export commonly used types
pub use audio::{AudioClock, AudioOutput, AudioVoices, NullVoices};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use sequencer::playback::{
    PlaybackEvent, ScheduledEvent, Scheduler, TransportState, VoiceTrigger,
};
pub use sequencer::transport::{Transport, TransportSnapshot, SUBSCRIBER_CAPACITY};
pub use sequencer::{
    Instrument, Pattern, PatternSource, PatternStore, Tempo, STEP_COUNT, TRACK_COUNT,
};
