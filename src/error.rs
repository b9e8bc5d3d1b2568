/// Engine error types
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid tempo: {0} bpm")]
    InvalidTempo(f64),

    #[error("invalid engine config: {0}")]
    InvalidConfig(String),

    #[error("clock unavailable: {0}")]
    ClockUnavailable(String),

    #[error("voice queue is full")]
    VoiceQueueFull,

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("unsupported sample format: {0}")]
    UnsupportedSampleFormat(String),

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("audio output has shut down")]
    OutputClosed,
}

pub type Result<T> = std::result::Result<T, EngineError>;
