/// Audio output using cpal
///
/// The stream lives on its own thread (cpal streams are not `Send` on every
/// host). The scheduler talks to it through two handles: `AudioClock`, which
/// counts rendered frames, and `AudioVoices`, which queues voices against
/// that frame count.
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::sequencer::playback::VoiceTrigger;
use crate::sequencer::Instrument;

mod voice;

pub use voice::{DrumVoice, VoiceCommand, VoiceMixer, MAX_VOICES};

const RESUME_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct StreamStatus {
    frames: AtomicU64,
    playing: AtomicBool,
    faulted: AtomicBool,
    dropped: AtomicU64,
}

enum Control {
    Play(Sender<Result<()>>),
    Pause,
    Shutdown,
}

pub struct AudioOutput {
    control_tx: Sender<Control>,
    voice_tx: Sender<VoiceCommand>,
    status: Arc<StreamStatus>,
    sample_rate: u32,
    thread: Option<JoinHandle<()>>,
}

impl AudioOutput {
    /// Open the default output device and start the stream.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let (voice_tx, voice_rx) = bounded::<VoiceCommand>(config.voice_queue_capacity);
        let (control_tx, control_rx) = bounded::<Control>(8);
        let (ready_tx, ready_rx) = bounded::<Result<u32>>(1);
        let status = Arc::new(StreamStatus::default());
        let pending_capacity = config.voice_queue_capacity;

        let thread_status = Arc::clone(&status);
        let thread = thread::Builder::new()
            .name("beatgrid-audio".to_string())
            .spawn(move || {
                run_stream(voice_rx, pending_capacity, control_rx, ready_tx, thread_status)
            })?;

        let sample_rate = match ready_rx.recv() {
            Ok(Ok(sample_rate)) => sample_rate,
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(err);
            }
            Err(_) => return Err(EngineError::OutputClosed),
        };

        log::info!(target: "audio", "output stream running at {} Hz", sample_rate);
        Ok(Self {
            control_tx,
            voice_tx,
            status,
            sample_rate,
            thread: Some(thread),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn clock(&self) -> AudioClock {
        AudioClock {
            status: Arc::clone(&self.status),
            sample_rate: self.sample_rate as f64,
            control_tx: self.control_tx.clone(),
        }
    }

    pub fn voices(&self) -> AudioVoices {
        AudioVoices {
            tx: self.voice_tx.clone(),
            sample_rate: self.sample_rate as f64,
        }
    }

    /// Suspend the stream. The clock stops until the next `resume`.
    pub fn pause(&self) {
        let _ = self.control_tx.send(Control::Pause);
    }

    /// Voices dropped by the audio callback because its queue was full
    pub fn dropped_voices(&self) -> u64 {
        self.status.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        let _ = self.control_tx.send(Control::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_stream(
    voice_rx: Receiver<VoiceCommand>,
    pending_capacity: usize,
    control_rx: Receiver<Control>,
    ready_tx: Sender<Result<u32>>,
    status: Arc<StreamStatus>,
) {
    let built = build_stream(voice_rx, pending_capacity, Arc::clone(&status));
    let (stream, sample_rate) = match built {
        Ok(built) => built,
        Err(err) => {
            log::error!(target: "audio", "could not open output: {}", err);
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    if let Err(err) = stream.play() {
        let _ = ready_tx.send(Err(EngineError::AudioDevice(err.to_string())));
        return;
    }
    status.playing.store(true, Ordering::Release);
    let _ = ready_tx.send(Ok(sample_rate));

    for control in control_rx.iter() {
        match control {
            Control::Play(reply) => {
                let result = stream
                    .play()
                    .map_err(|err| EngineError::AudioDevice(err.to_string()));
                if result.is_ok() {
                    status.faulted.store(false, Ordering::Release);
                    status.playing.store(true, Ordering::Release);
                }
                let _ = reply.send(result);
            }
            Control::Pause => match stream.pause() {
                Ok(()) => status.playing.store(false, Ordering::Release),
                Err(err) => log::warn!(target: "audio", "could not pause stream: {}", err),
            },
            Control::Shutdown => break,
        }
    }

    status.playing.store(false, Ordering::Release);
    log::debug!(target: "audio", "output stream closed");
}

fn build_stream(
    voice_rx: Receiver<VoiceCommand>,
    pending_capacity: usize,
    status: Arc<StreamStatus>,
) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| EngineError::AudioDevice("no default output device".to_string()))?;
    let supported = device
        .default_output_config()
        .map_err(|err| EngineError::AudioDevice(err.to_string()))?;

    let format = supported.sample_format();
    if format != cpal::SampleFormat::F32 {
        return Err(EngineError::UnsupportedSampleFormat(format!("{:?}", format)));
    }

    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;
    let config: cpal::StreamConfig = supported.into();

    let mut mixer = VoiceMixer::new(sample_rate as f32, pending_capacity);
    let callback_status = Arc::clone(&status);
    let error_status = status;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                while let Ok(cmd) = voice_rx.try_recv() {
                    if !mixer.schedule(cmd) {
                        callback_status.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }

                let start = callback_status.frames.load(Ordering::Acquire);
                mixer.render(start, data, channels);
                let rendered = (data.len() / channels.max(1)) as u64;
                callback_status.frames.store(start + rendered, Ordering::Release);
            },
            move |err| {
                log::error!(target: "audio", "output stream error: {}", err);
                error_status.faulted.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(|err| EngineError::AudioDevice(err.to_string()))?;

    Ok((stream, sample_rate))
}

/// Clock driven by the output stream's rendered frame count
#[derive(Clone)]
pub struct AudioClock {
    status: Arc<StreamStatus>,
    sample_rate: f64,
    control_tx: Sender<Control>,
}

impl Clock for AudioClock {
    fn now(&self) -> f64 {
        self.status.frames.load(Ordering::Acquire) as f64 / self.sample_rate
    }

    fn is_running(&self) -> bool {
        self.status.playing.load(Ordering::Acquire) && !self.status.faulted.load(Ordering::Acquire)
    }

    fn resume(&self) -> Result<()> {
        let (reply_tx, reply_rx) = bounded(1);
        self.control_tx
            .send(Control::Play(reply_tx))
            .map_err(|_| EngineError::OutputClosed)?;
        match reply_rx.recv_timeout(RESUME_TIMEOUT) {
            Ok(result) => result,
            Err(_) => Err(EngineError::ClockUnavailable(
                "audio stream did not resume".to_string(),
            )),
        }
    }
}

/// Voice sink that schedules drum voices on the output stream
#[derive(Clone)]
pub struct AudioVoices {
    tx: Sender<VoiceCommand>,
    sample_rate: f64,
}

impl VoiceTrigger for AudioVoices {
    fn trigger(&mut self, instrument: Instrument, at: f64) -> Result<()> {
        let start_frame = (at * self.sample_rate).round().max(0.0) as u64;
        self.tx
            .try_send(VoiceCommand {
                instrument,
                start_frame,
            })
            .map_err(|err| match err {
                TrySendError::Full(_) => EngineError::VoiceQueueFull,
                TrySendError::Disconnected(_) => EngineError::OutputClosed,
            })
    }
}

/// Silent sink, used when no output device is available
#[derive(Debug, Clone, Copy, Default)]
pub struct NullVoices;

impl VoiceTrigger for NullVoices {
    fn trigger(&mut self, instrument: Instrument, at: f64) -> Result<()> {
        log::trace!(target: "audio", "silent {} at {:.4}", instrument.name(), at);
        Ok(())
    }
}
