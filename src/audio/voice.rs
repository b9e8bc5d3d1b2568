/// Drum voices and the sample-accurate mixer that starts them
use crate::sequencer::Instrument;

pub const MAX_VOICES: usize = 32; // fixed pool so the audio callback never allocates

/// A voice waiting to start at an absolute frame of the output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceCommand {
    pub instrument: Instrument,
    pub start_frame: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Kick,
    Snare,
    HiHat,
    Square,
}

impl Shape {
    fn for_instrument(instrument: Instrument) -> Self {
        match instrument {
            Instrument::Kick => Shape::Kick,
            Instrument::Snare => Shape::Snare,
            Instrument::HiHat => Shape::HiHat,
            _ => Shape::Square,
        }
    }
}

/// Exponential ramp from `start` towards `end` over `secs`
#[derive(Debug, Clone, Copy)]
struct Ramp {
    level: f32,
    factor: f32,
}

impl Ramp {
    fn new(start: f32, end: f32, secs: f32, sample_rate: f32) -> Self {
        let frames = (secs * sample_rate).max(1.0);
        Self {
            level: start,
            factor: (end / start).powf(1.0 / frames),
        }
    }

    fn next(&mut self) -> f32 {
        let value = self.level;
        self.level *= self.factor;
        value
    }
}

/// One-pole high-pass filter
#[derive(Debug, Clone, Copy)]
struct HighPass {
    alpha: f32,
    prev_in: f32,
    prev_out: f32,
}

impl HighPass {
    fn new(cutoff: f32, sample_rate: f32) -> Self {
        let rc = 1.0 / (std::f32::consts::TAU * cutoff);
        let dt = 1.0 / sample_rate;
        Self {
            alpha: rc / (rc + dt),
            prev_in: 0.0,
            prev_out: 0.0,
        }
    }

    fn process(&mut self, input: f32) -> f32 {
        let out = self.alpha * (self.prev_out + input - self.prev_in);
        self.prev_in = input;
        self.prev_out = out;
        out
    }
}

pub struct DrumVoice {
    shape: Shape,
    sample_rate: f32,
    phase: f32,
    pitch: Ramp,
    tone: Ramp,
    noise: Ramp,
    filter: HighPass,
    rng: fastrand::Rng,
    age: u32,
    length: u32,
}

impl DrumVoice {
    pub fn new(instrument: Instrument, sample_rate: f32, seed: u64) -> Self {
        let shape = Shape::for_instrument(instrument);
        let freq = instrument.base_frequency();
        let sr = sample_rate;

        // (tone gain, noise gain, decay seconds)
        let (tone_gain, noise_gain, decay) = match shape {
            Shape::Kick => (0.8, 0.0, 0.2),
            Shape::Snare => (0.5, 0.3, 0.1),
            Shape::HiHat => (0.0, 0.2, 0.05),
            Shape::Square => (0.3, 0.0, 0.1),
        };

        let pitch = match shape {
            Shape::Kick => Ramp::new(freq, 30.0, 0.1, sr),
            _ => Ramp { level: freq, factor: 1.0 },
        };

        Self {
            shape,
            sample_rate: sr,
            phase: 0.0,
            pitch,
            tone: ramp_or_silent(tone_gain, decay, sr),
            noise: ramp_or_silent(noise_gain, decay, sr),
            filter: HighPass::new(5000.0, sr),
            rng: fastrand::Rng::with_seed(seed),
            age: 0,
            length: (decay * sr) as u32,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.age < self.length
    }

    pub fn next_sample(&mut self) -> f32 {
        if !self.is_alive() {
            return 0.0;
        }
        self.age += 1;

        let freq = if self.shape == Shape::Kick && self.pitch.level > 30.0 {
            self.pitch.next()
        } else {
            self.pitch.level
        };

        let tone = match self.shape {
            Shape::Kick => (self.phase * std::f32::consts::TAU).sin(),
            Shape::Snare => 1.0 - 4.0 * (self.phase - 0.5).abs(),
            Shape::HiHat => 0.0,
            Shape::Square => {
                if self.phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
        };
        self.phase += freq / self.sample_rate;
        if self.phase >= 1.0 {
            self.phase -= 1.0;
        }

        let mut out = tone * self.tone.next();
        let noise_gain = self.noise.next();
        if noise_gain > 0.0 {
            let noise = self.rng.f32() * 2.0 - 1.0;
            let noise = if self.shape == Shape::HiHat {
                self.filter.process(noise)
            } else {
                noise
            };
            out += noise * noise_gain;
        }
        out
    }
}

fn ramp_or_silent(gain: f32, decay: f32, sample_rate: f32) -> Ramp {
    if gain > 0.0 {
        Ramp::new(gain, 0.01, decay, sample_rate)
    } else {
        Ramp { level: 0.0, factor: 1.0 }
    }
}

/// Holds pending voice starts and renders the active voices.
/// Runs inside the audio callback: no allocation after construction.
pub struct VoiceMixer {
    sample_rate: f32,
    voices: Vec<DrumVoice>,
    pending: Vec<VoiceCommand>,
    pending_capacity: usize,
    // earliest start_frame in `pending`, u64::MAX when empty
    next_due: u64,
    rng: fastrand::Rng,
}

impl VoiceMixer {
    /// `pending_capacity` matches the command queue feeding the mixer, so a
    /// full drain of that queue always fits.
    pub fn new(sample_rate: f32, pending_capacity: usize) -> Self {
        Self {
            sample_rate,
            voices: Vec::with_capacity(MAX_VOICES),
            pending: Vec::with_capacity(pending_capacity),
            pending_capacity,
            next_due: u64::MAX,
            rng: fastrand::Rng::with_seed(0x5eed),
        }
    }

    /// Queue a voice. Returns false when the pending list is full.
    pub fn schedule(&mut self, cmd: VoiceCommand) -> bool {
        if self.pending.len() >= self.pending_capacity {
            return false;
        }
        self.next_due = self.next_due.min(cmd.start_frame);
        self.pending.push(cmd);
        true
    }

    pub fn active_voices(&self) -> usize {
        self.voices.iter().filter(|v| v.is_alive()).count()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Render interleaved output starting at absolute frame `start_frame`.
    /// Late commands start on the first frame of the block.
    pub fn render(&mut self, start_frame: u64, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        for (i, frame) in out.chunks_mut(channels).enumerate() {
            self.start_due(start_frame + i as u64);

            let mut sample = 0.0f32;
            for voice in &mut self.voices {
                sample += voice.next_sample();
            }
            let sample = sample.clamp(-1.0, 1.0);
            for out_sample in frame.iter_mut() {
                *out_sample = sample;
            }
        }
        self.voices.retain(DrumVoice::is_alive);
    }

    fn start_due(&mut self, frame: u64) {
        if frame < self.next_due {
            return;
        }

        let mut index = 0;
        while index < self.pending.len() {
            if self.pending[index].start_frame <= frame {
                let cmd = self.pending.swap_remove(index);
                self.start_voice(cmd.instrument);
            } else {
                index += 1;
            }
        }
        self.next_due = self
            .pending
            .iter()
            .map(|cmd| cmd.start_frame)
            .min()
            .unwrap_or(u64::MAX);
    }

    fn start_voice(&mut self, instrument: Instrument) {
        if self.voices.len() >= MAX_VOICES {
            // steal the oldest
            self.voices.remove(0);
        }
        let seed = self.rng.u64(..);
        self.voices
            .push(DrumVoice::new(instrument, self.sample_rate, seed));
    }
}
