/// Core sequencer data - pattern grid, tempo and the shared pattern store
/// The scheduler only ever sees immutable snapshots of these values.
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{EngineError, Result};

pub mod playback;
pub mod transport;

pub const TRACK_COUNT: usize = 8;
pub const STEP_COUNT: usize = 16;

pub const MIN_BPM: f64 = 20.0;
pub const MAX_BPM: f64 = 300.0;
pub const DEFAULT_BPM: f64 = 120.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instrument {
    Kick,
    Snare,
    HiHat,
    Tom1,
    Tom2,
    Clap,
    Cymbal,
    Perc,
}

impl Instrument {
    pub const ALL: [Instrument; TRACK_COUNT] = [
        Instrument::Kick,
        Instrument::Snare,
        Instrument::HiHat,
        Instrument::Tom1,
        Instrument::Tom2,
        Instrument::Clap,
        Instrument::Cymbal,
        Instrument::Perc,
    ];

    /// Instrument played by a pattern row
    pub fn for_track(track: usize) -> Option<Self> {
        Self::ALL.get(track).copied()
    }

    pub fn track(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Instrument::Kick => "Kick",
            Instrument::Snare => "Snare",
            Instrument::HiHat => "HiHat",
            Instrument::Tom1 => "Tom 1",
            Instrument::Tom2 => "Tom 2",
            Instrument::Clap => "Clap",
            Instrument::Cymbal => "Cymbal",
            Instrument::Perc => "Perc",
        }
    }

    /// Look up an instrument by any of its common names, case-insensitive
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        let instrument = match name.as_str() {
            "kick" => Instrument::Kick,
            "snare" => Instrument::Snare,
            "hihat" | "hi-hat" | "hi hat" => Instrument::HiHat,
            "tom" | "tom 1" | "tom1" => Instrument::Tom1,
            "tom 2" | "tom2" => Instrument::Tom2,
            "clap" => Instrument::Clap,
            "cymbal" | "crash" => Instrument::Cymbal,
            "perc" | "percussion" | "rim" | "shaker" => Instrument::Perc,
            _ => return None,
        };
        Some(instrument)
    }

    /// Base pitch of the synthesized voice in Hz
    pub fn base_frequency(self) -> f32 {
        match self {
            Instrument::Kick => 60.0,
            Instrument::Snare => 200.0,
            Instrument::HiHat => 800.0,
            Instrument::Tom1 => 100.0,
            Instrument::Tom2 => 80.0,
            Instrument::Clap => 400.0,
            Instrument::Cymbal => 600.0,
            Instrument::Perc => 300.0,
        }
    }
}

/// Beats per minute, always finite and within `MIN_BPM..=MAX_BPM`
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Tempo(f64);

impl Tempo {
    /// Rejects non-finite and non-positive values, clamps the rest.
    pub fn new(bpm: f64) -> Result<Self> {
        if !bpm.is_finite() || bpm <= 0.0 {
            return Err(EngineError::InvalidTempo(bpm));
        }
        Ok(Self(bpm.clamp(MIN_BPM, MAX_BPM)))
    }

    pub fn bpm(self) -> f64 {
        self.0
    }

    /// Length of one step in seconds
    pub fn step_duration(self, steps_per_beat: u32) -> f64 {
        60.0 / (self.0 * steps_per_beat.max(1) as f64)
    }
}

impl Default for Tempo {
    fn default() -> Self {
        Self(DEFAULT_BPM)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pattern {
    cells: [[bool; STEP_COUNT]; TRACK_COUNT],
}

impl Pattern {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pattern from (instrument name, steps) pairs.
    /// Unknown names are skipped and steps past `STEP_COUNT` are ignored.
    pub fn from_named_tracks<'a, I>(tracks: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [bool])>,
    {
        let mut pattern = Self::new();
        for (name, steps) in tracks {
            let Some(instrument) = Instrument::from_name(name) else {
                log::debug!(target: "sequencer", "ignoring unknown instrument {:?}", name);
                continue;
            };
            for (step, &active) in steps.iter().take(STEP_COUNT).enumerate() {
                pattern.set(instrument.track(), step, active);
            }
        }
        pattern
    }

    pub fn get(&self, track: usize, step: usize) -> bool {
        self.cells
            .get(track)
            .and_then(|row| row.get(step))
            .copied()
            .unwrap_or(false)
    }

    pub fn set(&mut self, track: usize, step: usize, value: bool) {
        if let Some(row) = self.cells.get_mut(track) {
            if let Some(cell) = row.get_mut(step) {
                *cell = value;
            }
        }
    }

    pub fn toggle(&mut self, track: usize, step: usize) {
        let current = self.get(track, step);
        self.set(track, step, !current);
    }

    pub fn clear(&mut self) {
        self.cells = [[false; STEP_COUNT]; TRACK_COUNT];
    }

    pub fn is_empty(&self) -> bool {
        self.cells.iter().flatten().all(|cell| !cell)
    }

    /// Tracks with an active cell in the given step column, in track order
    pub fn active_tracks(&self, step: usize) -> impl Iterator<Item = usize> + '_ {
        (0..TRACK_COUNT).filter(move |&track| self.get(track, step))
    }
}

/// Read side of the pattern store, as seen by the scheduler.
/// Both calls are made from the timing loop and must not block.
pub trait PatternSource: Send + Sync {
    fn current_pattern(&self) -> Arc<Pattern>;
    fn current_tempo(&self) -> Tempo;
}

/// Shared pattern and tempo, owned by the application.
///
/// Edits replace the whole pattern, so a reader holding a snapshot never
/// sees a half-applied change.
pub struct PatternStore {
    pattern: ArcSwap<Pattern>,
    tempo_bits: AtomicU64,
}

impl PatternStore {
    pub fn new() -> Self {
        Self::with_pattern(Pattern::new(), Tempo::default())
    }

    pub fn with_pattern(pattern: Pattern, tempo: Tempo) -> Self {
        Self {
            pattern: ArcSwap::from_pointee(pattern),
            tempo_bits: AtomicU64::new(tempo.bpm().to_bits()),
        }
    }

    pub fn pattern(&self) -> Arc<Pattern> {
        self.pattern.load_full()
    }

    pub fn tempo(&self) -> Tempo {
        Tempo(f64::from_bits(self.tempo_bits.load(Ordering::Acquire)))
    }

    /// Validate and store a new tempo, returning the clamped value.
    pub fn set_tempo(&self, bpm: f64) -> Result<Tempo> {
        let tempo = Tempo::new(bpm)?;
        self.tempo_bits.store(tempo.bpm().to_bits(), Ordering::Release);
        Ok(tempo)
    }

    pub fn set_pattern(&self, pattern: Pattern) {
        self.pattern.store(Arc::new(pattern));
    }

    /// Swap in a generated or loaded pattern, with an optional tempo.
    /// An invalid tempo is rejected before anything is swapped.
    pub fn load(&self, pattern: Pattern, bpm: Option<f64>) -> Result<()> {
        let tempo = bpm.map(Tempo::new).transpose()?;
        self.set_pattern(pattern);
        if let Some(tempo) = tempo {
            self.tempo_bits.store(tempo.bpm().to_bits(), Ordering::Release);
        }
        Ok(())
    }

    /// Copy-on-write edit. The closure may run more than once if another
    /// writer races it.
    pub fn edit<F>(&self, f: F)
    where
        F: Fn(&mut Pattern),
    {
        self.pattern.rcu(|current| {
            let mut next = Pattern::clone(current);
            f(&mut next);
            next
        });
    }

    pub fn toggle_cell(&self, track: usize, step: usize) {
        self.edit(|pattern| pattern.toggle(track, step));
    }

    pub fn set_cell(&self, track: usize, step: usize, value: bool) {
        self.edit(|pattern| pattern.set(track, step, value));
    }

    pub fn clear(&self) {
        self.set_pattern(Pattern::new());
    }
}

impl Default for PatternStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternSource for PatternStore {
    fn current_pattern(&self) -> Arc<Pattern> {
        self.pattern()
    }

    fn current_tempo(&self) -> Tempo {
        self.tempo()
    }
}
