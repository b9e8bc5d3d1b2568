/// Lookahead scheduler - converts tempo and pattern into timed trigger events
///
/// Every tick dispatches all steps that fall before `now + lookahead`. Step
/// times are accumulated from the previous step's exact time, never from
/// `now`, so jitter in when ticks run never turns into tempo drift.
use super::{Instrument, PatternSource, STEP_COUNT};
use crate::config::EngineConfig;
use crate::error::Result;

/// Sound sink. Implementations schedule the voice at `at` on the engine
/// clock rather than playing it immediately.
///
/// Called from the timing loop with the transport locked: must not block
/// and must not call back into the transport.
pub trait VoiceTrigger: Send {
    fn trigger(&mut self, instrument: Instrument, at: f64) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledEvent {
    pub time: f64,
    pub step: usize,
    pub track: usize,
    pub instrument: Instrument,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Started { at: f64 },
    StepAdvanced { step: usize, time: f64 },
    VoiceFailed { event: ScheduledEvent, reason: String },
    /// Overdue steps dropped to keep one tick bounded.
    Skipped { steps: usize },
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Stopped,
    Playing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scheduler {
    steps_per_beat: u32,
    lookahead: f64,
    max_catch_up_steps: usize,
    state: TransportState,
    cursor: usize,
    next_step_time: f64,
    last_step: Option<usize>,
}

impl Scheduler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            steps_per_beat: config.steps_per_beat,
            lookahead: config.lookahead_secs(),
            max_catch_up_steps: config.max_catch_up_steps.max(1),
            state: TransportState::Stopped,
            cursor: 0,
            next_step_time: 0.0,
            last_step: None,
        }
    }

    /// Begin playback from step 0 at `now`. Restarts if already playing.
    pub fn start(&mut self, now: f64) {
        self.state = TransportState::Playing;
        self.cursor = 0;
        self.next_step_time = now;
        self.last_step = None;
    }

    pub fn stop(&mut self) {
        self.state = TransportState::Stopped;
        self.cursor = 0;
        self.last_step = None;
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == TransportState::Playing
    }

    /// Most recently dispatched step, `None` when stopped
    pub fn current_step(&self) -> Option<usize> {
        self.last_step
    }

    /// Next step to be dispatched
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Time of the next step, fixed when the previous step was dispatched
    pub fn next_step_time(&self) -> f64 {
        self.next_step_time
    }

    /// Dispatch every step due before `now + lookahead`.
    ///
    /// Returns the number of steps advanced. Does nothing while stopped.
    pub fn schedule<S, V, N>(&mut self, now: f64, source: &S, voices: &mut V, mut notify: N) -> usize
    where
        S: PatternSource + ?Sized,
        V: VoiceTrigger + ?Sized,
        N: FnMut(PlaybackEvent),
    {
        if !self.is_playing() {
            return 0;
        }

        let horizon = now + self.lookahead;
        self.skip_overdue(now, self.step_duration(source), &mut notify);

        let mut advanced = 0;
        while self.next_step_time < horizon {
            let due = self.next_step_time;
            self.dispatch_step(due, source, voices, &mut notify);
            advanced += 1;
            // One tempo read per increment. A later tempo change never moves
            // a step that already has its time.
            self.next_step_time = due + self.step_duration(source);
        }
        advanced
    }

    fn step_duration<S: PatternSource + ?Sized>(&self, source: &S) -> f64 {
        source.current_tempo().step_duration(self.steps_per_beat)
    }

    fn skip_overdue<N: FnMut(PlaybackEvent)>(&mut self, now: f64, step_duration: f64, notify: &mut N) {
        let due = self.next_step_time;
        if due >= now {
            return;
        }

        let overdue = ((now - due) / step_duration).ceil() as usize;
        if overdue <= self.max_catch_up_steps {
            return;
        }

        // Stay on the step grid: skip whole steps only.
        let skip = overdue - self.max_catch_up_steps;
        self.cursor = (self.cursor + skip) % STEP_COUNT;
        self.next_step_time = due + skip as f64 * step_duration;

        log::warn!(
            target: "scheduler",
            "timing loop fell {:.3}s behind, skipping {} steps",
            now - due,
            skip
        );
        notify(PlaybackEvent::Skipped { steps: skip });
    }

    fn dispatch_step<S, V, N>(&mut self, due: f64, source: &S, voices: &mut V, notify: &mut N)
    where
        S: PatternSource + ?Sized,
        V: VoiceTrigger + ?Sized,
        N: FnMut(PlaybackEvent),
    {
        let step = self.cursor;
        let pattern = source.current_pattern();

        for track in pattern.active_tracks(step) {
            let Some(instrument) = Instrument::for_track(track) else {
                continue;
            };
            let event = ScheduledEvent {
                time: due,
                step,
                track,
                instrument,
            };

            log::trace!(target: "scheduler", "trigger {} at {:.4} (step {})", instrument.name(), due, step);
            if let Err(err) = voices.trigger(instrument, due) {
                log::warn!(
                    target: "scheduler",
                    "dropped {} at step {}: {}",
                    instrument.name(),
                    step,
                    err
                );
                notify(PlaybackEvent::VoiceFailed {
                    event,
                    reason: err.to_string(),
                });
            }
        }

        notify(PlaybackEvent::StepAdvanced { step, time: due });

        self.last_step = Some(step);
        self.cursor = (step + 1) % STEP_COUNT;
    }
}
