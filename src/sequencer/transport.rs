/// Transport - start/stop control and the background timing loop
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::playback::{PlaybackEvent, Scheduler, TransportState, VoiceTrigger};
use super::PatternSource;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::timer::IntervalTimer;

/// Events buffered per subscriber before new ones are dropped
pub const SUBSCRIBER_CAPACITY: usize = 1024;

/// Copy of the transport's display state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportSnapshot {
    pub state: TransportState,
    pub current_step: Option<usize>,
    pub next_step_time: f64,
}

struct Core {
    scheduler: Scheduler,
    voices: Box<dyn VoiceTrigger>,
    subscribers: Vec<Sender<PlaybackEvent>>,
}

struct Shared {
    core: Mutex<Core>,
    source: Arc<dyn PatternSource>,
    clock: Arc<dyn Clock>,
}

pub struct Transport {
    shared: Arc<Shared>,
    timer: Option<IntervalTimer>,
    check_interval: Duration,
}

impl Transport {
    pub fn new<V>(
        source: Arc<dyn PatternSource>,
        voices: V,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Result<Self>
    where
        V: VoiceTrigger + 'static,
    {
        config.validate()?;

        let core = Core {
            scheduler: Scheduler::new(config),
            voices: Box::new(voices),
            subscribers: Vec::new(),
        };

        Ok(Self {
            shared: Arc::new(Shared {
                core: Mutex::new(core),
                source,
                clock,
            }),
            timer: None,
            check_interval: config.check_interval,
        })
    }

    /// Start playback from step 0. Restarts when already playing.
    pub fn start(&mut self) -> Result<()> {
        if let Some(mut timer) = self.timer.take() {
            timer.cancel();
        }

        if let Err(err) = self.ensure_clock_running() {
            self.halt();
            return Err(err);
        }

        let now = self.shared.clock.now();
        {
            let mut core = lock(&self.shared.core);
            if core.scheduler.is_playing() {
                log::debug!(target: "transport", "restarting from step 0");
            }
            core.scheduler.start(now);
            publish(&mut core.subscribers, PlaybackEvent::Started { at: now });
        }

        // Fill the first horizon right away rather than waiting a full interval.
        tick(&self.shared);

        let shared = Arc::clone(&self.shared);
        match IntervalTimer::spawn("beatgrid-scheduler", self.check_interval, move || tick(&shared)) {
            Ok(timer) => {
                self.timer = Some(timer);
                log::debug!(target: "transport", "started at {:.4}", now);
                Ok(())
            }
            Err(err) => {
                log::error!(target: "transport", "could not start timing loop: {}", err);
                self.halt();
                Err(err)
            }
        }
    }

    /// Stop playback. Once this returns no further voice is triggered.
    pub fn stop(&mut self) {
        let was_playing = self.halt();
        if let Some(mut timer) = self.timer.take() {
            timer.cancel();
        }
        if was_playing {
            log::debug!(target: "transport", "stopped");
        }
    }

    pub fn toggle(&mut self) -> Result<()> {
        if self.is_playing() {
            self.stop();
            Ok(())
        } else {
            self.start()
        }
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.shared.core).scheduler.is_playing()
    }

    pub fn state(&self) -> TransportState {
        lock(&self.shared.core).scheduler.state()
    }

    /// Step last handed to the voices, `None` while stopped
    pub fn current_step(&self) -> Option<usize> {
        lock(&self.shared.core).scheduler.current_step()
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        let core = lock(&self.shared.core);
        TransportSnapshot {
            state: core.scheduler.state(),
            current_step: core.scheduler.current_step(),
            next_step_time: core.scheduler.next_step_time(),
        }
    }

    /// Receive playback events. Dropping the receiver unsubscribes; a
    /// receiver that falls `SUBSCRIBER_CAPACITY` events behind misses events.
    pub fn subscribe(&self) -> Receiver<PlaybackEvent> {
        let (tx, rx) = bounded(SUBSCRIBER_CAPACITY);
        lock(&self.shared.core).subscribers.push(tx);
        rx
    }

    fn ensure_clock_running(&self) -> Result<()> {
        let clock = &self.shared.clock;
        if clock.is_running() {
            return Ok(());
        }

        log::warn!(target: "transport", "clock is suspended, resuming");
        clock.resume()?;
        if !clock.is_running() {
            return Err(EngineError::ClockUnavailable(
                "clock did not resume".to_string(),
            ));
        }
        Ok(())
    }

    /// Move the scheduler to Stopped, returning whether it was playing.
    fn halt(&self) -> bool {
        let mut core = lock(&self.shared.core);
        if !core.scheduler.is_playing() {
            return false;
        }
        core.scheduler.stop();
        publish(&mut core.subscribers, PlaybackEvent::Stopped);
        true
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn tick(shared: &Shared) {
    let now = shared.clock.now();
    let mut core = lock(&shared.core);
    let Core {
        scheduler,
        voices,
        subscribers,
    } = &mut *core;

    scheduler.schedule(now, &*shared.source, &mut **voices, |event| {
        publish(subscribers, event)
    });
}

fn publish(subscribers: &mut Vec<Sender<PlaybackEvent>>, event: PlaybackEvent) {
    subscribers.retain(|tx| match tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            log::trace!(target: "transport", "subscriber lagging, dropped {:?}", event);
            true
        }
        Err(TrySendError::Disconnected(_)) => false,
    });
}

// A panicking voice sink must not wedge the transport.
fn lock(core: &Mutex<Core>) -> MutexGuard<'_, Core> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sequencer::{Instrument, Pattern, PatternStore, Tempo, STEP_COUNT};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Instant;

    type Hits = Arc<Mutex<Vec<(Instrument, f64)>>>;

    struct SharedVoices {
        hits: Hits,
        fail: bool,
    }

    impl VoiceTrigger for SharedVoices {
        fn trigger(&mut self, instrument: Instrument, at: f64) -> Result<()> {
            if self.fail {
                return Err(EngineError::AudioDevice("unplugged".to_string()));
            }
            self.hits.lock().unwrap().push((instrument, at));
            Ok(())
        }
    }

    /// Clock that cannot be brought back once suspended
    #[derive(Clone)]
    struct StuckClock {
        running: Arc<AtomicBool>,
        refuse: bool,
    }

    impl StuckClock {
        fn new(running: bool, refuse: bool) -> Self {
            Self {
                running: Arc::new(AtomicBool::new(running)),
                refuse,
            }
        }
    }

    impl Clock for StuckClock {
        fn now(&self) -> f64 {
            0.0
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn resume(&self) -> Result<()> {
            if self.refuse {
                return Err(EngineError::ClockUnavailable("device lost".to_string()));
            }
            // reports success but never actually restarts
            Ok(())
        }
    }

    fn transport_on(clock: StuckClock, hits: &Hits) -> Transport {
        let mut pattern = Pattern::new();
        pattern.set(0, 0, true);
        let store = Arc::new(PatternStore::with_pattern(pattern, Tempo::new(120.0).unwrap()));
        let voices = SharedVoices {
            hits: Arc::clone(hits),
            fail: false,
        };
        let config = EngineConfig::default().with_check_interval(Duration::from_millis(2));
        Transport::new(store, voices, Arc::new(clock), &config).unwrap()
    }

    struct Fixture {
        store: Arc<PatternStore>,
        clock: ManualClock,
        hits: Hits,
        transport: Transport,
    }

    fn fixture(cells: &[(usize, usize)], fail: bool) -> Fixture {
        let mut pattern = Pattern::new();
        for &(track, step) in cells {
            pattern.set(track, step, true);
        }
        let store = Arc::new(PatternStore::with_pattern(pattern, Tempo::new(120.0).unwrap()));
        let clock = ManualClock::new();
        let hits: Hits = Arc::default();
        let config = EngineConfig::default().with_check_interval(Duration::from_millis(2));

        let voices = SharedVoices {
            hits: Arc::clone(&hits),
            fail,
        };
        let transport = Transport::new(
            store.clone(),
            voices,
            Arc::new(clock.clone()),
            &config,
        )
        .unwrap();

        Fixture {
            store,
            clock,
            hits,
            transport,
        }
    }

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn hit_count(hits: &Hits) -> usize {
        hits.lock().unwrap().len()
    }

    #[test]
    fn test_new_transport_is_stopped() {
        let f = fixture(&[], false);
        assert!(!f.transport.is_playing());
        assert_eq!(f.transport.state(), TransportState::Stopped);
        assert_eq!(f.transport.current_step(), None);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig::default().with_steps_per_beat(0);
        let result = Transport::new(
            Arc::new(PatternStore::new()),
            SharedVoices {
                hits: Arc::default(),
                fail: false,
            },
            Arc::new(ManualClock::new()),
            &config,
        );
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_start_fires_first_step_immediately() {
        let mut f = fixture(&[(0, 0)], false);
        f.transport.start().unwrap();

        assert!(f.transport.is_playing());
        assert_eq!(f.transport.current_step(), Some(0));
        assert_eq!(f.hits.lock().unwrap().as_slice(), &[(Instrument::Kick, 0.0)]);
    }

    #[test]
    fn test_timing_loop_follows_clock() {
        let mut f = fixture(&[], false);
        f.transport.start().unwrap();

        f.clock.set(0.5);
        assert!(wait_for(|| f.transport.current_step() == Some(4)));
        assert!(f.transport.snapshot().next_step_time >= 0.6);
    }

    #[test]
    fn test_pattern_edits_reach_running_transport() {
        let mut f = fixture(&[], false);
        f.transport.start().unwrap();
        assert_eq!(hit_count(&f.hits), 0);

        f.store.set_cell(1, 4, true);
        f.clock.set(0.5);
        assert!(wait_for(|| hit_count(&f.hits) == 1));
        assert_eq!(f.hits.lock().unwrap()[0], (Instrument::Snare, 0.5));
    }

    #[test]
    fn test_toggle_switches_state() {
        let mut f = fixture(&[], false);
        f.transport.toggle().unwrap();
        assert!(f.transport.is_playing());

        f.transport.toggle().unwrap();
        assert!(!f.transport.is_playing());
        assert_eq!(f.transport.current_step(), None);
    }

    #[test]
    fn test_no_triggers_after_stop_returns() {
        let cells: Vec<_> = (0..STEP_COUNT).map(|step| (0, step)).collect();
        let mut f = fixture(&cells, false);
        f.transport.start().unwrap();

        f.clock.set(0.3);
        assert!(wait_for(|| f.transport.current_step() == Some(3)));

        f.transport.stop();
        let stopped_at = hit_count(&f.hits);

        f.clock.set(5.0);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(hit_count(&f.hits), stopped_at);
        assert_eq!(f.transport.current_step(), None);
    }

    #[test]
    fn test_stop_racing_the_timing_loop() {
        let cells: Vec<_> = (0..STEP_COUNT).map(|step| (0, step)).collect();
        let mut f = fixture(&cells, false);
        let clock = f.clock.clone();

        let driver = thread::spawn(move || {
            for _ in 0..200 {
                clock.advance(0.01);
                thread::sleep(Duration::from_micros(200));
            }
        });

        f.transport.start().unwrap();
        thread::sleep(Duration::from_millis(15));
        f.transport.stop();
        let stopped_at = hit_count(&f.hits);

        driver.join().unwrap();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(hit_count(&f.hits), stopped_at);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut f = fixture(&[], false);
        let events = f.transport.subscribe();

        f.transport.start().unwrap();
        f.transport.stop();
        let snapshot = f.transport.snapshot();
        f.transport.stop();

        assert_eq!(f.transport.snapshot(), snapshot);
        let stops = events
            .try_iter()
            .filter(|event| *event == PlaybackEvent::Stopped)
            .count();
        assert_eq!(stops, 1);
    }

    #[test]
    fn test_restart_resets_to_step_zero() {
        let mut f = fixture(&[(0, 0)], false);
        f.transport.start().unwrap();
        f.clock.set(0.5);
        assert!(wait_for(|| f.transport.current_step() == Some(4)));

        f.clock.set(10.0);
        f.transport.start().unwrap();

        assert!(f.transport.is_playing());
        assert_eq!(f.transport.current_step(), Some(0));
        assert_eq!(*f.hits.lock().unwrap().last().unwrap(), (Instrument::Kick, 10.0));
    }

    #[test]
    fn test_start_resumes_suspended_clock() {
        let mut f = fixture(&[], false);
        f.clock.suspend();
        f.transport.start().unwrap();

        assert!(f.clock.is_running());
        assert!(f.transport.is_playing());
    }

    #[test]
    fn test_start_fails_when_clock_refuses_to_resume() {
        let hits: Hits = Arc::default();
        let mut transport = transport_on(StuckClock::new(false, true), &hits);
        let events = transport.subscribe();

        let result = transport.start();

        assert!(matches!(result, Err(EngineError::ClockUnavailable(_))));
        assert!(!transport.is_playing());
        assert_eq!(transport.current_step(), None);
        assert!(transport.timer.is_none());
        assert_eq!(hit_count(&hits), 0);
        assert_eq!(events.try_iter().count(), 0);
    }

    #[test]
    fn test_start_fails_when_clock_stays_suspended() {
        let hits: Hits = Arc::default();
        let mut transport = transport_on(StuckClock::new(false, false), &hits);

        assert!(matches!(transport.start(), Err(EngineError::ClockUnavailable(_))));
        assert!(!transport.is_playing());
        assert_eq!(hit_count(&hits), 0);
    }

    #[test]
    fn test_failed_restart_stops_running_playback() {
        let hits: Hits = Arc::default();
        let clock = StuckClock::new(true, true);
        let mut transport = transport_on(clock.clone(), &hits);
        let events = transport.subscribe();

        transport.start().unwrap();
        assert!(transport.is_playing());
        assert_eq!(hit_count(&hits), 1);

        clock.running.store(false, Ordering::SeqCst);
        assert!(matches!(transport.start(), Err(EngineError::ClockUnavailable(_))));

        assert!(!transport.is_playing());
        assert!(transport.timer.is_none());
        let received: Vec<_> = events.try_iter().collect();
        assert_eq!(received.first(), Some(&PlaybackEvent::Started { at: 0.0 }));
        assert_eq!(received.last(), Some(&PlaybackEvent::Stopped));

        thread::sleep(Duration::from_millis(10));
        assert_eq!(hit_count(&hits), 1);
    }

    #[test]
    fn test_lagging_subscriber_keeps_subscription() {
        let (tx, rx) = bounded(2);
        let mut subscribers = vec![tx];

        for step in 0..5 {
            publish(&mut subscribers, PlaybackEvent::StepAdvanced { step, time: 0.0 });
        }
        assert_eq!(subscribers.len(), 1);
        let kept: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            kept,
            vec![
                PlaybackEvent::StepAdvanced { step: 0, time: 0.0 },
                PlaybackEvent::StepAdvanced { step: 1, time: 0.0 },
            ]
        );

        publish(&mut subscribers, PlaybackEvent::Stopped);
        assert_eq!(rx.try_recv(), Ok(PlaybackEvent::Stopped));

        drop(rx);
        publish(&mut subscribers, PlaybackEvent::Stopped);
        assert!(subscribers.is_empty());
    }

    #[test]
    fn test_events_arrive_in_order() {
        let mut f = fixture(&[], false);
        let events = f.transport.subscribe();
        f.transport.start().unwrap();
        f.clock.set(1.0);
        assert!(wait_for(|| f.transport.current_step() == Some(8)));
        f.transport.stop();

        let received: Vec<_> = events.try_iter().collect();
        assert_eq!(received[0], PlaybackEvent::Started { at: 0.0 });
        assert_eq!(*received.last().unwrap(), PlaybackEvent::Stopped);

        let steps: Vec<usize> = received
            .iter()
            .filter_map(|event| match event {
                PlaybackEvent::StepAdvanced { step, .. } => Some(*step),
                _ => None,
            })
            .collect();
        assert_eq!(steps, (0..=8).collect::<Vec<_>>());
    }

    #[test]
    fn test_dropped_subscriber_does_not_affect_playback() {
        let mut f = fixture(&[], false);
        let events = f.transport.subscribe();
        drop(events);

        f.transport.start().unwrap();
        f.clock.set(0.5);
        assert!(wait_for(|| f.transport.current_step() == Some(4)));
    }

    #[test]
    fn test_voice_failures_keep_playhead_moving() {
        let mut f = fixture(&[(0, 0), (0, 1), (0, 2)], true);
        let events = f.transport.subscribe();
        f.transport.start().unwrap();
        f.clock.set(0.25);
        assert!(wait_for(|| f.transport.current_step() == Some(2)));
        f.transport.stop();

        let failures = events
            .try_iter()
            .filter(|event| matches!(event, PlaybackEvent::VoiceFailed { .. }))
            .count();
        assert_eq!(failures, 3);
        assert_eq!(hit_count(&f.hits), 0);
    }
}
