#[cfg(feature = "gui")]
use eframe::egui;

#[cfg(feature = "gui")]
use beatgrid::{
    sequencer::{MAX_BPM, MIN_BPM},
    AudioOutput, EngineConfig, Instrument, NullVoices, PatternStore, PlaybackEvent, SystemClock,
    Transport, STEP_COUNT, TRACK_COUNT,
};

#[cfg(feature = "gui")]
use std::sync::Arc;

#[cfg(feature = "gui")]
fn main() -> Result<(), eframe::Error> {
    env_logger::init();

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([900.0, 420.0])
            .with_title("beatgrid - Step Sequencer"),
        ..Default::default()
    };

    eframe::run_native(
        "beatgrid",
        options,
        Box::new(|_cc| Ok(Box::new(SequencerApp::new()?))),
    )
}

#[cfg(not(feature = "gui"))]
fn main() {
    eprintln!("This binary requires the 'gui' feature to be enabled");
    std::process::exit(1);
}

#[cfg(feature = "gui")]
struct SequencerApp {
    store: Arc<PatternStore>,
    transport: Transport,
    events: crossbeam_channel::Receiver<PlaybackEvent>,
    _audio: Option<AudioOutput>,

    // UI state
    status: Option<String>,
}

#[cfg(feature = "gui")]
impl SequencerApp {
    fn new() -> beatgrid::Result<Self> {
        let config = EngineConfig::default();
        let store = Arc::new(PatternStore::new());

        let (audio, transport) = match AudioOutput::open(&config) {
            Ok(audio) => {
                let transport =
                    Transport::new(store.clone(), audio.voices(), Arc::new(audio.clock()), &config)?;
                (Some(audio), transport)
            }
            Err(err) => {
                log::warn!("no audio output ({}), running silent", err);
                let transport =
                    Transport::new(store.clone(), NullVoices, Arc::new(SystemClock::new()), &config)?;
                (None, transport)
            }
        };

        let status = audio
            .is_none()
            .then(|| "No audio output - playback is silent".to_string());
        let events = transport.subscribe();

        Ok(Self {
            store,
            transport,
            events,
            _audio: audio,
            status,
        })
    }

    fn handle_playback_events(&mut self) {
        for event in self.events.try_iter() {
            match event {
                PlaybackEvent::VoiceFailed { event, reason } => {
                    self.status = Some(format!(
                        "{} dropped at step {}: {}",
                        event.instrument.name(),
                        event.step + 1,
                        reason
                    ));
                }
                PlaybackEvent::Skipped { steps } => {
                    self.status = Some(format!("Playback fell behind, skipped {} steps", steps));
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "gui")]
impl eframe::App for SequencerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        ctx.request_repaint();

        self.handle_playback_events();

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading("beatgrid - Step Sequencer");
            ui.add_space(10.0);

            // Transport controls
            ui.horizontal(|ui| {
                let label = if self.transport.is_playing() {
                    "⏸ Stop"
                } else {
                    "▶ Play"
                };
                if ui.button(label).clicked() {
                    if let Err(err) = self.transport.toggle() {
                        self.status = Some(format!("Could not start playback: {}", err));
                    }
                }

                ui.add_space(20.0);

                ui.label("BPM:");
                let mut bpm = self.store.tempo().bpm();
                if ui
                    .add(egui::Slider::new(&mut bpm, MIN_BPM..=MAX_BPM).step_by(1.0))
                    .changed()
                {
                    if let Err(err) = self.store.set_tempo(bpm) {
                        self.status = Some(err.to_string());
                    }
                }

                ui.add_space(20.0);

                if ui.button("Clear Pattern").clicked() {
                    self.store.clear();
                }
            });

            ui.add_space(20.0);

            let pattern = self.store.pattern();
            let current_step = self.transport.current_step();

            for track in 0..TRACK_COUNT {
                ui.horizontal(|ui| {
                    let name = Instrument::for_track(track).map_or("", Instrument::name);
                    ui.add_sized([70.0, 24.0], egui::Label::new(name));

                    for step in 0..STEP_COUNT {
                        let is_current = current_step == Some(step);
                        let enabled = pattern.get(track, step);

                        let button = egui::Button::new("")
                            .min_size(egui::vec2(36.0, 24.0))
                            .fill(if enabled && is_current {
                                egui::Color32::from_rgb(140, 230, 140)
                            } else if enabled {
                                egui::Color32::from_rgb(139, 92, 246)
                            } else if is_current {
                                egui::Color32::from_rgb(70, 110, 70)
                            } else if step % 4 == 0 {
                                egui::Color32::from_rgb(55, 55, 55)
                            } else {
                                egui::Color32::from_rgb(40, 40, 40)
                            });

                        if ui.add(button).clicked() {
                            self.store.toggle_cell(track, step);
                        }
                    }
                });
            }

            // Info
            ui.separator();
            ui.label("Click steps to enable/disable them");
            if let Some(status) = &self.status {
                ui.colored_label(egui::Color32::YELLOW, format!("⚠ {}", status));
            }
        });
    }
}
