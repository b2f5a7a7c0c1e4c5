//! The Display: an eframe app that steps the simulation once per frame and
//! plots every class's particles in its own color.

use std::time::{Duration, Instant};

/// The `egui` re-export for building native GUIs with the eframe framework.
use eframe::egui::{self, Color32, Pos2};
/// Additional 2D geometric tools from eframe, e.g. `Vec2`.
use eframe::epaint::Vec2;
/// The `egui_plot` crate for plotting data in an egui-based app.
use egui_plot::{Line, Plot, PlotPoints};

/// For multi-core projection of positions into screen space.
use rayon::prelude::*;

use crate::config::{SimulationParams, SubmissionOrder};
use crate::step::SimulationStep;

// ===================================================================================
// Display Constants
// ===================================================================================

/// One color per class, cycled when there are more classes than colors.
const PALETTE: [Color32; 7] = [
    Color32::from_rgb(251, 73, 52),   // red
    Color32::from_rgb(131, 165, 152), // blue
    Color32::from_rgb(184, 187, 38),  // green
    Color32::from_rgb(250, 189, 47),  // yellow
    Color32::from_rgb(211, 134, 155), // purple
    Color32::from_rgb(142, 192, 124), // aqua
    Color32::from_rgb(254, 128, 25),  // orange
];

const DEFAULT_ROLLING_FRAMES: usize = 300;
const LABEL_REFRESH: Duration = Duration::from_millis(500);
const POINT_RADIUS: f32 = 1.0;

pub fn class_color(class: usize) -> Color32 {
    PALETTE[class % PALETTE.len()]
}

// ===================================================================================
// Frame Timing
// ===================================================================================

/// Ring buffer of recent generation times, in milliseconds.
struct FrameTimes {
    ring: Vec<f32>,
    index: usize,
    stored: usize,
}

impl FrameTimes {
    fn new(capacity: usize) -> Self {
        Self {
            ring: vec![0.0; capacity],
            index: 0,
            stored: 0,
        }
    }

    fn push(&mut self, ms: f32) {
        self.ring[self.index] = ms;
        self.index = (self.index + 1) % self.ring.len();
        if self.stored < self.ring.len() {
            self.stored += 1;
        }
    }

    /// Oldest first, as `[frame, ms]` plot points.
    fn points(&self) -> Vec<[f64; 2]> {
        let start = if self.stored < self.ring.len() { 0 } else { self.index };
        (0..self.stored)
            .map(|i| {
                let ms = self.ring[(start + i) % self.ring.len()];
                [i as f64, ms as f64]
            })
            .collect()
    }

    fn average(&self) -> Option<f32> {
        if self.stored == 0 {
            return None;
        }
        let sum: f32 = if self.stored < self.ring.len() {
            self.ring[..self.stored].iter().sum()
        } else {
            self.ring.iter().sum()
        };
        Some(sum / self.stored as f32)
    }

    fn clear(&mut self) {
        self.ring.fill(0.0);
        self.index = 0;
        self.stored = 0;
    }
}

/// "  12ms    83fps", the way the timing overlay shows a frame.
fn timing_text(elapsed: Duration) -> String {
    let ms = elapsed.as_millis();
    let fps = if ms > 0 { 1000 / ms } else { 0 };
    format!("{ms:4}ms {fps:5}fps")
}

// ===================================================================================
// Main Application
// ===================================================================================

/// The application state:
/// - A configuration panel used to set up parameters while stopped
/// - The "running" flag indicating if generations are being stepped
/// - The simulation itself, rebuilt from the parameters on reset
/// - Rolling frame timing for the overlay and the plot
pub struct ParticleApp {
    // -------------- Config / UI --------------
    params: SimulationParams,
    host_threads: bool,
    threads: usize,
    fixed_seed: bool,
    seed: u64,
    running: bool,
    needs_reset: bool,

    // -------------- Simulation --------------
    step: Option<SimulationStep>,
    last_error: Option<String>,

    // -------------- Timing --------------
    frame_times: FrameTimes,
    timing_label: String,
    label_updated: Option<Instant>,
}

impl ParticleApp {
    /// Starts stopped; the world is built on the first frame.
    pub fn new(params: SimulationParams) -> Self {
        Self {
            host_threads: params.worker_threads.is_none(),
            threads: params.resolved_worker_threads(),
            fixed_seed: params.seed.is_some(),
            seed: params.seed.unwrap_or_default(),
            params,
            running: false,
            needs_reset: true,
            step: None,
            last_error: None,
            frame_times: FrameTimes::new(DEFAULT_ROLLING_FRAMES),
            timing_label: timing_text(Duration::ZERO),
            label_updated: None,
        }
    }

    /// Rebuilds world, matrix and pool from the current parameters. The old
    /// pool finishes and shuts down when its step is dropped.
    fn reset_simulation(&mut self) {
        self.params.worker_threads = (!self.host_threads).then_some(self.threads);
        self.params.seed = self.fixed_seed.then_some(self.seed);

        self.step = None;
        match SimulationStep::new(&self.params) {
            Ok(step) => {
                self.step = Some(step);
                self.last_error = None;
            }
            Err(err) => {
                log::error!("could not build simulation: {err}");
                self.last_error = Some(err.to_string());
                self.running = false;
            }
        }
        self.frame_times.clear();
        self.needs_reset = false;
    }

    /// Builds the first world. Later parameter edits only take effect on
    /// Start or Reset, so dragging a slider never respawns the pool.
    fn build_if_missing(&mut self) {
        if self.step.is_none() && self.last_error.is_none() {
            self.reset_simulation();
        }
    }

    fn start(&mut self) {
        if self.needs_reset {
            self.reset_simulation();
        }
        self.running = self.step.is_some();
    }

    fn step_once(&mut self) {
        let Some(step) = self.step.as_mut() else {
            return;
        };
        match step.run_generation() {
            Ok(report) => {
                self.frame_times.push(report.elapsed.as_secs_f32() * 1000.0);
                let now = Instant::now();
                if self.label_updated.is_none_or(|at| now - at > LABEL_REFRESH) {
                    self.timing_label = timing_text(report.elapsed);
                    self.label_updated = Some(now);
                }
            }
            Err(err) => {
                log::error!("{err}");
                self.last_error = Some(err.to_string());
            }
        }
    }

    fn controls(&mut self, ui: &mut egui::Ui) {
        ui.heading("Simulation Controls");

        // Sliders: only matter if we haven't started or we want to reset
        if !self.running {
            let before = (self.params.clone(), self.host_threads, self.threads, self.fixed_seed, self.seed);

            ui.add(egui::Slider::new(&mut self.params.num_classes, 1..=12).text("Classes"));
            ui.add(egui::Slider::new(&mut self.params.particles_per_class, 1..=5000).text("Particles per Class"));
            ui.add(egui::Slider::new(&mut self.params.width, 320.0..=3840.0).text("World Width"));
            ui.add(egui::Slider::new(&mut self.params.height, 240.0..=2160.0).text("World Height"));
            ui.add(egui::Slider::new(&mut self.params.cutoff_radius, 1.0..=400.0).text("Cutoff Radius"));
            ui.add(egui::Slider::new(&mut self.params.damping, 0.0..=1.0).text("Damping"));
            ui.add(egui::Slider::new(&mut self.params.coefficient_mean, -60.0..=60.0).text("Coefficient Mean"));
            ui.add(egui::Slider::new(&mut self.params.coefficient_std_dev, 0.0..=60.0).text("Coefficient Std Dev"));

            ui.checkbox(&mut self.host_threads, "Host parallelism");
            if !self.host_threads {
                ui.add(egui::Slider::new(&mut self.threads, 1..=64).text("Worker Threads"));
            }

            ui.horizontal(|ui| {
                ui.checkbox(&mut self.fixed_seed, "Seed");
                ui.add_enabled(self.fixed_seed, egui::DragValue::new(&mut self.seed));
            });

            ui.horizontal(|ui| {
                ui.radio_value(&mut self.params.submission_order, SubmissionOrder::Canonical, "Canonical");
                ui.radio_value(&mut self.params.submission_order, SubmissionOrder::Shuffled, "Shuffled");
            });

            let after = (self.params.clone(), self.host_threads, self.threads, self.fixed_seed, self.seed);
            if before != after {
                self.needs_reset = true;
            }
        } else {
            ui.label("Parameters locked while running. Stop to change.");
        }

        ui.separator();

        // Start / Stop
        if self.running {
            if ui.button("Stop").clicked() {
                self.running = false;
            }
        } else if ui.button("Start").clicked() {
            self.start();
        }

        // Reset
        if ui.button("Reset").clicked() {
            self.reset_simulation();
            self.running = false;
        }

        if let Some(err) = &self.last_error {
            ui.separator();
            ui.colored_label(Color32::LIGHT_RED, err.as_str());
        }
    }
}

impl eframe::App for ParticleApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        egui::SidePanel::left("config_panel").show(ctx, |ui| self.controls(ui));

        self.build_if_missing();

        if self.running {
            self.step_once();
        }

        egui::TopBottomPanel::top("top_panel").show(ctx, |ui| {
            ui.heading("Particle Life");
            if let Some(step) = &self.step {
                let field = step.state().field();
                ui.label(format!(
                    "{} classes x {} particles, {} workers, generation {}",
                    field.num_classes(),
                    field.particles_per_class(),
                    step.num_workers(),
                    step.generation()
                ));
            }
            ui.monospace(self.timing_label.as_str());
        });

        egui::SidePanel::right("right_panel")
            .resizable(true)
            .show(ctx, |ui| {
                ui.label("Generation time (ms)");
                if let Some(avg) = self.frame_times.average() {
                    ui.label(format!("rolling average: {avg:.2}ms"));
                }
                let plot = Plot::new("frame_times")
                    .width(200.0)
                    .height(400.0)
                    .allow_scroll(true)
                    .allow_drag(true);

                plot.show(ui, |plot_ui| {
                    let points = self.frame_times.points();
                    if !points.is_empty() {
                        plot_ui.line(Line::new(PlotPoints::from(points)));
                    }
                });
            });

        egui::CentralPanel::default()
            .frame(egui::Frame::none().fill(Color32::BLACK))
            .show(ctx, |ui| {
                let Some(step) = &self.step else {
                    return;
                };
                let painter = ui.painter();
                let rect = ui.max_rect();
                let physics = step.state().physics();

                // Scale from the world to the drawing area:
                let scale = (rect.width() / physics.width).min(rect.height() / physics.height);

                // Generations only run inside `step_once`, so the barrier has
                // passed and every class lock is free.
                let field = step.state().field();
                let layers: Vec<(Color32, Vec<Pos2>)> = (0..field.num_classes())
                    .into_par_iter()
                    .filter_map(|class| {
                        let points = field
                            .with_class(class, |buffer| {
                                buffer
                                    .positions()
                                    .map(|(x, y)| rect.min + Vec2::new(x * scale, y * scale))
                                    .collect::<Vec<_>>()
                            })
                            .ok()?;
                        Some((class_color(class), points))
                    })
                    .collect();

                for (color, points) in layers {
                    for pos in points {
                        painter.circle_filled(pos, POINT_RADIUS, color);
                    }
                }
            });

        // Request another frame to keep animating (or remain static if stopped).
        ctx.request_repaint();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_app() -> ParticleApp {
        ParticleApp::new(SimulationParams {
            num_classes: 2,
            particles_per_class: 5,
            width: 200.0,
            height: 100.0,
            worker_threads: Some(1),
            seed: Some(5),
            ..Default::default()
        })
    }

    fn built(app: &ParticleApp) -> (usize, u64) {
        let step = app.step.as_ref().expect("world was not built");
        (step.state().num_classes(), step.generation())
    }

    #[test]
    fn parameter_edits_wait_for_start() {
        let mut app = small_app();
        app.build_if_missing();
        app.step_once();
        assert_eq!(built(&app), (2, 1));

        // A slider change on a later frame leaves the running world alone.
        app.params.num_classes = 3;
        app.needs_reset = true;
        app.build_if_missing();
        assert_eq!(built(&app), (2, 1));

        app.start();
        assert!(app.running);
        assert!(!app.needs_reset);
        assert_eq!(built(&app), (3, 0));
    }

    #[test]
    fn start_without_edits_keeps_the_current_world() {
        let mut app = small_app();
        app.build_if_missing();
        app.step_once();
        app.start();
        assert!(app.running);
        assert_eq!(built(&app), (2, 1));
    }

    #[test]
    fn palette_cycles_past_seven_classes() {
        assert_eq!(class_color(0), class_color(7));
        assert_ne!(class_color(0), class_color(1));
    }

    #[test]
    fn timing_text_matches_overlay_format() {
        assert_eq!(timing_text(Duration::from_millis(20)), "  20ms    50fps");
        assert_eq!(timing_text(Duration::ZERO), "   0ms     0fps");
    }

    #[test]
    fn frame_times_keep_the_most_recent_window() {
        let mut times = FrameTimes::new(3);
        assert_eq!(times.average(), None);
        for ms in [1.0, 2.0, 3.0, 4.0] {
            times.push(ms);
        }
        let values: Vec<f64> = times.points().iter().map(|p| p[1]).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
        assert_eq!(times.average(), Some(3.0));

        times.clear();
        assert!(times.points().is_empty());
    }
}
