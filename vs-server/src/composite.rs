// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The mixing stage. The composite worker runs the mixer pipeline and owns
//! an auxiliary scaler worker; mode changes and PIP resizes tear the mixer
//! down and rebuild it, serialized by the transition and adjustment flags.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::ServerConfig;
use crate::events::Signal;
use crate::format::{Caps, CapsValue};
use crate::pipeline::{graph::Node, BusMessage, Engine, Pipeline, PipelineSpec};
use crate::sched::SchedHandle;
use crate::worker::{NullReturn, PipelineLifecycle, Worker};

const END_TRANSITION_DELAY: Duration = Duration::from_millis(200);
const RETRY_DELAY: Duration = Duration::from_millis(10);

pub const DEFAULT_COMPOSE_MODE: CompositeMode = CompositeMode::None;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeMode {
    None,
    Pip,
    DualPreview,
    DualEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

fn scaled(v: u32, factor: f64) -> u32 {
    (v as f64 * factor + 0.5) as u32
}

/// The A/B rectangles for a mode on a given canvas. B is clamped to the
/// canvas in the dual modes.
pub fn mode_geometry(mode: CompositeMode, width: u32, height: u32) -> (Rect, Rect) {
    match mode {
        CompositeMode::None => (Rect::new(0, 0, width, height), Rect::default()),
        CompositeMode::Pip => (
            Rect::new(0, 0, width, height),
            Rect::new(
                scaled(width, 0.08),
                scaled(height, 0.08),
                scaled(width, 0.3),
                scaled(height, 0.3),
            ),
        ),
        CompositeMode::DualPreview => {
            let a = Rect::new(0, 0, scaled(width, 0.7), scaled(height, 0.7));
            let bx = a.width + 1;
            let b = Rect::new(bx, a.y, width.saturating_sub(bx), height - a.height);
            (a, b)
        }
        CompositeMode::DualEqual => {
            let aw = scaled(width, 0.5);
            let ah = scaled(height, 0.5);
            let a = Rect::new(0, (height - ah) / 2, aw, ah);
            let bx = aw + 1;
            let b = Rect::new(bx, a.y, width.saturating_sub(bx), ah);
            (a, b)
        }
    }
}

/// Minimum PIP dimensions, enforced at the setters.
pub fn check_min_pip_width(default_width: u32, width: u32) -> u32 {
    width.max(default_width / 4)
}

pub fn check_min_pip_height(default_height: u32, height: u32) -> u32 {
    height.max(default_height / 3)
}

#[derive(Debug, Clone)]
pub struct CompositeState {
    pub mode: CompositeMode,
    pub width: u32,
    pub height: u32,
    pub a: Rect,
    pub b: Rect,
}

pub struct Composite {
    self_ref: Weak<Composite>,
    worker: Arc<Worker>,
    scaler: Arc<Worker>,
    // The scaler role only holds a weak backreference; keep it alive here.
    _scaler_role: Arc<ScalerRole>,
    cfg: Arc<ServerConfig>,
    state: Mutex<CompositeState>,
    transition: Mutex<bool>,
    adjusting: Mutex<bool>,
    deprecated: AtomicBool,
    pub end_transition: Signal,
}

struct ScalerRole {
    composite: Weak<Composite>,
}

impl PipelineLifecycle for ScalerRole {
    fn pipeline_spec(&self) -> PipelineSpec {
        match self.composite.upgrade() {
            Some(composite) => composite.scaler_spec(),
            None => PipelineSpec::builder().build(),
        }
    }
}

impl Composite {
    pub fn new(cfg: Arc<ServerConfig>, engine: Arc<Engine>, sched: SchedHandle) -> Arc<Self> {
        let composite = Arc::new_cyclic(|self_ref: &Weak<Composite>| {
            let scaler_role = Arc::new(ScalerRole {
                composite: self_ref.clone(),
            });
            let scaler_dyn: Arc<dyn PipelineLifecycle> = scaler_role.clone();
            let scaler_weak: Weak<dyn PipelineLifecycle> = Arc::downgrade(&scaler_dyn);
            let scaler = Worker::new("scale", engine.clone(), sched.clone(), scaler_weak);

            let role: Weak<dyn PipelineLifecycle> = self_ref.clone();
            let worker = Worker::new("composite", engine, sched, role);

            let (width, height) = (cfg.default_width(), cfg.default_height());
            let (a, b) = mode_geometry(DEFAULT_COMPOSE_MODE, width, height);

            Self {
                self_ref: self_ref.clone(),
                worker,
                scaler,
                _scaler_role: scaler_role,
                cfg,
                state: Mutex::new(CompositeState {
                    mode: DEFAULT_COMPOSE_MODE,
                    width,
                    height,
                    a,
                    b,
                }),
                // The first start is a transition out of no-mode.
                transition: Mutex::new(true),
                adjusting: Mutex::new(false),
                deprecated: AtomicBool::new(false),
                end_transition: Signal::new(),
            }
        });

        // The scaler follows the mixer's lifecycle.
        let weak = Arc::downgrade(&composite);
        composite.worker.events().end_worker.connect(move |_| {
            if let Some(composite) = weak.upgrade() {
                composite.scaler.stop();
            }
        });

        composite
    }

    pub fn start(&self) -> bool {
        self.worker.start()
    }

    /// Marks the composite terminal and stops it; the NULL hook then ends
    /// the worker instead of replaying it.
    pub fn shut_down(&self) {
        self.deprecated.store(true, Ordering::SeqCst);
        self.worker.stop();
        self.scaler.stop();
    }

    pub fn mode(&self) -> CompositeMode {
        self.state.lock().unwrap().mode
    }

    pub fn snapshot(&self) -> CompositeState {
        self.state.lock().unwrap().clone()
    }

    pub fn transition_pending(&self) -> bool {
        *self.transition.lock().unwrap()
    }

    /// Switches composition mode. Refused (returning false) while another
    /// transition is still settling.
    pub fn set_mode(&self, mode: CompositeMode) -> bool {
        if self.transition_pending() {
            warn!("ignore changing mode in transition");
            return false;
        }

        {
            let mut state = self.state.lock().unwrap();
            state.width = self.cfg.default_width();
            state.height = self.cfg.default_height();
            let (a, b) = mode_geometry(mode, state.width, state.height);
            state.mode = mode;
            state.a = a;
            state.b = b;
        }

        self.start_transition();
        true
    }

    fn start_transition(&self) {
        let mut transition = self.transition.lock().unwrap();
        if !*transition {
            // Stopping the mixer kicks off the rebuild; the NULL hook
            // applies the new parameters.
            *transition = self.worker.stop();
        }
    }

    /// Moves and/or resizes the PIP overlay. A pure move pokes the mixer
    /// pad live; a resize needs a pipeline rebuild.
    pub fn adjust_pip(&self, x: i32, y: i32, width: u32, height: u32) -> bool {
        let mut state = self.state.lock().unwrap();

        if *self.adjusting.lock().unwrap() {
            warn!("last PIP adjustment request is progressing");
            return false;
        }

        state.b.x = x.max(0) as u32;
        state.b.y = y.max(0) as u32;

        if state.b.width != width || state.b.height != height {
            state.b.width = width;
            state.b.height = height;
            *self.adjusting.lock().unwrap() = true;
            drop(state);

            self.worker.stop();
            return true;
        }

        let (bx, by) = (state.b.x, state.b.y);
        drop(state);

        match self.worker.get_element("mix") {
            Some(mix) if mix.kind() == "videomix" => {
                mix.set_pad_property("sink_1", "xpos", bx);
                mix.set_pad_property("sink_1", "ypos", by);
                true
            }
            // In mode NONE the mix element is an identity with no B pad.
            _ => false,
        }
    }

    /// Rebuilds the scaler and mixer pipelines from the current state.
    fn apply_parameters(&self) {
        if !self.worker.reset() {
            error!("failed to reset composite");
        }
    }

    fn with_self(
        &self,
        f: impl FnOnce(Arc<Composite>) + Send + 'static,
    ) -> impl FnOnce() + Send + 'static {
        let weak = self.self_ref.clone();
        move || {
            if let Some(composite) = weak.upgrade() {
                f(composite);
            }
        }
    }

    fn close_transition(&self) {
        let transition = self.transition.lock().unwrap();
        if *transition {
            // One-shot; the delay lets the new pipeline settle before the
            // UI is told the transition finished.
            self.worker.sched().after(
                END_TRANSITION_DELAY,
                self.with_self(|c| c.end_transition_timeout()),
            );
        }
    }

    fn end_transition_timeout(&self) {
        let mut transition = self.transition.lock().unwrap();
        if *transition {
            *transition = false;
            drop(transition);
            self.end_transition.emit(&());
        }
    }

    fn commit_transition(&self) {
        let transition = self.transition.lock().unwrap();
        if *transition {
            self.apply_parameters();
        }
    }

    fn commit_adjustment(&self) {
        let adjusting = self.adjusting.lock().unwrap();
        if *adjusting {
            if !self.worker.reset() {
                error!("failed to reset composite");
            }
            // The replay that raced the rebuild may have fizzled; make
            // sure the fresh pipeline comes up.
            self.worker.start();
        }
    }

    fn close_adjustment(&self) {
        *self.adjusting.lock().unwrap() = false;
    }

    fn retry_transition(&self) {
        let transition = self.transition.lock().unwrap();
        if *transition {
            let state = self.snapshot();
            warn!(
                "transition to mode {:?} ({}x{}) errored, retrying",
                state.mode, state.width, state.height
            );
            self.apply_parameters();
            self.worker.start();
        }
    }

    fn retry_adjustment(&self) {
        let adjusting = self.adjusting.lock().unwrap();
        if *adjusting {
            warn!("PIP adjustment errored, retrying");
            if !self.worker.reset() {
                error!("failed to reset composite");
            }
            self.worker.start();
        }
    }

    /// The mixer pipeline for the current mode.
    fn mixer_spec(&self) -> PipelineSpec {
        let state = self.snapshot();
        let recording = self.cfg.record_template.is_some();
        let mut b = PipelineSpec::builder();

        let mix = if state.mode == CompositeMode::None {
            b.chain(vec![
                Node::new("surfacevideosrc")
                    .name("source_a")
                    .prop("channel", "composite_a_scaled"),
                Node::caps(size_caps(state.a.width, state.a.height)),
                Node::new("queue"),
                Node::new("identity").name("mix"),
            ])
        } else {
            let src_a = b.add(
                Node::new("surfacevideosrc")
                    .name("source_a")
                    .prop("channel", "composite_a_scaled"),
            );
            let src_b = b.add(
                Node::new("surfacevideosrc")
                    .name("source_b")
                    .prop("channel", "composite_b_scaled"),
            );
            let mix = b.add(
                Node::new("videomix")
                    .name("mix")
                    .pad_prop("sink_0", "xpos", state.a.x)
                    .pad_prop("sink_0", "ypos", state.a.y)
                    .pad_prop("sink_0", "zorder", 0)
                    .pad_prop("sink_1", "xpos", state.b.x)
                    .pad_prop("sink_1", "ypos", state.b.y)
                    .pad_prop("sink_1", "zorder", 1),
            );

            let qb = b.chain_from(
                &src_b,
                vec![
                    Node::caps(size_caps(state.b.width, state.b.height)),
                    Node::new("queue"),
                ],
            );
            b.link_pads(&qb, "src", &mix, "sink_1");

            let qa = b.chain_from(
                &src_a,
                vec![
                    Node::caps(size_caps(state.a.width, state.a.height)),
                    Node::new("queue"),
                ],
            );
            b.link_pads(&qa, "src", &mix, "sink_0");

            mix
        };

        let result = b.chain_from(
            &mix,
            vec![
                Node::caps(size_caps(state.width, state.height)),
                Node::new("tee").name("result"),
            ],
        );

        b.chain_from(
            &result,
            vec![
                Node::new("queue"),
                Node::new("surfacevideosink")
                    .name("out")
                    .prop("channel", "composite_out"),
            ],
        );

        if recording {
            b.chain_from(
                &result,
                vec![
                    Node::new("queue"),
                    Node::new("surfacevideosink")
                        .name("record")
                        .prop("channel", "composite_video"),
                ],
            );
        }

        b.build()
    }

    /// The scaler sizes the A (and in two-source modes, B) feeds down to
    /// their rectangles before the mixer sees them.
    fn scaler_spec(&self) -> PipelineSpec {
        let state = self.snapshot();
        let mut b = PipelineSpec::builder();

        b.chain(vec![
            Node::new("surfacevideosrc")
                .name("source_a")
                .prop("channel", "composite_a"),
            Node::caps(size_caps(state.width, state.height)),
            Node::new("queue"),
            Node::new("videoscale"),
            Node::caps(size_caps(state.a.width, state.a.height)),
            Node::new("surfacevideosink")
                .name("sink_a")
                .prop("sync", false)
                .prop("channel", "composite_a_scaled"),
        ]);

        if state.mode != CompositeMode::None {
            b.chain(vec![
                Node::new("surfacevideosrc")
                    .name("source_b")
                    .prop("channel", "composite_b"),
                Node::caps(size_caps(state.width, state.height)),
                Node::new("queue"),
                Node::new("videoscale"),
                Node::caps(size_caps(state.b.width, state.b.height)),
                Node::new("surfacevideosink")
                    .name("sink_b")
                    .prop("sync", false)
                    .prop("channel", "composite_b_scaled"),
            ]);
        }

        b.build()
    }
}

fn size_caps(width: u32, height: u32) -> Caps {
    Caps::new("video/x-raw")
        .with("width", CapsValue::Int(width as i32))
        .with("height", CapsValue::Int(height as i32))
}

impl PipelineLifecycle for Composite {
    fn pipeline_spec(&self) -> PipelineSpec {
        self.mixer_spec()
    }

    fn prepare(&self, _worker: &Worker, _pipeline: &Pipeline) -> anyhow::Result<()> {
        // Bring the scaler along to the new geometry.
        if self.scaler.has_pipeline() && !self.scaler.reset() {
            error!("failed to reset scaler");
        }
        Ok(())
    }

    fn alive(&self, worker: &Worker) {
        // The mixer needs its scaled inputs.
        self.scaler.start();

        if self.transition_pending() {
            self.close_transition();
        } else if *self.adjusting.lock().unwrap() {
            worker
                .sched()
                .after(RETRY_DELAY, self.with_self(|c| c.close_adjustment()));
        }
    }

    fn null(&self, worker: &Worker) -> NullReturn {
        if self.transition_pending() {
            self.commit_transition();
        } else if *self.adjusting.lock().unwrap() {
            worker
                .sched()
                .after(RETRY_DELAY, self.with_self(|c| c.commit_adjustment()));
        }

        if self.deprecated.load(Ordering::SeqCst) {
            NullReturn::End
        } else {
            NullReturn::Replay
        }
    }

    fn message(&self, worker: &Worker, message: &BusMessage) {
        if let BusMessage::Error { .. } = message {
            if self.transition_pending() {
                worker
                    .sched()
                    .after(RETRY_DELAY, self.with_self(|c| c.retry_transition()));
            } else if *self.adjusting.lock().unwrap() {
                worker
                    .sched()
                    .after(RETRY_DELAY, self.with_self(|c| c.retry_adjustment()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwitchOpts;
    use crate::sched::Scheduler;
    use crate::surface::SurfaceRegistry;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_geometry_none() {
        let (a, b) = mode_geometry(CompositeMode::None, 1280, 720);
        assert_eq!(a, Rect::new(0, 0, 1280, 720));
        assert_eq!(b, Rect::new(0, 0, 0, 0));
    }

    #[test]
    fn test_geometry_pip() {
        let (a, b) = mode_geometry(CompositeMode::Pip, 1280, 720);
        assert_eq!(a, Rect::new(0, 0, 1280, 720));
        assert_eq!(b, Rect::new(102, 58, 384, 216));
    }

    #[test]
    fn test_geometry_dual_equal() {
        let (a, b) = mode_geometry(CompositeMode::DualEqual, 1280, 720);
        assert_eq!(a, Rect::new(0, 180, 640, 360));
        assert_eq!(b, Rect::new(641, 180, 639, 360));
    }

    #[test]
    fn test_geometry_stays_on_canvas() {
        for mode in [
            CompositeMode::None,
            CompositeMode::Pip,
            CompositeMode::DualPreview,
            CompositeMode::DualEqual,
        ] {
            let (a, b) = mode_geometry(mode, 1280, 720);
            assert!(a.x + a.width <= 1280);
            assert!(a.y + a.height <= 720);
            assert!(b.x + b.width <= 1280, "mode {:?}", mode);
            assert!(b.y + b.height <= 720, "mode {:?}", mode);

            // A and B only overlap in PIP.
            if mode != CompositeMode::Pip && b.width > 0 {
                assert!(b.x >= a.x + a.width || b.y >= a.y + a.height);
            }
        }
    }

    #[test]
    fn test_min_pip_clamping() {
        assert_eq!(check_min_pip_width(1280, 100), 320);
        assert_eq!(check_min_pip_width(1280, 600), 600);
        assert_eq!(check_min_pip_height(720, 10), 240);
        assert_eq!(check_min_pip_height(720, 300), 300);
    }

    fn harness() -> (Scheduler, Arc<Composite>) {
        let sched = Scheduler::new();
        let cfg =
            ServerConfig::from_opts(&SwitchOpts::parse_from(["vsserver", "--low-res"])).unwrap();
        let surfaces = Arc::new(SurfaceRegistry::new());
        let engine = Engine::new(surfaces);
        let composite = Composite::new(cfg, engine, sched.handle());
        (sched, composite)
    }

    #[test]
    fn test_transitions_are_serialized() {
        let (_sched, composite) = harness();

        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        composite.end_transition.connect(move |_| {
            done_tx.send(()).ok();
        });

        // Construction leaves the initial transition pending, so a mode
        // change is refused until the first start settles.
        assert!(composite.transition_pending());
        assert!(!composite.set_mode(CompositeMode::Pip));

        assert!(composite.start());
        done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("initial transition never finished");
        assert!(!composite.transition_pending());

        assert!(composite.set_mode(CompositeMode::Pip));
        // A second change while the first is in flight is dropped.
        assert!(!composite.set_mode(CompositeMode::DualEqual));
        assert_eq!(composite.mode(), CompositeMode::Pip);

        done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("mode transition never finished");
        assert!(!composite.transition_pending());
        assert_eq!(composite.mode(), CompositeMode::Pip);

        let state = composite.snapshot();
        assert_eq!(state.b, Rect::new(24, 16, 90, 60));

        composite.shut_down();
    }

    #[test]
    fn test_pip_resize_sets_adjusting() {
        let (_sched, composite) = harness();

        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        composite.end_transition.connect(move |_| {
            done_tx.send(()).ok();
        });

        assert!(composite.start());
        done_rx.recv_timeout(Duration::from_secs(10)).unwrap();

        assert!(composite.set_mode(CompositeMode::Pip));
        done_rx.recv_timeout(Duration::from_secs(10)).unwrap();

        // Resizing B forces a rebuild.
        assert!(composite.adjust_pip(30, 20, 100, 70));
        let state = composite.snapshot();
        assert_eq!(state.b, Rect::new(30, 20, 100, 70));

        // Wait for the adjustment to settle, then a pure move succeeds
        // live.
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while *composite.adjusting.lock().unwrap() {
            assert!(std::time::Instant::now() < deadline, "adjustment stuck");
            std::thread::sleep(Duration::from_millis(20));
        }

        composite.shut_down();
    }
}
