// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The generic pipeline lifecycle. A worker owns one pipeline, drives it
//! NULL → READY → PAUSED → PLAYING off the bus messages, and calls back
//! into its role (case, composite, recorder) at each transition.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex, Weak,
};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::events::Signal;
use crate::pipeline::{
    BuildError, BusMessage, BusPoster, ElementHandle, Engine, Pipeline, PipelineSpec,
    PipelineState,
};
use crate::sched::SchedHandle;

const EOS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullReturn {
    Replay,
    End,
}

/// The per-role hooks a worker delegates to.
pub trait PipelineLifecycle: Send + Sync {
    fn pipeline_spec(&self) -> PipelineSpec;

    /// Runs once after the pipeline is built, before any state change.
    /// Element callbacks and owned streams are installed here.
    fn prepare(&self, _worker: &Worker, _pipeline: &Pipeline) -> anyhow::Result<()> {
        Ok(())
    }

    /// The pipeline reached PLAYING.
    fn alive(&self, _worker: &Worker) {}

    /// The pipeline reached NULL; decides between ending and replaying.
    fn null(&self, worker: &Worker) -> NullReturn {
        if worker.auto_replay() {
            NullReturn::Replay
        } else {
            NullReturn::End
        }
    }

    /// Every bus message, after the worker's own handling.
    fn message(&self, _worker: &Worker, _message: &BusMessage) {}

    /// The worker stopped on EOS or error.
    fn close(&self, _worker: &Worker) {}

    /// The description referenced unknown elements; returning true retries
    /// the build once.
    fn missing(&self, _worker: &Worker, _elements: &[String]) -> bool {
        false
    }
}

#[derive(Default)]
pub struct WorkerEvents {
    pub prepare_worker: Signal,
    pub start_worker: Signal,
    pub end_worker: Signal,
    pub worker_null: Signal,
}

pub struct Worker {
    name: String,
    self_ref: Weak<Worker>,
    engine: Arc<Engine>,
    sched: SchedHandle,
    role: Mutex<Weak<dyn PipelineLifecycle>>,
    pipeline: Mutex<Option<Pipeline>>,
    shutdown_cond: Condvar,
    paused_for_buffering: AtomicBool,
    send_eos_on_stop: AtomicBool,
    auto_replay: AtomicBool,
    events: WorkerEvents,
}

impl Worker {
    pub fn new(
        name: &str,
        engine: Arc<Engine>,
        sched: SchedHandle,
        role: Weak<dyn PipelineLifecycle>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            name: name.to_owned(),
            self_ref: self_ref.clone(),
            engine,
            sched,
            role: Mutex::new(role),
            pipeline: Mutex::new(None),
            shutdown_cond: Condvar::new(),
            paused_for_buffering: AtomicBool::new(false),
            send_eos_on_stop: AtomicBool::new(false),
            auto_replay: AtomicBool::new(false),
            events: WorkerEvents::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &WorkerEvents {
        &self.events
    }

    pub fn sched(&self) -> &SchedHandle {
        &self.sched
    }

    pub fn set_send_eos_on_stop(&self, value: bool) {
        self.send_eos_on_stop.store(value, Ordering::SeqCst);
    }

    pub fn set_auto_replay(&self, value: bool) {
        self.auto_replay.store(value, Ordering::SeqCst);
    }

    pub fn auto_replay(&self) -> bool {
        self.auto_replay.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PipelineState {
        self.pipeline
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.state())
            .unwrap_or(PipelineState::Null)
    }

    pub fn has_pipeline(&self) -> bool {
        self.pipeline.lock().unwrap().is_some()
    }

    pub fn get_element(&self, name: &str) -> Option<ElementHandle> {
        self.pipeline
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|p| p.element(name))
    }

    fn role(&self) -> Option<Arc<dyn PipelineLifecycle>> {
        self.role.lock().unwrap().upgrade()
    }

    fn bus_poster(&self) -> BusPoster {
        let weak = self.self_ref.clone();
        Arc::new(move |msg| {
            if let Some(worker) = weak.upgrade() {
                let target = worker.clone();
                worker.sched.spawn(move || target.handle_message(msg));
            }
        })
    }

    /// Builds the pipeline from the role's current description. A build
    /// failing on unknown elements gets one retry if the role asks for it.
    fn create_pipeline(&self) -> Option<Pipeline> {
        let role = self.role()?;

        let mut retried = false;
        loop {
            let spec = role.pipeline_spec();
            match self
                .engine
                .clone()
                .build_pipeline(&self.name, spec, self.bus_poster())
            {
                Ok(pipeline) => {
                    info!(worker = %self.name, "{}", pipeline.launch_string());

                    let weak = self.self_ref.clone();
                    pipeline.set_sync_eos(Arc::new(move || {
                        // Wake anyone sleeping in a clean shutdown.
                        if let Some(worker) = weak.upgrade() {
                            worker.shutdown_cond.notify_all();
                        }
                    }));

                    return Some(pipeline);
                }
                Err(BuildError::MissingElements(names)) => {
                    for name in &names {
                        error!(worker = %self.name, "missing: {}", name);
                    }
                    if !retried && role.missing(self, &names) {
                        retried = true;
                        continue;
                    }
                    return None;
                }
                Err(e) => {
                    error!(worker = %self.name, "pipeline description error: {}", e);
                    return None;
                }
            }
        }
    }

    fn prepare(&self) -> bool {
        {
            let mut guard = self.pipeline.lock().unwrap();
            if guard.is_some() {
                return true;
            }

            let Some(pipeline) = self.create_pipeline() else {
                return false;
            };

            if let Some(role) = self.role() {
                if let Err(e) = role.prepare(self, &pipeline) {
                    error!(worker = %self.name, "failed to prepare: {:#}", e);
                    return false;
                }
            }

            *guard = Some(pipeline);
        }

        self.events.prepare_worker.emit(&());
        true
    }

    /// Brings the pipeline up. The rest of the climb to PLAYING is driven
    /// by the state-change messages.
    pub fn start(&self) -> bool {
        if !self.prepare() {
            return false;
        }

        let mut guard = self.pipeline.lock().unwrap();
        match guard.as_mut() {
            Some(pipeline) if pipeline.state() == PipelineState::Null => {
                pipeline.set_state(PipelineState::Ready).is_ok()
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Restarts a pipeline that ended up back at NULL.
    fn replay(&self) -> bool {
        let mut guard = self.pipeline.lock().unwrap();
        match guard.as_mut() {
            Some(pipeline) if pipeline.state() != PipelineState::Playing => {
                pipeline.set_state(PipelineState::Ready).is_ok()
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn stop(&self) -> bool {
        self.stop_force(false)
    }

    /// Stops the pipeline. When the role wants a clean shutdown (the
    /// recorder does, so its file gets finalized), an EOS is pushed through
    /// first and the call blocks until it drains, bounded by a timeout.
    pub fn stop_force(&self, force: bool) -> bool {
        let mut guard = self.pipeline.lock().unwrap();
        let Some(pipeline) = guard.as_mut() else {
            return false;
        };

        let state = pipeline.state();
        let no_eos =
            state == PipelineState::Playing && !self.send_eos_on_stop.load(Ordering::SeqCst);

        if force || no_eos || state != PipelineState::Playing {
            // The bus is flushed, so the downward transitions never reach
            // the handler; run the NULL hook off a short timer instead.
            pipeline.set_flushing(true);
            let ok = pipeline.set_state(PipelineState::Null).is_ok();

            let weak = self.self_ref.clone();
            self.sched.after(Duration::from_millis(5), move || {
                if let Some(worker) = weak.upgrade() {
                    worker.state_ready_to_null();
                }
            });

            ok
        } else {
            pipeline.send_eos();

            // The sync EOS hook wakes us; the async EOS message then stops
            // the worker for real.
            let (guard, result) = self
                .shutdown_cond
                .wait_timeout(guard, EOS_TIMEOUT)
                .unwrap();
            drop(guard);

            if result.timed_out() {
                warn!(worker = %self.name, "timed out waiting for EOS, forcing shutdown");
                return self.stop_force(true);
            }
            true
        }
    }

    /// Tears the pipeline down and rebuilds it from the role's current
    /// description.
    pub fn reset(&self) -> bool {
        {
            let mut guard = self.pipeline.lock().unwrap();
            if let Some(pipeline) = guard.as_mut() {
                pipeline.set_flushing(true);
                pipeline.set_state(PipelineState::Null).ok();
            }
            *guard = None;

            let Some(pipeline) = self.create_pipeline() else {
                return false;
            };
            if let Some(role) = self.role() {
                if let Err(e) = role.prepare(self, &pipeline) {
                    error!(worker = %self.name, "failed to prepare: {:#}", e);
                    return false;
                }
            }
            *guard = Some(pipeline);
        }

        self.events.prepare_worker.emit(&());
        true
    }

    fn handle_error(&self, element: &str, message: &str, detail: &str) {
        error!(worker = %self.name, element, "{} ({})", message, detail);
        self.stop();
        if let Some(role) = self.role() {
            role.close(self);
        }
    }

    pub(crate) fn handle_message(&self, msg: BusMessage) {
        match &msg {
            BusMessage::Eos => {
                debug!(worker = %self.name, "EOS");
                self.stop_force(true);
                if let Some(role) = self.role() {
                    role.close(self);
                }
            }
            BusMessage::Error {
                element,
                message,
                debug,
            } => self.handle_error(element, message, debug),
            BusMessage::Warning { element, message } => {
                // Some warnings are non-recoverable errors in disguise.
                if message.contains("error:") {
                    self.handle_error(element, message, "escalated warning");
                } else {
                    warn!(worker = %self.name, element, "{}", message);
                }
            }
            BusMessage::Info { element, message } => {
                info!(worker = %self.name, element, "{}", message);
            }
            BusMessage::Buffering { percent } => self.handle_buffering(*percent),
            BusMessage::StateChanged { old, new } => self.handle_state_changed(*old, *new),
        }

        if let Some(role) = self.role() {
            role.message(self, &msg);
        }
    }

    fn handle_buffering(&self, percent: i32) {
        let paused = self.paused_for_buffering.load(Ordering::SeqCst);
        let mut guard = self.pipeline.lock().unwrap();
        let Some(pipeline) = guard.as_mut() else {
            return;
        };

        if !paused && percent < 100 {
            debug!(worker = %self.name, percent, "pausing for buffering");
            self.paused_for_buffering.store(true, Ordering::SeqCst);
            pipeline.set_state(PipelineState::Paused).ok();
        } else if paused && percent == 100 {
            debug!(worker = %self.name, "buffering done");
            self.paused_for_buffering.store(false, Ordering::SeqCst);
            pipeline.set_state(PipelineState::Playing).ok();
        }
    }

    fn handle_state_changed(&self, old: PipelineState, new: PipelineState) {
        use PipelineState::*;
        match (old, new) {
            (Null, Ready) => {
                let mut guard = self.pipeline.lock().unwrap();
                if let Some(pipeline) = guard.as_mut() {
                    pipeline.set_state(Paused).ok();
                }
            }
            (Ready, Paused) => {
                if !self.paused_for_buffering.load(Ordering::SeqCst) {
                    let mut guard = self.pipeline.lock().unwrap();
                    if let Some(pipeline) = guard.as_mut() {
                        pipeline.set_state(Playing).ok();
                    }
                }
            }
            (Paused, Playing) => {
                if let Some(role) = self.role() {
                    role.alive(self);
                }
                self.events.start_worker.emit(&());
            }
            (Playing, Paused) | (Paused, Ready) => (),
            // Handled by the timer armed in stop_force; the bus is flushed
            // by then.
            (Ready, Null) => (),
            (old, new) => {
                warn!(worker = %self.name, %old, %new, "unexpected state change");
            }
        }
    }

    fn state_ready_to_null(&self) {
        let ret = self
            .role()
            .map(|role| role.null(self))
            .unwrap_or(NullReturn::End);

        if ret == NullReturn::Replay {
            self.replay();
        }

        self.events.worker_null.emit(&());

        if ret == NullReturn::End {
            self.events.end_worker.emit(&());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::parse_format;
    use crate::pipeline::{graph::Node, ElementRegistry};
    use crate::sched::Scheduler;
    use crate::surface::SurfaceRegistry;
    use crossbeam_channel::Sender;

    struct LoopRole {
        started: Sender<()>,
    }

    impl PipelineLifecycle for LoopRole {
        fn pipeline_spec(&self) -> PipelineSpec {
            let caps = parse_format("debug").unwrap();
            let mut b = PipelineSpec::builder();
            b.chain(vec![
                Node::new("surfacevideosrc")
                    .name("source")
                    .prop("channel", "worker_test_in"),
                Node::caps(caps),
                Node::new("surfacevideosink")
                    .name("sink")
                    .prop("channel", "worker_test_out"),
            ]);
            b.build()
        }

        fn alive(&self, _worker: &Worker) {
            self.started.send(()).ok();
        }
    }

    #[test]
    fn test_worker_reaches_playing_and_stops() {
        let sched = Scheduler::new();
        let surfaces = Arc::new(SurfaceRegistry::new());
        let engine = Engine::new(surfaces.clone());

        let (started_tx, started_rx) = crossbeam_channel::unbounded();
        let role = Arc::new(LoopRole {
            started: started_tx,
        });
        let role_dyn: Arc<dyn PipelineLifecycle> = role.clone();
        let weak: Weak<dyn PipelineLifecycle> = Arc::downgrade(&role_dyn);
        let worker = Worker::new("test", engine, sched.handle(), weak);

        assert!(worker.start());
        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("worker never reached PLAYING");
        assert_eq!(worker.state(), PipelineState::Playing);

        // The source synthesizes black frames, so the output surface fills
        // in even with no writer on the input channel.
        let out = surfaces.get("worker_test_out");
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while out.take_video().is_none() {
            assert!(std::time::Instant::now() < deadline, "no frames published");
            std::thread::sleep(Duration::from_millis(10));
        }

        let (null_tx, null_rx) = crossbeam_channel::unbounded();
        worker.events().end_worker.connect(move |_| {
            null_tx.send(()).ok();
        });

        assert!(worker.stop());
        null_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("worker never ended");
        assert_eq!(worker.state(), PipelineState::Null);

        drop(role);
    }

    #[test]
    fn test_clean_stop_waits_for_eos() {
        let sched = Scheduler::new();
        let surfaces = Arc::new(SurfaceRegistry::new());
        let engine = Engine::new(surfaces);

        let (started_tx, started_rx) = crossbeam_channel::unbounded();
        let role = Arc::new(LoopRole {
            started: started_tx,
        });
        let role_dyn: Arc<dyn PipelineLifecycle> = role.clone();
        let weak: Weak<dyn PipelineLifecycle> = Arc::downgrade(&role_dyn);
        let worker = Worker::new("clean", engine, sched.handle(), weak);
        worker.set_send_eos_on_stop(true);

        assert!(worker.start());
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // The stop blocks until EOS has drained through the sink, then the
        // async EOS handling takes the pipeline down.
        assert!(worker.stop());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while worker.state() != PipelineState::Null {
            assert!(std::time::Instant::now() < deadline, "never reached NULL");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    struct BrokenRole {
        asked: Sender<Vec<String>>,
    }

    impl PipelineLifecycle for BrokenRole {
        fn pipeline_spec(&self) -> PipelineSpec {
            let mut b = PipelineSpec::builder();
            b.chain(vec![
                Node::new("surfacevideosrc")
                    .name("source")
                    .prop("channel", "x"),
                Node::new("nosuchelement"),
            ]);
            b.build()
        }

        fn missing(&self, _worker: &Worker, elements: &[String]) -> bool {
            self.asked.send(elements.to_vec()).ok();
            false
        }
    }

    #[test]
    fn test_missing_elements_hook() {
        let sched = Scheduler::new();
        let surfaces = Arc::new(SurfaceRegistry::new());
        let engine = Engine::with_registry(surfaces, ElementRegistry::standard());

        let (asked_tx, asked_rx) = crossbeam_channel::unbounded();
        let role = Arc::new(BrokenRole { asked: asked_tx });
        let role_dyn: Arc<dyn PipelineLifecycle> = role.clone();
        let weak: Weak<dyn PipelineLifecycle> = Arc::downgrade(&role_dyn);
        let worker = Worker::new("broken", engine, sched.handle(), weak);

        assert!(!worker.start());
        assert_eq!(
            asked_rx.try_recv().unwrap(),
            vec!["nosuchelement".to_owned()]
        );
    }
}
