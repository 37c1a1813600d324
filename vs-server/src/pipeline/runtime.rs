// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The pipeline runtime. A built pipeline owns one thread per element, with
//! bounded channels along the graph's links. State changes walk one edge at
//! a time and post a message for each, which is what drives the worker
//! state machine.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Condvar, Mutex,
};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use hashbrown::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::format::Caps;
use crate::pipeline::{
    bus::{Bus, BusMessage, BusPoster, PipelineState},
    elements,
    graph::{Node, PipelineSpec, PropValue},
    Buffer,
};
use crate::surface::SurfaceRegistry;

const CHANNEL_DEPTH: usize = 8;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Data flowing between elements.
#[derive(Debug, Clone)]
pub enum Item {
    Caps(Caps),
    Buffer(Buffer),
    Eos,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("missing elements: {0:?}")]
    MissingElements(Vec<String>),
    #[error("duplicate element name: {0}")]
    DuplicateName(String),
    #[error("bad link: {0}")]
    BadLink(String),
}

#[derive(Debug, Error)]
pub enum ElementError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Error)]
#[error("state change to {target} failed: {message}")]
pub struct StateChangeError {
    pub target: PipelineState,
    pub message: String,
}

/// Per-element shared slot: properties (plain and per-pad), the installed
/// input stream, and callbacks. Survives pipeline rebuilds, and property
/// updates are visible to a running element.
pub struct ElementShared {
    pub name: String,
    pub kind: String,
    props: Mutex<HashMap<String, PropValue>>,
    pad_props: Mutex<HashMap<(String, String), PropValue>>,
    stream: Mutex<Option<std::net::TcpStream>>,
    client_removed: Mutex<Option<Arc<dyn Fn(SocketAddr) + Send + Sync + 'static>>>,
}

impl ElementShared {
    fn from_node(node: &Node) -> Arc<Self> {
        let shared = Self {
            name: node.name.clone().unwrap_or_else(|| node.kind.clone()),
            kind: node.kind.clone(),
            props: Mutex::new(node.props.iter().cloned().collect()),
            pad_props: Mutex::new(
                node.pad_props
                    .iter()
                    .map(|(pad, key, value)| ((pad.clone(), key.clone()), value.clone()))
                    .collect(),
            ),
            stream: Mutex::new(None),
            client_removed: Mutex::new(None),
        };
        Arc::new(shared)
    }

    pub fn prop_i64(&self, key: &str) -> Option<i64> {
        self.props.lock().unwrap().get(key).and_then(|v| v.as_i64())
    }

    pub fn prop_str(&self, key: &str) -> Option<String> {
        self.props
            .lock()
            .unwrap()
            .get(key)
            .and_then(|v| v.as_str().map(str::to_owned))
    }

    pub fn prop_caps(&self, key: &str) -> Option<Caps> {
        self.props
            .lock()
            .unwrap()
            .get(key)
            .and_then(|v| v.as_caps().cloned())
    }

    pub fn pad_prop_i64(&self, pad: &str, key: &str) -> Option<i64> {
        self.pad_props
            .lock()
            .unwrap()
            .get(&(pad.to_owned(), key.to_owned()))
            .and_then(|v| v.as_i64())
    }

    pub fn take_stream(&self) -> Option<std::net::TcpStream> {
        self.stream.lock().unwrap().take()
    }

    pub fn client_removed_hook(&self) -> Option<Arc<dyn Fn(SocketAddr) + Send + Sync + 'static>> {
        self.client_removed.lock().unwrap().clone()
    }
}

/// A handle on a pipeline element, for property updates and callbacks.
#[derive(Clone)]
pub struct ElementHandle(pub(crate) Arc<ElementShared>);

impl ElementHandle {
    pub fn kind(&self) -> &str {
        &self.0.kind
    }

    pub fn set_property(&self, key: &str, value: impl Into<PropValue>) {
        self.0
            .props
            .lock()
            .unwrap()
            .insert(key.to_owned(), value.into());
    }

    pub fn set_pad_property(&self, pad: &str, key: &str, value: impl Into<PropValue>) {
        self.0
            .pad_props
            .lock()
            .unwrap()
            .insert((pad.to_owned(), key.to_owned()), value.into());
    }

    /// Installs the byte stream a `streamsrc` reads from. Must happen
    /// before the pipeline leaves NULL.
    pub fn install_stream(&self, stream: std::net::TcpStream) {
        *self.0.stream.lock().unwrap() = Some(stream);
    }

    pub fn on_client_removed(&self, f: impl Fn(SocketAddr) + Send + Sync + 'static) {
        *self.0.client_removed.lock().unwrap() = Some(Arc::new(f));
    }
}

pub struct BuildCtx {
    pub surfaces: Arc<SurfaceRegistry>,
    /// Caps of the immediately downstream capsfilter, if any. Stands in
    /// for full negotiation: scalers and mixers take their output geometry
    /// from it.
    pub caps_hint: Option<Caps>,
}

pub trait Element: Send {
    /// Resource allocation, on the state manager's thread (NULL → READY).
    fn prepare(&mut self) -> Result<(), ElementError> {
        Ok(())
    }

    /// The element's streaming loop, on its own thread.
    fn run(&mut self, ctx: &mut RunCtx) -> Result<(), ElementError>;

    /// Resource teardown; runs even when `run` errored.
    fn release(&mut self) {}
}

pub type ElementFactory = fn(Arc<ElementShared>, &BuildCtx) -> Box<dyn Element>;

pub struct ElementRegistry {
    factories: HashMap<String, ElementFactory>,
}

impl ElementRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn standard() -> Self {
        let mut registry = Self::empty();
        elements::register_standard(&mut registry);
        registry
    }

    pub fn register(&mut self, kind: &str, factory: ElementFactory) {
        self.factories.insert(kind.to_owned(), factory);
    }

    fn get(&self, kind: &str) -> Option<&ElementFactory> {
        self.factories.get(kind)
    }
}

pub struct Engine {
    surfaces: Arc<SurfaceRegistry>,
    registry: ElementRegistry,
}

impl Engine {
    pub fn new(surfaces: Arc<SurfaceRegistry>) -> Arc<Self> {
        Self::with_registry(surfaces, ElementRegistry::standard())
    }

    pub fn with_registry(surfaces: Arc<SurfaceRegistry>, registry: ElementRegistry) -> Arc<Self> {
        Arc::new(Self { surfaces, registry })
    }

    /// Validates the description and builds a pipeline in the NULL state.
    /// Unknown element kinds are all reported at once.
    pub fn build_pipeline(
        self: Arc<Self>,
        name: &str,
        mut spec: PipelineSpec,
        poster: BusPoster,
    ) -> Result<Pipeline, BuildError> {
        for (n, node) in spec.nodes.iter_mut().enumerate() {
            if node.name.is_none() {
                node.name = Some(format!("{}{}", node.kind, n));
            }
        }

        let missing: Vec<String> = spec
            .nodes
            .iter()
            .filter(|n| self.registry.get(&n.kind).is_none())
            .map(|n| n.kind.clone())
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::MissingElements(missing));
        }

        let mut names = HashSet::new();
        for node in &spec.nodes {
            if !names.insert(node.name.clone().unwrap()) {
                return Err(BuildError::DuplicateName(node.name.clone().unwrap()));
            }
        }

        let mut claimed_pads = HashSet::new();
        for link in &spec.links {
            if !names.contains(&link.from) {
                return Err(BuildError::BadLink(format!("unknown element {}", link.from)));
            }
            if !names.contains(&link.to) {
                return Err(BuildError::BadLink(format!("unknown element {}", link.to)));
            }
            if !claimed_pads.insert((link.to.clone(), link.to_pad.clone())) {
                return Err(BuildError::BadLink(format!(
                    "pad {}.{} linked twice",
                    link.to, link.to_pad
                )));
            }
        }

        let handles: HashMap<String, Arc<ElementShared>> = spec
            .nodes
            .iter()
            .map(|n| (n.name.clone().unwrap(), ElementShared::from_node(n)))
            .collect();

        let shared = Arc::new(PipelineShared {
            name: name.to_owned(),
            state: Mutex::new(PipelineState::Null),
            state_cond: Condvar::new(),
            stopping: AtomicBool::new(false),
            eos_requested: AtomicBool::new(false),
            bus: Bus::new(poster),
            sink_count: AtomicUsize::new(0),
            sinks_done: AtomicUsize::new(0),
        });

        Ok(Pipeline {
            name: name.to_owned(),
            spec,
            engine: self.clone(),
            shared,
            handles,
            prepared: Vec::new(),
            threads: Vec::new(),
        })
    }
}

struct PipelineShared {
    name: String,
    state: Mutex<PipelineState>,
    state_cond: Condvar,
    stopping: AtomicBool,
    eos_requested: AtomicBool,
    bus: Bus,
    sink_count: AtomicUsize,
    sinks_done: AtomicUsize,
}

pub struct Pipeline {
    name: String,
    spec: PipelineSpec,
    engine: Arc<Engine>,
    shared: Arc<PipelineShared>,
    handles: HashMap<String, Arc<ElementShared>>,
    prepared: Vec<(String, Box<dyn Element>)>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl Pipeline {
    pub fn state(&self) -> PipelineState {
        *self.shared.state.lock().unwrap()
    }

    pub fn element(&self, name: &str) -> Option<ElementHandle> {
        self.handles.get(name).cloned().map(ElementHandle)
    }

    pub fn launch_string(&self) -> String {
        self.spec.to_launch_string()
    }

    pub fn set_flushing(&self, flushing: bool) {
        self.shared.bus.set_flushing(flushing);
    }

    pub fn set_sync_eos(&self, hook: Arc<dyn Fn() + Send + Sync + 'static>) {
        self.shared.bus.set_sync_eos(hook);
    }

    /// Asks the sources to finish up; the bus reports EOS once every sink
    /// has drained.
    pub fn send_eos(&self) {
        self.shared.eos_requested.store(true, Ordering::SeqCst);
        self.shared.state_cond.notify_all();
    }

    /// Walks the state machine one edge at a time towards `target`,
    /// posting a message for every edge traversed.
    pub fn set_state(&mut self, target: PipelineState) -> Result<(), StateChangeError> {
        loop {
            let current = self.state();
            if current == target {
                return Ok(());
            }

            let next = if target > current {
                match current {
                    PipelineState::Null => PipelineState::Ready,
                    PipelineState::Ready => PipelineState::Paused,
                    _ => PipelineState::Playing,
                }
            } else {
                match current {
                    PipelineState::Playing => PipelineState::Paused,
                    PipelineState::Paused => PipelineState::Ready,
                    _ => PipelineState::Null,
                }
            };

            self.step(current, next).map_err(|e| StateChangeError {
                target: next,
                message: e.to_string(),
            })?;

            *self.shared.state.lock().unwrap() = next;
            self.shared.state_cond.notify_all();
            self.shared.bus.post(BusMessage::StateChanged {
                old: current,
                new: next,
            });

            trace!(pipeline = %self.name, %current, %next, "state changed");
        }
    }

    fn step(&mut self, from: PipelineState, to: PipelineState) -> Result<(), ElementError> {
        use PipelineState::*;
        match (from, to) {
            (Null, Ready) => {
                self.instantiate()?;
                self.shared.bus.set_flushing(false);
            }
            (Ready, Paused) => {
                if self.prepared.is_empty() {
                    self.instantiate()?;
                }
                self.spawn_threads();
            }
            (Paused, Playing) | (Playing, Paused) => (),
            (Paused, Ready) => self.join_threads(),
            (Ready, Null) => {
                // Elements that never ran still need their teardown.
                for (_, mut element) in self.prepared.drain(..) {
                    element.release();
                }
            }
            _ => unreachable!("invalid state edge"),
        }
        Ok(())
    }

    fn instantiate(&mut self) -> Result<(), ElementError> {
        debug!(pipeline = %self.name, "building: {}", self.spec.to_launch_string());

        let mut prepared: Vec<(String, Box<dyn Element>)> = Vec::new();
        for node in &self.spec.nodes {
            let name = node.name.clone().unwrap();
            let factory = self
                .engine
                .registry
                .get(&node.kind)
                .expect("validated at build time");

            let ctx = BuildCtx {
                surfaces: self.engine.surfaces.clone(),
                caps_hint: self.caps_hint_for(&name),
            };

            let mut element = factory(self.handles[&name].clone(), &ctx);
            if let Err(e) = element.prepare() {
                warn!(pipeline = %self.name, element = %name, "failed to prepare: {}", e);
                for (_, mut el) in prepared.drain(..) {
                    el.release();
                }
                element.release();
                return Err(ElementError::Failed(format!("{}: {}", name, e)));
            }

            prepared.push((name, element));
        }

        self.prepared = prepared;
        Ok(())
    }

    /// The caps of the capsfilter immediately downstream of `name`, if any.
    fn caps_hint_for(&self, name: &str) -> Option<Caps> {
        let link = self.spec.links.iter().find(|l| l.from == name)?;
        let node = self.spec.node(&link.to)?;
        if node.kind != "capsfilter" {
            return None;
        }
        node.props
            .iter()
            .find(|(k, _)| k == "caps")
            .and_then(|(_, v)| v.as_caps().cloned())
    }

    fn spawn_threads(&mut self) {
        self.shared.stopping.store(false, Ordering::SeqCst);
        self.shared.eos_requested.store(false, Ordering::SeqCst);
        self.shared.sinks_done.store(0, Ordering::SeqCst);

        // One channel per link.
        let mut senders: HashMap<String, Vec<(String, Sender<Item>)>> = HashMap::new();
        let mut receivers: HashMap<String, Vec<(String, Receiver<Item>)>> = HashMap::new();
        for link in &self.spec.links {
            let (tx, rx) = crossbeam_channel::bounded(CHANNEL_DEPTH);
            senders
                .entry(link.from.clone())
                .or_default()
                .push((link.from_pad.clone(), tx));
            receivers
                .entry(link.to.clone())
                .or_default()
                .push((link.to_pad.clone(), rx));
        }

        let sink_count = self
            .prepared
            .iter()
            .filter(|(name, _)| !senders.contains_key(name))
            .count();
        self.shared.sink_count.store(sink_count, Ordering::SeqCst);

        for (name, mut element) in self.prepared.drain(..) {
            let mut inputs = receivers.remove(&name).unwrap_or_default();
            let outputs = senders.remove(&name).unwrap_or_default();
            inputs.sort_by(|a, b| a.0.cmp(&b.0));

            let (input_pads, inputs): (Vec<_>, Vec<_>) = inputs.into_iter().unzip();
            let (output_pads, outputs): (Vec<_>, Vec<_>) = outputs.into_iter().unzip();

            let shared = self.shared.clone();
            let thread_name = format!("{}:{}", self.name, name);
            let handle = std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    let mut ctx = RunCtx {
                        element: name.clone(),
                        shared: shared.clone(),
                        inputs,
                        input_pads,
                        outputs,
                        output_pads,
                    };

                    let result = element.run(&mut ctx);
                    element.release();

                    if let Err(e) = result {
                        if !shared.stopping.load(Ordering::SeqCst) {
                            shared.bus.post(BusMessage::Error {
                                element: name,
                                message: e.to_string(),
                                debug: format!("{:?}", e),
                            });
                        }
                    }
                })
                .expect("failed to spawn element thread");

            self.threads.push(handle);
        }
    }

    fn join_threads(&mut self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.state_cond.notify_all();

        for handle in self.threads.drain(..) {
            handle.join().ok();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shared.bus.set_flushing(true);
        self.join_threads();
        for (_, mut element) in self.prepared.drain(..) {
            element.release();
        }
        *self.shared.state.lock().unwrap() = PipelineState::Null;
    }
}

pub(crate) enum RecvStep {
    Item(Item),
    Timeout,
    Closed,
}

/// The streaming-thread context handed to each element's `run`.
pub struct RunCtx {
    element: String,
    shared: Arc<PipelineShared>,
    inputs: Vec<Receiver<Item>>,
    input_pads: Vec<String>,
    outputs: Vec<Sender<Item>>,
    #[allow(dead_code)]
    output_pads: Vec<String>,
}

impl RunCtx {
    pub fn stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }

    pub fn eos_requested(&self) -> bool {
        self.shared.eos_requested.load(Ordering::SeqCst)
    }

    /// Blocks while the pipeline is paused. Returns false if it's tearing
    /// down instead.
    pub fn wait_playing(&self) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if self.stopping() {
                return false;
            }
            if *state == PipelineState::Playing || self.eos_requested() {
                return true;
            }

            let (guard, _) = self
                .shared
                .state_cond
                .wait_timeout(state, POLL_INTERVAL)
                .unwrap();
            state = guard;
        }
    }

    pub fn input_index(&self, pad: &str) -> Option<usize> {
        self.input_pads.iter().position(|p| p == pad)
    }

    /// Receives from the sole input. None means upstream is gone or the
    /// pipeline is stopping.
    pub fn recv(&self) -> Option<Item> {
        self.recv_from(0)
    }

    pub fn recv_from(&self, idx: usize) -> Option<Item> {
        loop {
            match self.recv_step(idx, POLL_INTERVAL) {
                RecvStep::Item(item) => return Some(item),
                RecvStep::Timeout if !self.stopping() => continue,
                _ => return None,
            }
        }
    }

    pub(crate) fn recv_step(&self, idx: usize, timeout: Duration) -> RecvStep {
        if self.stopping() {
            return RecvStep::Closed;
        }

        match self.inputs[idx].recv_timeout(timeout) {
            Ok(item) => RecvStep::Item(item),
            Err(RecvTimeoutError::Timeout) => RecvStep::Timeout,
            Err(RecvTimeoutError::Disconnected) => RecvStep::Closed,
        }
    }

    pub(crate) fn try_recv_from(&self, idx: usize) -> RecvStep {
        match self.inputs[idx].try_recv() {
            Ok(item) => RecvStep::Item(item),
            Err(crossbeam_channel::TryRecvError::Empty) => RecvStep::Timeout,
            Err(crossbeam_channel::TryRecvError::Disconnected) => RecvStep::Closed,
        }
    }

    /// Fans the item out to every output. Returns false once the pipeline
    /// is stopping or all downstreams are gone.
    pub fn send(&self, item: Item) -> bool {
        if self.outputs.is_empty() {
            return !self.stopping();
        }

        let mut delivered = false;
        for output in &self.outputs {
            let mut item = Some(item.clone());
            loop {
                if self.stopping() {
                    return false;
                }
                match output.try_send(item.take().unwrap()) {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    Err(TrySendError::Full(back)) => {
                        item = Some(back);
                        std::thread::sleep(Duration::from_millis(2));
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
        }

        delivered && !self.stopping()
    }

    pub fn post_warning(&self, message: &str) {
        self.shared.bus.post(BusMessage::Warning {
            element: self.element.clone(),
            message: message.to_owned(),
        });
    }

    /// A sink element reached end of stream. When the last sink does, the
    /// pipeline posts EOS.
    pub fn sink_eos(&self) {
        let done = self.shared.sinks_done.fetch_add(1, Ordering::SeqCst) + 1;
        if done == self.shared.sink_count.load(Ordering::SeqCst) {
            debug!(pipeline = %self.shared.name, "all sinks at EOS");
            self.shared.bus.post(BusMessage::Eos);
        }
    }
}
