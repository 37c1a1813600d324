// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The switch server: accepts input streams, spawns the case pipelines for
//! each, and owns the composite, output and recorder stages. Control
//! operations arrive over the controller channel and land here.

pub mod control;

use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};
use std::time::Duration;

use anyhow::Context;
use hashbrown::HashSet;
use mio::unix::SourceFd;
use tracing::{debug, info, warn};

use crate::case::{Case, CaseType, ServeType};
use crate::composite::{
    check_min_pip_height, check_min_pip_width, Composite, CompositeMode,
};
use crate::config::ServerConfig;
use crate::pipeline::{graph::Node, Engine, PipelineSpec};
use crate::recorder::Recorder;
use crate::sched::SchedHandle;
use crate::worker::{PipelineLifecycle, Worker};

pub const MIN_SINK_PORT: u16 = 1;
pub const MAX_SINK_PORT: u16 = u16::MAX;

const ACCEPT: mio::Token = mio::Token(0);
const WAKER: mio::Token = mio::Token(1);

/// Allocates TCP serving ports, skipping anything already spoken for.
struct PortAlloc {
    next: u16,
    used: HashSet<u16>,
}

impl PortAlloc {
    fn new(first: u16, reserved: impl IntoIterator<Item = u16>) -> Self {
        Self {
            next: first.max(MIN_SINK_PORT),
            used: reserved.into_iter().collect(),
        }
    }

    fn alloc(&mut self) -> Option<u16> {
        for _ in 0..=(MAX_SINK_PORT - MIN_SINK_PORT) {
            let port = self.next;
            self.next = if port == MAX_SINK_PORT {
                MIN_SINK_PORT
            } else {
                port + 1
            };

            if self.used.insert(port) {
                return Some(port);
            }
        }
        None
    }

    fn release(&mut self, port: u16) {
        self.used.remove(&port);
    }
}

#[derive(Debug, Clone, Copy)]
struct PipIntent {
    x: i32,
    y: i32,
    width: u32,
    height: u32,
}

/// Serves the composited program over TCP on the compose port.
struct OutputRole {
    cfg: Arc<ServerConfig>,
    compose_port: u16,
}

impl PipelineLifecycle for OutputRole {
    fn pipeline_spec(&self) -> PipelineSpec {
        let mut b = PipelineSpec::builder();
        b.chain(vec![
            Node::new("surfacevideosrc")
                .name("source")
                .prop("channel", "composite_out"),
            Node::caps(self.cfg.video_caps.clone()),
            Node::new("framepay"),
            Node::new("tcpserversink")
                .name("sink")
                .prop("port", self.compose_port),
        ]);
        b.build()
    }
}

pub struct SwitchServer {
    self_ref: Weak<SwitchServer>,
    cfg: Arc<ServerConfig>,
    engine: Arc<Engine>,
    sched: SchedHandle,

    cases: Mutex<Vec<Arc<Case>>>,
    ports: Mutex<PortAlloc>,
    // Serializes new inputs and switches, so case wiring never interleaves.
    serve_lock: Mutex<()>,

    composite: Arc<Composite>,
    output: Arc<Worker>,
    _output_role: Arc<OutputRole>,
    recorder: Mutex<Option<Arc<Recorder>>>,

    compose_port: u16,
    encode_port: u16,

    pip: Mutex<PipIntent>,

    shutdown: AtomicBool,
    wakers: Mutex<Vec<Arc<mio::Waker>>>,
    acceptors: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl SwitchServer {
    pub fn new(cfg: Arc<ServerConfig>, engine: Arc<Engine>, sched: SchedHandle) -> Arc<Self> {
        let mut ports = PortAlloc::new(
            cfg.video_input_port.wrapping_add(1),
            [cfg.video_input_port, cfg.audio_input_port],
        );
        let compose_port = ports.alloc().expect("port space exhausted");
        let encode_port = ports.alloc().expect("port space exhausted");

        let composite = Composite::new(cfg.clone(), engine.clone(), sched.clone());

        let output_role = Arc::new(OutputRole {
            cfg: cfg.clone(),
            compose_port,
        });
        let output_dyn: Arc<dyn PipelineLifecycle> = output_role.clone();
        let output_weak: Weak<dyn PipelineLifecycle> = Arc::downgrade(&output_dyn);
        let output = Worker::new("output", engine.clone(), sched.clone(), output_weak);
        output.set_auto_replay(true);

        // The PIP intent starts out at the mode's default geometry.
        let (_, b) = crate::composite::mode_geometry(
            CompositeMode::Pip,
            cfg.default_width(),
            cfg.default_height(),
        );

        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            cfg,
            engine,
            sched,
            cases: Mutex::new(Vec::new()),
            ports: Mutex::new(ports),
            serve_lock: Mutex::new(()),
            composite,
            output,
            _output_role: output_role,
            recorder: Mutex::new(None),
            compose_port,
            encode_port,
            pip: Mutex::new(PipIntent {
                x: b.x as i32,
                y: b.y as i32,
                width: b.width,
                height: b.height,
            }),
            shutdown: AtomicBool::new(false),
            wakers: Mutex::new(Vec::new()),
            acceptors: Mutex::new(Vec::new()),
        })
    }

    pub fn cfg(&self) -> &Arc<ServerConfig> {
        &self.cfg
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn register_waker(&self, waker: Arc<mio::Waker>) {
        self.wakers.lock().unwrap().push(waker);
    }

    /// Starts the mixing stages and the accept loops. Failing to bind an
    /// input port is fatal.
    pub fn start(&self) -> anyhow::Result<()> {
        if !self.composite.start() {
            warn!("composite failed to start");
        }
        if !self.output.start() {
            warn!("output failed to start");
        }

        if self.cfg.record_template.is_some() {
            let recorder = Recorder::new(
                self.cfg.clone(),
                self.engine.clone(),
                self.sched.clone(),
                self.encode_port,
            );
            if recorder.start() {
                *self.recorder.lock().unwrap() = Some(recorder);
            } else {
                warn!("recorder failed to start");
            }
        }

        let video = self.spawn_acceptor(ServeType::VideoStream, self.cfg.video_input_port)?;
        let audio = self.spawn_acceptor(ServeType::AudioStream, self.cfg.audio_input_port)?;
        let control = control::spawn(
            &self.self_ref.upgrade().expect("server still alive"),
        )?;

        let mut acceptors = self.acceptors.lock().unwrap();
        acceptors.push(video);
        acceptors.push(audio);
        acceptors.push(control);

        Ok(())
    }

    fn spawn_acceptor(
        &self,
        kind: ServeType,
        port: u16,
    ) -> anyhow::Result<std::thread::JoinHandle<()>> {
        let listener = std::net::TcpListener::bind(("0.0.0.0", port))
            .with_context(|| format!("binding input port {}", port))?;
        listener.set_nonblocking(true)?;

        let poll = mio::Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER)?);
        poll.registry()
            .register(&mut SourceFd(&listener.as_raw_fd()), ACCEPT, mio::Interest::READABLE)?;
        self.wakers.lock().unwrap().push(waker);

        info!(?kind, port, "accepting inputs");

        let weak = self.self_ref.clone();
        let name = format!(
            "acceptor-{}",
            if kind == ServeType::AudioStream {
                "audio"
            } else {
                "video"
            }
        );

        let handle = std::thread::Builder::new().name(name).spawn(move || {
            let mut poll = poll;
            let mut events = mio::Events::with_capacity(8);
            loop {
                let Some(server) = weak.upgrade() else { return };
                if server.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                drop(server);

                poll.poll(&mut events, Some(Duration::from_millis(500))).ok();

                loop {
                    match listener.accept() {
                        Ok((stream, addr)) => {
                            info!(%addr, ?kind, "new input connection");
                            stream.set_nonblocking(false).ok();
                            if let Some(server) = weak.upgrade() {
                                server.serve_stream(stream, kind);
                            }
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            warn!("accept failed: {}", e);
                            break;
                        }
                    }
                }
            }
        })?;

        Ok(handle)
    }

    fn alloc_port(&self) -> Option<u16> {
        self.ports.lock().unwrap().alloc()
    }

    fn release_port(&self, port: u16) {
        self.ports.lock().unwrap().release(port);
    }

    /// Wires up the three cases serving one accepted input: the ingest
    /// case, its role case (composite feed or preview) and the branch
    /// serving it back out.
    pub fn serve_stream(&self, stream: TcpStream, kind: ServeType) {
        let _guard = self.serve_lock.lock().unwrap();

        let Some(port) = self.alloc_port() else {
            warn!("no free sink port, dropping connection");
            return;
        };

        let (input_type, role_type, branch_type) = {
            let cases = self.cases.lock().unwrap();
            let has = |t: CaseType| cases.iter().any(|c| c.case_type() == t);

            match kind {
                ServeType::AudioStream => {
                    if !has(CaseType::CompositeAudio) {
                        (
                            CaseType::InputAudio,
                            CaseType::CompositeAudio,
                            CaseType::BranchAudio,
                        )
                    } else {
                        (CaseType::InputAudio, CaseType::Preview, CaseType::BranchAudio)
                    }
                }
                _ => {
                    if !has(CaseType::CompositeA) {
                        (
                            CaseType::InputVideo,
                            CaseType::CompositeA,
                            CaseType::BranchVideoA,
                        )
                    } else if !has(CaseType::CompositeB) {
                        (
                            CaseType::InputVideo,
                            CaseType::CompositeB,
                            CaseType::BranchVideoB,
                        )
                    } else {
                        (
                            CaseType::InputVideo,
                            CaseType::Preview,
                            CaseType::BranchPreview,
                        )
                    }
                }
            }
        };

        let input = self.new_case(input_type, ServeType::Nothing, port, Some(stream));
        let role = self.new_case(role_type, kind, port, None);
        let branch = self.new_case(branch_type, kind, port, None);

        role.set_input(&input);
        role.set_branch(&branch);
        branch.set_input(&role);

        // When the remote hangs up, the whole group goes away.
        let weak = self.self_ref.clone();
        let input_weak = Arc::downgrade(&input);
        input.worker().events().end_worker.connect(move |_| {
            if let (Some(server), Some(input)) = (weak.upgrade(), input_weak.upgrade()) {
                server.remove_input_group(&input);
            }
        });

        {
            let mut cases = self.cases.lock().unwrap();
            cases.push(input.clone());
            cases.push(role.clone());
            cases.push(branch.clone());
        }

        for case in [&input, &role, &branch] {
            if !case.worker().start() {
                warn!(port, case = ?case.case_type(), "case failed to start");
            }
        }

        info!(port, role = ?role.case_type(), "input case started");
    }

    fn new_case(
        &self,
        case_type: CaseType,
        serve_type: ServeType,
        port: u16,
        stream: Option<TcpStream>,
    ) -> Arc<Case> {
        Case::new(
            case_type,
            serve_type,
            port,
            stream,
            self.cfg.clone(),
            self.engine.clone(),
            self.sched.clone(),
        )
    }

    /// Drops every case bound to a departed input's port.
    fn remove_input_group(&self, input: &Arc<Case>) {
        let removed = {
            let mut cases = self.cases.lock().unwrap();
            if !cases.iter().any(|c| Arc::ptr_eq(c, input)) {
                return;
            }

            let port = input.sink_port();
            let mut removed = Vec::new();
            cases.retain(|c| {
                if c.sink_port() == port {
                    removed.push(c.clone());
                    false
                } else {
                    true
                }
            });
            removed
        };

        for case in &removed {
            case.worker().stop();
        }

        let port = input.sink_port();
        self.release_port(port);
        info!(port, "input removed");
    }

    pub fn compose_port(&self) -> u16 {
        self.compose_port
    }

    pub fn encode_port(&self) -> u16 {
        self.encode_port
    }

    /// The serving port of the active composite-audio channel, 0 if none.
    pub fn audio_port(&self) -> u16 {
        let cases = self.cases.lock().unwrap();
        cases
            .iter()
            .find(|c| c.case_type() == CaseType::CompositeAudio)
            .map(|c| c.sink_port())
            .unwrap_or(0)
    }

    /// One entry per serving case. An unselected preview reports as
    /// `Preview`; the selected channels report their branch role.
    pub fn preview_ports(&self) -> Vec<(u16, ServeType, CaseType)> {
        let cases = self.cases.lock().unwrap();
        cases
            .iter()
            .filter(|c| c.serve_type() != ServeType::Nothing && c.case_type().is_branch())
            .map(|c| {
                let reported = match c.case_type() {
                    CaseType::BranchPreview => CaseType::Preview,
                    other => other,
                };
                (c.sink_port(), c.serve_type(), reported)
            })
            .collect()
    }

    pub fn set_composite_mode(&self, mode: CompositeMode) -> bool {
        self.composite.set_mode(mode)
    }

    pub fn composite_mode(&self) -> CompositeMode {
        self.composite.mode()
    }

    /// Swaps the input serving `port` into the A, B or audio role. The
    /// ingest case keeps running; only the downstream pairs rebuild.
    pub fn switch(&self, channel: char, port: u16) -> bool {
        let _guard = self.serve_lock.lock().unwrap();

        let (role_type, branch_type, serve) = match channel {
            'A' => (
                CaseType::CompositeA,
                CaseType::BranchVideoA,
                ServeType::VideoStream,
            ),
            'B' => (
                CaseType::CompositeB,
                CaseType::BranchVideoB,
                ServeType::VideoStream,
            ),
            'a' => (
                CaseType::CompositeAudio,
                CaseType::BranchAudio,
                ServeType::AudioStream,
            ),
            other => {
                warn!("unknown switch channel {:?}", other);
                return false;
            }
        };

        let (current, candidate) = {
            let cases = self.cases.lock().unwrap();
            let current = cases
                .iter()
                .find(|c| c.case_type() == role_type)
                .cloned();
            let candidate = cases
                .iter()
                .find(|c| {
                    c.sink_port() == port
                        && c.serve_type() == serve
                        && c.case_type() == CaseType::Preview
                })
                .cloned();
            (current, candidate)
        };

        if let Some(current) = &current {
            if current.sink_port() == port {
                return true;
            }
        }

        let Some(candidate) = candidate else {
            warn!(channel = %channel, port, "no previewing input to switch to");
            return false;
        };

        info!(channel = %channel, port, "switching");

        // Demote the old selection back to a preview, then promote.
        if let Some(current) = &current {
            let demoted_branch = if serve == ServeType::AudioStream {
                CaseType::BranchAudio
            } else {
                CaseType::BranchPreview
            };
            self.retype_pair(current, CaseType::Preview, demoted_branch);
        }
        self.retype_pair(&candidate, role_type, branch_type);

        true
    }

    /// Replaces a role case and its branch with fresh cases of a new type
    /// on the same port.
    fn retype_pair(&self, role_case: &Arc<Case>, new_type: CaseType, new_branch: CaseType) {
        let port = role_case.sink_port();
        let serve = role_case.serve_type();
        let input = role_case.input();
        let branch = role_case.branch();

        role_case.worker().stop();
        if let Some(branch) = &branch {
            branch.worker().stop();
        }

        {
            let mut cases = self.cases.lock().unwrap();
            cases.retain(|c| {
                !Arc::ptr_eq(c, role_case)
                    && !branch.as_ref().map(|b| Arc::ptr_eq(c, b)).unwrap_or(false)
            });
        }

        let new_role = self.new_case(new_type, serve, port, None);
        let new_branch_case = self.new_case(new_branch, serve, port, None);
        if let Some(input) = &input {
            new_role.set_input(input);
        }
        new_role.set_branch(&new_branch_case);
        new_branch_case.set_input(&new_role);

        {
            let mut cases = self.cases.lock().unwrap();
            cases.push(new_role.clone());
            cases.push(new_branch_case.clone());
        }

        if !new_role.worker().start() {
            warn!(port, case = ?new_type, "retyped case failed to start");
        }
        if !new_branch_case.worker().start() {
            warn!(port, case = ?new_branch, "retyped branch failed to start");
        }
    }

    /// Applies PIP deltas with clamping and forwards the result to the
    /// composite. The returned mask has a bit per coordinate that moved.
    pub fn adjust_pip(&self, dx: i32, dy: i32, dw: i32, dh: i32) -> u32 {
        let width = self.cfg.default_width();
        let height = self.cfg.default_height();

        let mut pip = self.pip.lock().unwrap();
        let old = *pip;

        pip.width = check_min_pip_width(width, pip.width.saturating_add_signed(dw)).min(width);
        pip.height =
            check_min_pip_height(height, pip.height.saturating_add_signed(dh)).min(height);
        pip.x = (pip.x + dx).clamp(0, (width - pip.width) as i32);
        pip.y = (pip.y + dy).clamp(0, (height - pip.height) as i32);

        if !self
            .composite
            .adjust_pip(pip.x, pip.y, pip.width, pip.height)
        {
            *pip = old;
            return 0;
        }

        let mut mask = 0;
        if pip.x != old.x {
            mask |= 1;
        }
        if pip.y != old.y {
            mask |= 2;
        }
        if pip.width != old.width {
            mask |= 4;
        }
        if pip.height != old.height {
            mask |= 8;
        }
        mask
    }

    /// Reserved for face-region switching; nothing downstream consumes it
    /// yet.
    pub fn click_video(&self, x: i32, y: i32, frame_width: u32, frame_height: u32) -> bool {
        debug!(x, y, frame_width, frame_height, "video clicked");
        true
    }

    /// Cuts the current recording: the running recorder stops cleanly and
    /// a new one starts with a freshly computed filename.
    pub fn new_record(&self) -> bool {
        if self.cfg.record_template.is_none() {
            return false;
        }

        let mut guard = self.recorder.lock().unwrap();
        if let Some(old) = guard.take() {
            old.stop();
            // Make sure the TCP sink's port is free before rebinding.
            old.worker().stop_force(true);
        }

        let recorder = Recorder::new(
            self.cfg.clone(),
            self.engine.clone(),
            self.sched.clone(),
            self.encode_port,
        );
        let ok = recorder.start();
        *guard = Some(recorder);

        info!(ok, "recording cut");
        ok
    }

    /// Stops everything: acceptors first, then the cases (gently, then
    /// forced), then the mixing stages.
    pub fn shut_down(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down");

        for waker in self.wakers.lock().unwrap().drain(..) {
            waker.wake().ok();
        }
        for handle in self.acceptors.lock().unwrap().drain(..) {
            handle.join().ok();
        }

        let cases: Vec<_> = self.cases.lock().unwrap().clone();
        for case in &cases {
            case.worker().stop();
        }
        for case in &cases {
            case.worker().stop_force(true);
        }
        self.cases.lock().unwrap().clear();

        if let Some(recorder) = self.recorder.lock().unwrap().take() {
            recorder.stop();
            recorder.worker().stop_force(true);
        }

        self.composite.shut_down();
        self.output.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwitchOpts;
    use crate::sched::Scheduler;
    use clap::Parser;

    #[test]
    fn test_port_alloc_skips_used_and_wraps() {
        let mut ports = PortAlloc::new(MAX_SINK_PORT - 1, [MAX_SINK_PORT]);
        assert_eq!(ports.alloc(), Some(MAX_SINK_PORT - 1));
        // The reserved port is skipped and the counter wraps.
        assert_eq!(ports.alloc(), Some(MIN_SINK_PORT));
        assert_eq!(ports.alloc(), Some(MIN_SINK_PORT + 1));

        ports.release(MAX_SINK_PORT - 1);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..16 {
            seen.insert(ports.alloc().unwrap());
        }
        assert!(seen.contains(&(MAX_SINK_PORT - 1)));
    }

    fn harness(base_port: u16) -> (Scheduler, Arc<SwitchServer>) {
        let sched = Scheduler::new();
        let cfg = ServerConfig::from_opts(&SwitchOpts::parse_from([
            "vsserver",
            "--low-res",
            "--video-input-port",
            &base_port.to_string(),
            "--audio-input-port",
            &(base_port + 1000).to_string(),
        ]))
        .unwrap();

        let surfaces = Arc::new(crate::surface::SurfaceRegistry::new());
        let engine = Engine::new(surfaces);
        let server = SwitchServer::new(cfg, engine, sched.handle());
        (sched, server)
    }

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        (server_side, client)
    }

    fn fake_input() -> TcpStream {
        let (server_side, client) = connected_pair();
        // Keep the client end alive by leaking it; the test only needs the
        // connection to stay open.
        std::mem::forget(client);
        server_side
    }

    #[test]
    fn test_serve_assigns_roles_in_order() {
        let (_sched, server) = harness(42300);

        server.serve_stream(fake_input(), ServeType::VideoStream);
        server.serve_stream(fake_input(), ServeType::VideoStream);
        server.serve_stream(fake_input(), ServeType::VideoStream);

        let mut ports = server.preview_ports();
        ports.sort_by_key(|p| p.0);
        assert_eq!(ports.len(), 3);

        // First two take the composite channels, the third previews.
        assert_eq!(ports[0].2, CaseType::BranchVideoA);
        assert_eq!(ports[1].2, CaseType::BranchVideoB);
        assert_eq!(ports[2].2, CaseType::Preview);
        assert!(ports.iter().all(|p| p.1 == ServeType::VideoStream));

        server.shut_down();
    }

    #[test]
    fn test_switch_retypes_cases() {
        let (_sched, server) = harness(42400);

        server.serve_stream(fake_input(), ServeType::VideoStream);
        server.serve_stream(fake_input(), ServeType::VideoStream);
        server.serve_stream(fake_input(), ServeType::VideoStream);

        let mut ports = server.preview_ports();
        ports.sort_by_key(|p| p.0);
        let preview_port = ports
            .iter()
            .find(|p| p.2 == CaseType::Preview)
            .map(|p| p.0)
            .unwrap();
        let a_port = ports
            .iter()
            .find(|p| p.2 == CaseType::BranchVideoA)
            .map(|p| p.0)
            .unwrap();

        assert!(server.switch('A', preview_port));

        let ports = server.preview_ports();
        let find = |port| {
            ports
                .iter()
                .find(|p| p.0 == port)
                .map(|p| p.2)
                .unwrap()
        };
        assert_eq!(find(preview_port), CaseType::BranchVideoA);
        assert_eq!(find(a_port), CaseType::Preview);

        // Switching to the already-active port is a no-op success.
        assert!(server.switch('A', preview_port));
        // Switching to something that isn't previewing fails.
        assert!(!server.switch('A', 1));
        assert!(!server.switch('x', preview_port));

        server.shut_down();
    }

    #[test]
    fn test_input_disconnect_cleans_group() {
        let (_sched, server) = harness(42600);

        let (stream, client) = connected_pair();
        server.serve_stream(stream, ServeType::VideoStream);
        assert_eq!(server.preview_ports().len(), 1);

        // Hanging up ends the ingest case, which takes its whole group
        // (and the port) with it.
        drop(client);

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !server.preview_ports().is_empty() {
            assert!(
                std::time::Instant::now() < deadline,
                "cases never cleaned up"
            );
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(server.cases.lock().unwrap().is_empty());

        server.shut_down();
    }

    #[test]
    fn test_audio_port_tracks_composite_audio() {
        let (_sched, server) = harness(42500);

        assert_eq!(server.audio_port(), 0);
        server.serve_stream(fake_input(), ServeType::AudioStream);

        let port = server.audio_port();
        assert_ne!(port, 0);

        let ports = server.preview_ports();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].1, ServeType::AudioStream);
        assert_eq!(ports[0].2, CaseType::BranchAudio);

        server.shut_down();
    }
}
