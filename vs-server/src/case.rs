// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! A case is a single-purpose pipeline: one per role an input stream plays
//! (ingest, preview, composite feed, outbound branch). The type decides
//! the pipeline description; everything else is the generic worker.

use std::net::TcpStream;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, Weak,
};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ServerConfig;
use crate::pipeline::{graph::Node, Engine, Pipeline, PipelineSpec};
use crate::sched::SchedHandle;
use crate::worker::{PipelineLifecycle, Worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseType {
    InputVideo,
    InputAudio,
    Preview,
    CompositeA,
    CompositeB,
    CompositeAudio,
    BranchVideoA,
    BranchVideoB,
    BranchAudio,
    BranchPreview,
}

impl CaseType {
    pub fn is_branch(&self) -> bool {
        matches!(
            self,
            CaseType::BranchVideoA
                | CaseType::BranchVideoB
                | CaseType::BranchAudio
                | CaseType::BranchPreview
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServeType {
    Nothing,
    VideoStream,
    AudioStream,
}

static CASE_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct Case {
    worker: Arc<Worker>,
    case_type: CaseType,
    serve_type: ServeType,
    sink_port: u16,
    cfg: Arc<ServerConfig>,
    stream: Mutex<Option<TcpStream>>,
    input: Mutex<Option<Weak<Case>>>,
    branch: Mutex<Option<Weak<Case>>>,
}

impl Case {
    pub fn new(
        case_type: CaseType,
        serve_type: ServeType,
        sink_port: u16,
        stream: Option<TcpStream>,
        cfg: Arc<ServerConfig>,
        engine: Arc<Engine>,
        sched: SchedHandle,
    ) -> Arc<Self> {
        let name = format!("case-{}", CASE_SEQ.fetch_add(1, Ordering::Relaxed));

        Arc::new_cyclic(|weak: &Weak<Case>| {
            let role: Weak<dyn PipelineLifecycle> = weak.clone();
            Self {
                worker: Worker::new(&name, engine, sched, role),
                case_type,
                serve_type,
                sink_port,
                cfg,
                stream: Mutex::new(stream),
                input: Mutex::new(None),
                branch: Mutex::new(None),
            }
        })
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn case_type(&self) -> CaseType {
        self.case_type
    }

    pub fn serve_type(&self) -> ServeType {
        self.serve_type
    }

    pub fn sink_port(&self) -> u16 {
        self.sink_port
    }

    pub fn set_input(&self, input: &Arc<Case>) {
        *self.input.lock().unwrap() = Some(Arc::downgrade(input));
    }

    pub fn input(&self) -> Option<Arc<Case>> {
        self.input.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    pub fn set_branch(&self, branch: &Arc<Case>) {
        *self.branch.lock().unwrap() = Some(Arc::downgrade(branch));
    }

    pub fn branch(&self) -> Option<Arc<Case>> {
        self.branch.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    fn media_caps(&self) -> Node {
        let caps = if self.serve_type == ServeType::AudioStream {
            self.cfg.audio_caps.clone()
        } else {
            self.cfg.video_caps.clone()
        };
        Node::caps(caps)
    }
}

impl PipelineLifecycle for Case {
    fn pipeline_spec(&self) -> PipelineSpec {
        let port = self.sink_port;
        let mut b = PipelineSpec::builder();

        match self.case_type {
            CaseType::InputVideo => {
                b.chain(vec![
                    Node::new("streamsrc").name("source"),
                    Node::new("framedepay"),
                    self.media_caps(),
                    Node::new("surfacevideosink")
                        .name("sink")
                        .prop("channel", format!("input_{}", port)),
                ]);
            }

            CaseType::InputAudio => {
                b.chain(vec![
                    Node::new("streamsrc").name("source"),
                    Node::new("framedepay"),
                    Node::caps(self.cfg.audio_caps.clone()),
                    Node::new("surfaceaudiosink")
                        .name("sink")
                        .prop("channel", format!("input_{}", port)),
                ]);
            }

            CaseType::Preview => {
                if self.serve_type == ServeType::AudioStream {
                    b.chain(vec![
                        Node::new("surfaceaudiosrc")
                            .name("source")
                            .prop("channel", format!("input_{}", port)),
                        self.media_caps(),
                        Node::new("audioparse")
                            .prop("raw-format", "s16le")
                            .prop("rate", 48_000),
                        Node::new("surfaceaudiosink")
                            .name("sink")
                            .prop("channel", format!("branch_{}", port)),
                    ]);
                } else {
                    b.chain(vec![
                        Node::new("surfacevideosrc")
                            .name("source")
                            .prop("channel", format!("input_{}", port)),
                        self.media_caps(),
                        Node::new("surfacevideosink")
                            .name("sink")
                            .prop("channel", format!("branch_{}", port)),
                    ]);
                }
            }

            CaseType::CompositeA | CaseType::CompositeB => {
                let channel = if self.case_type == CaseType::CompositeA {
                    "composite_a"
                } else {
                    "composite_b"
                };

                let tee = b.chain(vec![
                    Node::new("surfacevideosrc")
                        .name("source")
                        .prop("channel", format!("input_{}", port)),
                    self.media_caps(),
                    Node::new("tee").name("s"),
                ]);
                b.chain_from(
                    &tee,
                    vec![
                        Node::new("queue"),
                        Node::new("surfacevideosink")
                            .name("sink1")
                            .prop("channel", format!("branch_{}", port)),
                    ],
                );
                b.chain_from(
                    &tee,
                    vec![
                        Node::new("queue"),
                        Node::new("surfacevideosink")
                            .name("sink2")
                            .prop("channel", channel),
                    ],
                );
            }

            CaseType::CompositeAudio => {
                let tee = b.chain(vec![
                    Node::new("surfaceaudiosrc")
                        .name("source")
                        .prop("channel", format!("input_{}", port)),
                    self.media_caps(),
                    Node::new("audioparse")
                        .prop("raw-format", "s16le")
                        .prop("rate", 48_000),
                    Node::new("tee").name("s"),
                ]);
                b.chain_from(
                    &tee,
                    vec![
                        Node::new("queue"),
                        Node::new("surfaceaudiosink")
                            .name("sink1")
                            .prop("channel", format!("branch_{}", port)),
                    ],
                );
                b.chain_from(
                    &tee,
                    vec![
                        Node::new("queue"),
                        Node::new("surfaceaudiosink")
                            .name("sink2")
                            .prop("channel", "composite_audio"),
                    ],
                );
            }

            CaseType::BranchVideoA | CaseType::BranchVideoB | CaseType::BranchPreview => {
                b.chain(vec![
                    Node::new("surfacevideosrc")
                        .name("source")
                        .prop("channel", format!("branch_{}", port)),
                    self.media_caps(),
                    Node::new("framepay"),
                    Node::new("tcpserversink").name("sink").prop("port", port),
                ]);
            }

            CaseType::BranchAudio => {
                b.chain(vec![
                    Node::new("surfaceaudiosrc")
                        .name("source")
                        .prop("channel", format!("branch_{}", port)),
                    self.media_caps(),
                    Node::new("audioparse")
                        .prop("raw-format", "s16le")
                        .prop("rate", 48_000),
                    Node::new("framepay"),
                    Node::new("tcpserversink").name("sink").prop("port", port),
                ]);
            }
        }

        b.build()
    }

    fn prepare(&self, worker: &Worker, pipeline: &Pipeline) -> anyhow::Result<()> {
        match self.case_type {
            CaseType::InputVideo | CaseType::InputAudio => {
                let stream = self
                    .stream
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or_else(|| anyhow!("no stream for new case"))?;
                let source = pipeline
                    .element("source")
                    .context("pipeline has no source")?;
                source.install_stream(stream);
            }

            CaseType::BranchVideoA
            | CaseType::BranchVideoB
            | CaseType::BranchAudio
            | CaseType::BranchPreview => {
                let sink = pipeline.element("sink").context("pipeline has no sink")?;
                // The engine closes departing client sockets; this is just
                // for the record.
                let name = worker.name().to_owned();
                sink.on_client_removed(move |addr| {
                    debug!(case = %name, %addr, "client socket removed");
                });
            }

            _ => (),
        }

        Ok(())
    }

    fn close(&self, _worker: &Worker) {
        // Dropping the connection closes it.
        self.stream.lock().unwrap().take();
        self.input.lock().unwrap().take();
        self.branch.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwitchOpts;
    use clap::Parser;

    fn test_cfg() -> Arc<ServerConfig> {
        ServerConfig::from_opts(&SwitchOpts::parse_from(["vsserver", "--low-res"])).unwrap()
    }

    fn spec_for(case_type: CaseType, serve_type: ServeType) -> PipelineSpec {
        let sched = crate::sched::Scheduler::new();
        let surfaces = Arc::new(crate::surface::SurfaceRegistry::new());
        let engine = Engine::new(surfaces);
        let case = Case::new(
            case_type,
            serve_type,
            3010,
            None,
            test_cfg(),
            engine,
            sched.handle(),
        );
        case.pipeline_spec()
    }

    #[test]
    fn test_input_video_spec() {
        let spec = spec_for(CaseType::InputVideo, ServeType::Nothing);
        let rendered = spec.to_launch_string();
        assert!(rendered.contains("streamsrc name=source"));
        assert!(rendered.contains("channel=input_3010"));
        assert!(rendered.contains("framedepay"));
    }

    #[test]
    fn test_composite_a_tees_to_both_channels() {
        let spec = spec_for(CaseType::CompositeA, ServeType::VideoStream);
        let rendered = spec.to_launch_string();
        assert!(rendered.contains("channel=input_3010"));
        assert!(rendered.contains("channel=branch_3010"));
        assert!(rendered.contains("channel=composite_a"));
    }

    #[test]
    fn test_branch_serves_own_port() {
        let spec = spec_for(CaseType::BranchPreview, ServeType::VideoStream);
        let rendered = spec.to_launch_string();
        assert!(rendered.contains("channel=branch_3010"));
        assert!(rendered.contains("tcpserversink name=sink port=3010"));
    }

    #[test]
    fn test_audio_pipelines_parse_raw() {
        let spec = spec_for(CaseType::CompositeAudio, ServeType::AudioStream);
        let rendered = spec.to_launch_string();
        assert!(rendered.contains("audioparse"));
        assert!(rendered.contains("channel=composite_audio"));
    }
}
