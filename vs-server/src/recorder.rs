// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The recording stage: composite video and audio muxed into a streamable
//! file plus a TCP feed. Recordings are cut by stopping with EOS so the
//! muxer can finalize the file.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use anyhow::{bail, Context};
use chrono::format::{Item, StrftimeItems};
use chrono::Local;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::format::{Caps, CapsValue};
use crate::pipeline::{graph::Node, Engine, Pipeline, PipelineSpec};
use crate::sched::SchedHandle;
use crate::worker::{PipelineLifecycle, Worker};

fn size_caps(width: u32, height: u32) -> Caps {
    Caps::new("video/x-raw")
        .with("width", CapsValue::Int(width as i32))
        .with("height", CapsValue::Int(height as i32))
}

pub struct Recorder {
    worker: Arc<Worker>,
    cfg: Arc<ServerConfig>,
    sink_port: u16,
}

impl Recorder {
    pub fn new(
        cfg: Arc<ServerConfig>,
        engine: Arc<Engine>,
        sched: SchedHandle,
        sink_port: u16,
    ) -> Arc<Self> {
        let recorder = Arc::new_cyclic(|weak: &Weak<Recorder>| {
            let role: Weak<dyn PipelineLifecycle> = weak.clone();
            Self {
                worker: Worker::new("recorder", engine, sched, role),
                cfg,
                sink_port,
            }
        });

        // A recording needs a clean shutdown via EOS to close out the
        // file.
        recorder.worker.set_send_eos_on_stop(true);
        recorder
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn start(&self) -> bool {
        self.worker.start()
    }

    /// Stops with EOS; blocks until the file is finalized.
    pub fn stop(&self) -> bool {
        self.worker.stop()
    }
}

impl PipelineLifecycle for Recorder {
    fn pipeline_spec(&self) -> PipelineSpec {
        let filename = self
            .cfg
            .record_template
            .as_deref()
            .and_then(|template| match new_recording_filename(template) {
                Ok(path) => Some(path),
                Err(e) => {
                    error!("cannot record: {:#}", e);
                    None
                }
            });

        let width = self.cfg.default_width();
        let height = self.cfg.default_height();
        let mut b = PipelineSpec::builder();

        let mux = b.add(
            Node::new("recmux")
                .name("mux")
                .prop("streamable", true)
                .prop("writing-app", "gst-switch")
                .prop("index-interval-ms", 1000),
        );

        // Lossless-leaning video; audio goes in raw.
        let video = b.chain(vec![
            Node::new("surfacevideosrc")
                .name("source_video")
                .prop("channel", "composite_video"),
            Node::caps(size_caps(width, height)),
            Node::new("queue"),
            Node::new("jpegenc").prop("quality", 100),
        ]);
        b.link_pads(&video, "src", &mux, "video");

        let audio = b.chain(vec![
            Node::new("surfaceaudiosrc")
                .name("source_audio")
                .prop("channel", "composite_audio"),
            Node::new("queue"),
        ]);
        b.link_pads(&audio, "src", &mux, "audio");

        let result = b.chain_from(&mux, vec![Node::new("tee").name("result")]);

        if let Some(filename) = filename {
            b.chain_from(
                &result,
                vec![
                    Node::new("queue").prop("max-size-buffers", 1),
                    Node::new("filesink")
                        .name("disk_sink")
                        .prop("sync", false)
                        .prop("location", filename.to_string_lossy().into_owned()),
                ],
            );
        }

        b.chain_from(
            &result,
            vec![
                Node::new("queue").prop("max-size-buffers", 1),
                Node::new("framepay"),
                Node::new("tcpserversink")
                    .name("tcp_sink")
                    .prop("sync", false)
                    .prop("port", self.sink_port),
            ],
        );

        b.build()
    }

    fn prepare(&self, _worker: &Worker, pipeline: &Pipeline) -> anyhow::Result<()> {
        let tcp_sink = pipeline
            .element("tcp_sink")
            .context("pipeline has no tcp_sink")?;
        tcp_sink.on_client_removed(|addr| {
            info!(%addr, "encode client socket removed");
        });
        Ok(())
    }
}

/// Expands the strftime template and picks a name that doesn't exist yet,
/// creating the directory prefix as needed. Collisions get a numeric
/// suffix, up to `.999`.
pub fn new_recording_filename(template: &str) -> anyhow::Result<PathBuf> {
    let items: Vec<Item> = StrftimeItems::new(template).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        bail!("invalid filename template: {:?}", template);
    }

    let expanded = Local::now().format_with_items(items.iter()).to_string();
    let path = PathBuf::from(expanded);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            // Errors here surface as an open failure later.
            use std::os::unix::fs::DirBuilderExt;
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)
                .ok();
        }
    }

    if !path.exists() {
        return Ok(path);
    }

    let base = path.to_string_lossy().into_owned();
    for suffix in 0..=999 {
        let candidate = PathBuf::from(format!("{}.{:03}", base, suffix));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!("no free recording filename for {:?}", base);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TempDir(PathBuf);

    impl TempDir {
        fn new(tag: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "vs-recorder-{}-{}-{:?}",
                tag,
                std::process::id(),
                std::thread::current().id(),
            ));
            std::fs::create_dir_all(&path).unwrap();
            Self(path)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.0).ok();
        }
    }

    #[test]
    fn test_filename_template_expansion() {
        let dir = TempDir::new("expand");
        let template = format!("{}/rec-%Y%m%d.mkv", dir.0.display());

        let path = new_recording_filename(&template).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("rec-"), "{}", name);
        assert!(name.ends_with(".mkv"));
        // The date expands to eight digits.
        assert_eq!(name.len(), "rec-00000000.mkv".len());
    }

    #[test]
    fn test_filename_collision_suffix() {
        let dir = TempDir::new("collide");
        let template = format!("{}/rec.mkv", dir.0.display());

        let first = new_recording_filename(&template).unwrap();
        assert!(first.to_string_lossy().ends_with("rec.mkv"));
        std::fs::write(&first, b"x").unwrap();

        let second = new_recording_filename(&template).unwrap();
        assert!(second.to_string_lossy().ends_with("rec.mkv.000"));
        std::fs::write(&second, b"x").unwrap();

        let third = new_recording_filename(&template).unwrap();
        assert!(third.to_string_lossy().ends_with("rec.mkv.001"));
    }

    #[test]
    fn test_filename_creates_directories() {
        let dir = TempDir::new("mkdirs");
        let template = format!("{}/a/b/rec.mkv", dir.0.display());

        let path = new_recording_filename(&template).unwrap();
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn test_bad_template() {
        assert!(new_recording_filename("rec-%Q.mkv").is_err());
    }
}
