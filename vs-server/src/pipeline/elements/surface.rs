// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Elements bridging pipelines through the surface registry. A sink
//! publishes its pipeline's latest frame; a source paces itself on the
//! configured framerate and reads whatever is current, synthesizing black
//! until a writer shows up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::format::{Caps, CapsValue, Fraction, VideoInfo};
use crate::pipeline::elements::video::{i420_black, i420_frame_size};
use crate::pipeline::runtime::{BuildCtx, Element, ElementError, ElementShared, Item, RunCtx};
use crate::pipeline::Buffer;
use crate::surface::{Surface, SurfaceRegistry};

const AUDIO_TICK: Duration = Duration::from_millis(20);
const AUDIO_TICK_BYTES: usize = 48_000 / 50 * 2 * 2; // 20ms of s16le stereo

fn channel_prop(shared: &ElementShared) -> Result<String, ElementError> {
    shared
        .prop_str("channel")
        .ok_or_else(|| ElementError::Failed("no channel configured".into()))
}

pub(super) struct SurfaceVideoSink {
    shared: Arc<ElementShared>,
    surfaces: Arc<SurfaceRegistry>,
    surface: Option<Arc<Surface>>,
}

pub(super) fn make_video_sink(shared: Arc<ElementShared>, ctx: &BuildCtx) -> Box<dyn Element> {
    Box::new(SurfaceVideoSink {
        shared,
        surfaces: ctx.surfaces.clone(),
        surface: None,
    })
}

impl Element for SurfaceVideoSink {
    fn prepare(&mut self) -> Result<(), ElementError> {
        let surface = self.surfaces.get(&channel_prop(&self.shared)?);
        surface.set_video_info(VideoInfo::zeroed());
        self.surface = Some(surface);
        Ok(())
    }

    fn run(&mut self, ctx: &mut RunCtx) -> Result<(), ElementError> {
        let surface = self.surface.as_ref().unwrap();
        while let Some(item) = ctx.recv() {
            match item {
                Item::Caps(caps) => {
                    let info = VideoInfo::from_caps(&caps).ok_or_else(|| {
                        ElementError::Negotiation(format!("not video caps: {}", caps))
                    })?;
                    surface.set_video_info(info);
                }
                Item::Buffer(buffer) => surface.publish_video(buffer),
                Item::Eos => {
                    ctx.sink_eos();
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(surface) = self.surface.take() {
            surface.clear();
        }
    }
}

pub(super) struct SurfaceAudioSink {
    shared: Arc<ElementShared>,
    surfaces: Arc<SurfaceRegistry>,
    surface: Option<Arc<Surface>>,
}

pub(super) fn make_audio_sink(shared: Arc<ElementShared>, ctx: &BuildCtx) -> Box<dyn Element> {
    Box::new(SurfaceAudioSink {
        shared,
        surfaces: ctx.surfaces.clone(),
        surface: None,
    })
}

impl Element for SurfaceAudioSink {
    fn prepare(&mut self) -> Result<(), ElementError> {
        self.surface = Some(self.surfaces.get(&channel_prop(&self.shared)?));
        Ok(())
    }

    fn run(&mut self, ctx: &mut RunCtx) -> Result<(), ElementError> {
        let surface = self.surface.as_ref().unwrap();
        while let Some(item) = ctx.recv() {
            match item {
                Item::Caps(_) => (),
                Item::Buffer(buffer) => surface.publish_audio(buffer),
                Item::Eos => {
                    ctx.sink_eos();
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(surface) = self.surface.take() {
            surface.clear();
        }
    }
}

pub(super) struct SurfaceVideoSrc {
    shared: Arc<ElementShared>,
    surfaces: Arc<SurfaceRegistry>,
    caps_hint: Option<Caps>,
    surface: Option<Arc<Surface>>,
}

pub(super) fn make_video_src(shared: Arc<ElementShared>, ctx: &BuildCtx) -> Box<dyn Element> {
    Box::new(SurfaceVideoSrc {
        shared,
        surfaces: ctx.surfaces.clone(),
        caps_hint: ctx.caps_hint.clone(),
        surface: None,
    })
}

impl SurfaceVideoSrc {
    /// Output geometry comes from the downstream capsfilter; the rate from
    /// the filter if it has one, then from whatever the writer published.
    fn resolve_format(&self, ctx: &RunCtx) -> Option<(u32, u32, Fraction)> {
        let surface = self.surface.as_ref().unwrap();

        loop {
            if ctx.stopping() {
                return None;
            }

            let info = surface.video_info();
            if let Some(hint) = &self.caps_hint {
                let width = hint.get_int("width").unwrap_or(info.width as i32) as u32;
                let height = hint.get_int("height").unwrap_or(info.height as i32) as u32;
                let fps = hint
                    .get_fraction("framerate")
                    .or_else(|| (!info.is_zeroed()).then_some(info.fps))
                    .unwrap_or(Fraction::new(25, 1));
                if width > 0 && height > 0 {
                    return Some((width, height, fps));
                }
            } else if !info.is_zeroed() {
                return Some((info.width, info.height, info.fps));
            }

            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Element for SurfaceVideoSrc {
    fn prepare(&mut self) -> Result<(), ElementError> {
        self.surface = Some(self.surfaces.get(&channel_prop(&self.shared)?));
        Ok(())
    }

    fn run(&mut self, ctx: &mut RunCtx) -> Result<(), ElementError> {
        if !ctx.wait_playing() {
            return Ok(());
        }

        let Some((width, height, fps)) = self.resolve_format(ctx) else {
            return Ok(());
        };
        let fps = if fps.num <= 0 { Fraction::new(25, 1) } else { fps };

        let caps = Caps::new("video/x-raw")
            .with("format", CapsValue::Str("I420".into()))
            .with("width", CapsValue::Int(width as i32))
            .with("height", CapsValue::Int(height as i32))
            .with("framerate", CapsValue::Fraction(fps))
            .with(
                "pixel-aspect-ratio",
                CapsValue::Fraction(Fraction::new(1, 1)),
            );
        if !ctx.send(Item::Caps(caps)) {
            return Ok(());
        }

        let frame_size = i420_frame_size(width, height);
        let black = i420_black(width, height);
        let frame_ns = 1_000_000_000u64 * fps.den as u64 / fps.num as u64;

        let surface = self.surface.as_ref().unwrap();
        let start = Instant::now();
        let mut n: u64 = 0;
        loop {
            if !ctx.wait_playing() {
                return Ok(());
            }
            if ctx.eos_requested() {
                ctx.send(Item::Eos);
                return Ok(());
            }

            let payload = match surface.take_video() {
                Some(b) if b.payload.len() == frame_size => b.payload,
                _ => black.clone(),
            };
            if !ctx.send(Item::Buffer(Buffer::with_timing(
                payload,
                n * frame_ns,
                frame_ns,
            ))) {
                return Ok(());
            }

            n += 1;
            let target = Duration::from_nanos(n * frame_ns);
            loop {
                let elapsed = start.elapsed();
                if elapsed >= target || ctx.stopping() {
                    break;
                }
                std::thread::sleep((target - elapsed).min(Duration::from_millis(50)));
            }
        }
    }
}

pub(super) struct SurfaceAudioSrc {
    shared: Arc<ElementShared>,
    surfaces: Arc<SurfaceRegistry>,
    surface: Option<Arc<Surface>>,
}

pub(super) fn make_audio_src(shared: Arc<ElementShared>, ctx: &BuildCtx) -> Box<dyn Element> {
    Box::new(SurfaceAudioSrc {
        shared,
        surfaces: ctx.surfaces.clone(),
        surface: None,
    })
}

impl Element for SurfaceAudioSrc {
    fn prepare(&mut self) -> Result<(), ElementError> {
        self.surface = Some(self.surfaces.get(&channel_prop(&self.shared)?));
        Ok(())
    }

    fn run(&mut self, ctx: &mut RunCtx) -> Result<(), ElementError> {
        if !ctx.wait_playing() {
            return Ok(());
        }

        let caps = Caps::new("audio/x-raw")
            .with("format", CapsValue::Str("S16LE".into()))
            .with("rate", CapsValue::Int(48_000))
            .with("channels", CapsValue::Int(2));
        if !ctx.send(Item::Caps(caps)) {
            return Ok(());
        }

        let surface = self.surface.as_ref().unwrap();
        let silence = Bytes::from(vec![0u8; AUDIO_TICK_BYTES]);
        let tick_ns = AUDIO_TICK.as_nanos() as u64;
        let start = Instant::now();
        let mut n: u64 = 0;
        loop {
            if !ctx.wait_playing() {
                return Ok(());
            }
            if ctx.eos_requested() {
                ctx.send(Item::Eos);
                return Ok(());
            }

            // Only forward a packet the first reader tick after it was
            // published; in between, keep the clock running with silence.
            let payload = {
                let mut state = surface.lock();
                if state.audio_buffer.is_some() && state.audio_buffer_count == 0 {
                    state.audio_buffer_count += 1;
                    state.audio_buffer.as_ref().unwrap().payload.clone()
                } else {
                    silence.clone()
                }
            };

            if !ctx.send(Item::Buffer(Buffer::with_timing(
                payload,
                n * tick_ns,
                tick_ns,
            ))) {
                return Ok(());
            }

            n += 1;
            let target = Duration::from_nanos(n * tick_ns);
            let elapsed = start.elapsed();
            if elapsed < target {
                std::thread::sleep(target - elapsed);
            }
        }
    }
}
