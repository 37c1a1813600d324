// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Video path elements: caps enforcement, rescaling, the two-input
//! compositor and the frame encoder.

use std::sync::Arc;

use bytes::Bytes;

use crate::format::{Caps, CapsValue, Fraction, VideoInfo};
use crate::pipeline::runtime::{
    BuildCtx, Element, ElementError, ElementShared, Item, RecvStep, RunCtx,
};
use crate::pipeline::Buffer;

pub(super) fn i420_frame_size(width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    let chroma = ((w + 1) / 2) * ((h + 1) / 2);
    w * h + 2 * chroma
}

pub(super) fn i420_black(width: u32, height: u32) -> Bytes {
    let (w, h) = (width as usize, height as usize);
    let luma = w * h;
    let mut data = vec![0x80u8; i420_frame_size(width, height)];
    data[..luma].fill(0x10);
    Bytes::from(data)
}

fn plane_offsets(w: usize, h: usize) -> (usize, usize, usize, usize) {
    let cw = (w + 1) / 2;
    let ch = (h + 1) / 2;
    (w * h, cw * ch, cw, ch)
}

fn scale_plane(src: &[u8], sw: usize, sh: usize, dst: &mut [u8], dw: usize, dh: usize) {
    for y in 0..dh {
        let sy = (y * sh / dh).min(sh.saturating_sub(1));
        let src_row = &src[sy * sw..sy * sw + sw];
        let dst_row = &mut dst[y * dw..y * dw + dw];
        for (x, out) in dst_row.iter_mut().enumerate() {
            *out = src_row[(x * sw / dw).min(sw - 1)];
        }
    }
}

/// Nearest-neighbour I420 rescale.
pub(super) fn scale_i420(src: &[u8], sw: u32, sh: u32, dw: u32, dh: u32) -> Bytes {
    let (sw, sh, dw, dh) = (sw as usize, sh as usize, dw as usize, dh as usize);
    let (s_luma, s_chroma, scw, sch) = plane_offsets(sw, sh);
    let (d_luma, d_chroma, dcw, dch) = plane_offsets(dw, dh);

    let mut out = vec![0u8; d_luma + 2 * d_chroma];
    scale_plane(&src[..s_luma], sw, sh, &mut out[..d_luma], dw, dh);
    scale_plane(
        &src[s_luma..s_luma + s_chroma],
        scw,
        sch,
        &mut out[d_luma..d_luma + d_chroma],
        dcw,
        dch,
    );
    scale_plane(
        &src[s_luma + s_chroma..],
        scw,
        sch,
        &mut out[d_luma + d_chroma..],
        dcw,
        dch,
    );

    Bytes::from(out)
}

fn blit_plane(
    dst: &mut [u8],
    dw: usize,
    dh: usize,
    src: &[u8],
    sw: usize,
    sh: usize,
    x: usize,
    y: usize,
) {
    if x >= dw || y >= dh {
        return;
    }
    let cols = sw.min(dw - x);
    let rows = sh.min(dh - y);
    for row in 0..rows {
        let d = (y + row) * dw + x;
        let s = row * sw;
        dst[d..d + cols].copy_from_slice(&src[s..s + cols]);
    }
}

/// Copies an I420 frame into the canvas at (x, y), clipped. Positions are
/// forced even to keep the chroma planes aligned.
pub(super) fn blit_i420(
    dst: &mut [u8],
    dw: u32,
    dh: u32,
    src: &[u8],
    sw: u32,
    sh: u32,
    x: u32,
    y: u32,
) {
    let (dw, dh, sw, sh) = (dw as usize, dh as usize, sw as usize, sh as usize);
    let x = (x as usize) & !1;
    let y = (y as usize) & !1;

    let (d_luma, d_chroma, dcw, dch) = plane_offsets(dw, dh);
    let (s_luma, s_chroma, scw, sch) = plane_offsets(sw, sh);

    blit_plane(&mut dst[..d_luma], dw, dh, &src[..s_luma], sw, sh, x, y);
    blit_plane(
        &mut dst[d_luma..d_luma + d_chroma],
        dcw,
        dch,
        &src[s_luma..s_luma + s_chroma],
        scw,
        sch,
        x / 2,
        y / 2,
    );
    blit_plane(
        &mut dst[d_luma + d_chroma..],
        dcw,
        dch,
        &src[s_luma + s_chroma..],
        scw,
        sch,
        x / 2,
        y / 2,
    );
}

/// Enforces a caps constraint on the stream; incompatible upstream caps
/// are a negotiation error.
struct CapsFilter {
    filter: Caps,
}

pub(super) fn make_capsfilter(shared: Arc<ElementShared>, _ctx: &BuildCtx) -> Box<dyn Element> {
    let filter = shared
        .prop_caps("caps")
        .unwrap_or_else(|| Caps::new("video/x-raw"));
    Box::new(CapsFilter { filter })
}

impl Element for CapsFilter {
    fn run(&mut self, ctx: &mut RunCtx) -> Result<(), ElementError> {
        while let Some(item) = ctx.recv() {
            let ok = match item {
                Item::Caps(caps) => {
                    let merged = caps.intersect(&self.filter).ok_or_else(|| {
                        ElementError::Negotiation(format!(
                            "caps {} do not satisfy {}",
                            caps, self.filter
                        ))
                    })?;
                    ctx.send(Item::Caps(merged))
                }
                Item::Buffer(buffer) => ctx.send(Item::Buffer(buffer)),
                Item::Eos => {
                    ctx.send(Item::Eos);
                    return Ok(());
                }
            };
            if !ok {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Rescales to the size the downstream capsfilter asks for.
struct VideoScale {
    target: Option<(u32, u32)>,
    in_info: Option<VideoInfo>,
    warned_no_caps: bool,
}

pub(super) fn make_videoscale(_shared: Arc<ElementShared>, ctx: &BuildCtx) -> Box<dyn Element> {
    let target = ctx.caps_hint.as_ref().and_then(|caps| {
        Some((
            caps.get_int("width")? as u32,
            caps.get_int("height")? as u32,
        ))
    });
    Box::new(VideoScale {
        target,
        in_info: None,
        warned_no_caps: false,
    })
}

impl Element for VideoScale {
    fn run(&mut self, ctx: &mut RunCtx) -> Result<(), ElementError> {
        while let Some(item) = ctx.recv() {
            let ok = match item {
                Item::Caps(caps) => {
                    let info = VideoInfo::from_caps(&caps).ok_or_else(|| {
                        ElementError::Negotiation(format!("not video caps: {}", caps))
                    })?;
                    let (dw, dh) = self.target.unwrap_or((info.width, info.height));
                    self.in_info = Some(info);

                    let caps = caps
                        .clone()
                        .with("width", CapsValue::Int(dw as i32))
                        .with("height", CapsValue::Int(dh as i32));
                    ctx.send(Item::Caps(caps))
                }
                Item::Buffer(buffer) => match (&self.in_info, self.target) {
                    (Some(info), Some((dw, dh)))
                        if (info.width, info.height) != (dw, dh)
                            && buffer.payload.len()
                                == i420_frame_size(info.width, info.height) =>
                    {
                        let scaled = scale_i420(&buffer.payload, info.width, info.height, dw, dh);
                        ctx.send(Item::Buffer(Buffer {
                            payload: scaled,
                            ..buffer
                        }))
                    }
                    (Some(_), _) => ctx.send(Item::Buffer(buffer)),
                    // No caps yet; nothing sensible to do with the frame.
                    (None, _) => {
                        if !self.warned_no_caps {
                            ctx.post_warning("dropping frames received before caps");
                            self.warned_no_caps = true;
                        }
                        true
                    }
                },
                Item::Eos => {
                    ctx.send(Item::Eos);
                    return Ok(());
                }
            };
            if !ok {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Two-input compositor. Output is driven by sink_0; sink_1's latest frame
/// is overlaid at its pad's live xpos/ypos, higher zorder on top.
struct VideoMix {
    shared: Arc<ElementShared>,
    canvas: Option<(u32, u32)>,
}

pub(super) fn make_videomix(shared: Arc<ElementShared>, ctx: &BuildCtx) -> Box<dyn Element> {
    let canvas = ctx.caps_hint.as_ref().and_then(|caps| {
        Some((
            caps.get_int("width")? as u32,
            caps.get_int("height")? as u32,
        ))
    });
    Box::new(VideoMix { shared, canvas })
}

impl VideoMix {
    fn pad_pos(&self, pad: &str) -> (u32, u32, i64) {
        let x = self.shared.pad_prop_i64(pad, "xpos").unwrap_or(0).max(0) as u32;
        let y = self.shared.pad_prop_i64(pad, "ypos").unwrap_or(0).max(0) as u32;
        let z = self.shared.pad_prop_i64(pad, "zorder").unwrap_or(0);
        (x, y, z)
    }
}

impl Element for VideoMix {
    fn run(&mut self, ctx: &mut RunCtx) -> Result<(), ElementError> {
        let a_idx = ctx.input_index("sink_0").unwrap_or(0);
        let b_idx = ctx.input_index("sink_1");

        let mut a_info: Option<VideoInfo> = None;
        let mut b_info: Option<VideoInfo> = None;
        let mut last_b: Option<Bytes> = None;
        let mut sent_caps = false;

        loop {
            let item = match ctx.recv_from(a_idx) {
                Some(item) => item,
                None => return Ok(()),
            };

            match item {
                Item::Caps(caps) => {
                    a_info = VideoInfo::from_caps(&caps);
                }
                Item::Eos => {
                    ctx.send(Item::Eos);
                    return Ok(());
                }
                Item::Buffer(frame) => {
                    if let Some(b_idx) = b_idx {
                        loop {
                            match ctx.try_recv_from(b_idx) {
                                RecvStep::Item(Item::Caps(caps)) => {
                                    b_info = VideoInfo::from_caps(&caps)
                                }
                                RecvStep::Item(Item::Buffer(b)) => last_b = Some(b.payload),
                                RecvStep::Item(Item::Eos) => last_b = None,
                                RecvStep::Timeout | RecvStep::Closed => break,
                            }
                        }
                    }

                    let Some(a) = &a_info else { continue };
                    let (cw, ch) = self.canvas.unwrap_or((a.width, a.height));

                    if !sent_caps {
                        let caps = Caps::new("video/x-raw")
                            .with("format", CapsValue::Str("I420".into()))
                            .with("width", CapsValue::Int(cw as i32))
                            .with("height", CapsValue::Int(ch as i32))
                            .with("framerate", CapsValue::Fraction(a.fps))
                            .with(
                                "pixel-aspect-ratio",
                                CapsValue::Fraction(Fraction::new(1, 1)),
                            );
                        if !ctx.send(Item::Caps(caps)) {
                            return Ok(());
                        }
                        sent_caps = true;
                    }

                    let mut canvas = i420_black(cw, ch).to_vec();

                    let mut layers = Vec::new();
                    if frame.payload.len() == i420_frame_size(a.width, a.height) {
                        let (x, y, z) = self.pad_pos("sink_0");
                        layers.push((z, a.width, a.height, frame.payload.clone(), x, y));
                    }
                    if let (Some(b), Some(payload)) = (&b_info, &last_b) {
                        if payload.len() == i420_frame_size(b.width, b.height) {
                            let (x, y, z) = self.pad_pos("sink_1");
                            layers.push((z, b.width, b.height, payload.clone(), x, y));
                        }
                    }
                    layers.sort_by_key(|l| l.0);

                    for (_, w, h, payload, x, y) in layers {
                        blit_i420(&mut canvas, cw, ch, &payload, w, h, x, y);
                    }

                    if !ctx.send(Item::Buffer(Buffer {
                        payload: Bytes::from(canvas),
                        ..frame
                    })) {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Per-frame JPEG encoding, leaning on the image crate.
struct JpegEnc {
    quality: u8,
    in_info: Option<VideoInfo>,
    sent_caps: bool,
}

pub(super) fn make_jpegenc(shared: Arc<ElementShared>, _ctx: &BuildCtx) -> Box<dyn Element> {
    let quality = shared.prop_i64("quality").unwrap_or(85).clamp(1, 100) as u8;
    Box::new(JpegEnc {
        quality,
        in_info: None,
        sent_caps: false,
    })
}

fn i420_to_rgb(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (luma, chroma, cw, _) = plane_offsets(w, h);
    let u_plane = &data[luma..luma + chroma];
    let v_plane = &data[luma + chroma..];

    let mut rgb = Vec::with_capacity(w * h * 3);
    for y in 0..h {
        for x in 0..w {
            let l = data[y * w + x] as i32;
            let u = u_plane[(y / 2) * cw + x / 2] as i32 - 128;
            let v = v_plane[(y / 2) * cw + x / 2] as i32 - 128;

            let r = l + ((91_881 * v) >> 16);
            let g = l - ((22_554 * u + 46_802 * v) >> 16);
            let b = l + ((116_130 * u) >> 16);
            rgb.push(r.clamp(0, 255) as u8);
            rgb.push(g.clamp(0, 255) as u8);
            rgb.push(b.clamp(0, 255) as u8);
        }
    }
    rgb
}

impl Element for JpegEnc {
    fn run(&mut self, ctx: &mut RunCtx) -> Result<(), ElementError> {
        while let Some(item) = ctx.recv() {
            let ok = match item {
                Item::Caps(caps) => {
                    self.in_info = VideoInfo::from_caps(&caps);
                    true
                }
                Item::Buffer(buffer) => {
                    let Some(info) = &self.in_info else {
                        continue;
                    };
                    if buffer.payload.len() != i420_frame_size(info.width, info.height) {
                        continue;
                    }

                    if !self.sent_caps {
                        let caps = Caps::new("image/jpeg")
                            .with("width", CapsValue::Int(info.width as i32))
                            .with("height", CapsValue::Int(info.height as i32))
                            .with("framerate", CapsValue::Fraction(info.fps));
                        if !ctx.send(Item::Caps(caps)) {
                            return Ok(());
                        }
                        self.sent_caps = true;
                    }

                    let rgb = i420_to_rgb(&buffer.payload, info.width, info.height);
                    let mut encoded = Vec::new();
                    image::codecs::jpeg::JpegEncoder::new_with_quality(
                        &mut encoded,
                        self.quality,
                    )
                    .encode(
                        &rgb,
                        info.width,
                        info.height,
                        image::ExtendedColorType::Rgb8,
                    )
                    .map_err(|e| ElementError::Failed(format!("jpeg encode: {}", e)))?;

                    ctx.send(Item::Buffer(Buffer {
                        payload: Bytes::from(encoded),
                        ..buffer
                    }))
                }
                Item::Eos => {
                    ctx.send(Item::Eos);
                    return Ok(());
                }
            };
            if !ok {
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i420_sizes() {
        assert_eq!(i420_frame_size(4, 4), 16 + 2 * 4);
        // Odd dimensions round the chroma planes up.
        assert_eq!(i420_frame_size(5, 3), 15 + 2 * (3 * 2));
        assert_eq!(i420_black(4, 2).len(), 8 + 2 * 2);
    }

    #[test]
    fn test_scale_i420() {
        let src = i420_black(4, 4);
        let out = scale_i420(&src, 4, 4, 8, 2);
        assert_eq!(out.len(), i420_frame_size(8, 2));
        assert_eq!(out[0], 0x10);
        assert_eq!(out[8 * 2], 0x80);
    }

    #[test]
    fn test_blit_clips_to_canvas() {
        let mut canvas = i420_black(8, 8).to_vec();
        let patch = Bytes::from(vec![0xFFu8; i420_frame_size(4, 4)]);

        blit_i420(&mut canvas, 8, 8, &patch, 4, 4, 6, 6);

        // Only the 2x2 corner fits.
        assert_eq!(canvas[6 * 8 + 6], 0xFF);
        assert_eq!(canvas[6 * 8 + 5], 0x10);
        assert_eq!(canvas[5 * 8 + 6], 0x10);
    }

    #[test]
    fn test_blit_even_alignment() {
        let mut canvas = i420_black(8, 8).to_vec();
        let patch = Bytes::from(vec![0xFFu8; i420_frame_size(2, 2)]);

        // Odd positions snap down.
        blit_i420(&mut canvas, 8, 8, &patch, 2, 2, 3, 5);
        assert_eq!(canvas[4 * 8 + 2], 0xFF);
    }
}
