// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The recording container muxer. The format is a simple streamable
//! interleave: a header naming the writing application, then length-framed
//! track entries, with an index marker written at a fixed interval so a
//! reader can seek a partially written file.

use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, WriteBytesExt};
use bytes::Bytes;

use crate::format::Caps;
use crate::pipeline::runtime::{
    BuildCtx, Element, ElementError, ElementShared, Item, RecvStep, RunCtx,
};
use crate::pipeline::Buffer;

pub const MUX_MAGIC: &[u8; 4] = b"VSWR";
pub const MUX_VERSION: u8 = 1;

const TRACK_VIDEO: u8 = 0;
const TRACK_AUDIO: u8 = 1;
const ENTRY_CAPS_FLAG: u8 = 0x80;
const ENTRY_INDEX: u8 = 0xFE;

const NO_TS: u64 = u64::MAX;

struct RecMux {
    writing_app: String,
    index_interval: u64,
}

pub(super) fn make_recmux(shared: Arc<ElementShared>, _ctx: &BuildCtx) -> Box<dyn Element> {
    let index_interval =
        Duration::from_millis(shared.prop_i64("index-interval-ms").unwrap_or(1000).max(1) as u64);
    Box::new(RecMux {
        writing_app: shared.prop_str("writing-app").unwrap_or_default(),
        index_interval: index_interval.as_nanos() as u64,
    })
}

fn header_chunk(writing_app: &str) -> Bytes {
    let mut out = Vec::with_capacity(16 + writing_app.len());
    out.extend_from_slice(MUX_MAGIC);
    out.write_u8(MUX_VERSION).unwrap();
    out.write_u16::<BigEndian>(writing_app.len() as u16).unwrap();
    out.extend_from_slice(writing_app.as_bytes());
    Bytes::from(out)
}

fn entry_chunk(track: u8, pts: Option<u64>, duration: Option<u64>, payload: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(21 + payload.len());
    out.write_u8(track).unwrap();
    out.write_u64::<BigEndian>(pts.unwrap_or(NO_TS)).unwrap();
    out.write_u64::<BigEndian>(duration.unwrap_or(NO_TS)).unwrap();
    out.write_u32::<BigEndian>(payload.len() as u32).unwrap();
    out.extend_from_slice(payload);
    Bytes::from(out)
}

fn caps_chunk(track: u8, caps: &Caps) -> Bytes {
    entry_chunk(track | ENTRY_CAPS_FLAG, None, None, caps.to_string().as_bytes())
}

fn index_chunk(offset: u64, pts: u64) -> Bytes {
    let mut payload = Vec::with_capacity(8);
    payload.write_u64::<BigEndian>(offset).unwrap();
    entry_chunk(ENTRY_INDEX, Some(pts), None, &payload)
}

impl Element for RecMux {
    fn run(&mut self, ctx: &mut RunCtx) -> Result<(), ElementError> {
        let video_idx = ctx.input_index("video");
        let audio_idx = ctx.input_index("audio");

        if !ctx.send(Item::Buffer(Buffer::new(header_chunk(&self.writing_app)))) {
            return Ok(());
        }

        let mut written: u64 = 0;
        let mut next_index_pts: u64 = self.index_interval;
        let mut done = [video_idx.is_none(), audio_idx.is_none()];

        loop {
            if ctx.stopping() {
                return Ok(());
            }

            let mut progress = false;
            for (slot, (idx, track)) in [(video_idx, TRACK_VIDEO), (audio_idx, TRACK_AUDIO)]
                .into_iter()
                .enumerate()
            {
                let Some(idx) = idx else { continue };
                if done[slot] {
                    continue;
                }

                loop {
                    match ctx.try_recv_from(idx) {
                        RecvStep::Item(Item::Caps(caps)) => {
                            progress = true;
                            let chunk = caps_chunk(track, &caps);
                            written += chunk.len() as u64;
                            if !ctx.send(Item::Buffer(Buffer::new(chunk))) {
                                return Ok(());
                            }
                        }
                        RecvStep::Item(Item::Buffer(buffer)) => {
                            progress = true;
                            let buffer_pts = buffer.pts;
                            let chunk =
                                entry_chunk(track, buffer.pts, buffer.duration, &buffer.payload);
                            written += chunk.len() as u64;
                            if !ctx.send(Item::Buffer(Buffer {
                                payload: chunk,
                                ..buffer
                            })) {
                                return Ok(());
                            }

                            // Index off the video track's clock.
                            if track == TRACK_VIDEO {
                                if let Some(pts) = buffer_pts {
                                    if pts >= next_index_pts {
                                        let chunk = index_chunk(written, pts);
                                        written += chunk.len() as u64;
                                        if !ctx.send(Item::Buffer(Buffer::new(chunk))) {
                                            return Ok(());
                                        }
                                        next_index_pts = pts + self.index_interval;
                                    }
                                }
                            }
                        }
                        RecvStep::Item(Item::Eos) | RecvStep::Closed => {
                            done[slot] = true;
                            break;
                        }
                        RecvStep::Timeout => break,
                    }
                }
            }

            if done.iter().all(|d| *d) {
                ctx.send(Item::Eos);
                return Ok(());
            }

            if !progress {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_layout() {
        let header = header_chunk("gst-switch");
        assert_eq!(&header[..4], MUX_MAGIC);
        assert_eq!(header[4], MUX_VERSION);
        assert_eq!(&header[7..], b"gst-switch");

        let entry = entry_chunk(TRACK_VIDEO, Some(40), Some(40), b"frame");
        assert_eq!(entry[0], TRACK_VIDEO);
        assert_eq!(entry.len(), 21 + 5);
        // Length field sits after track + two timestamps.
        assert_eq!(&entry[17..21], &5u32.to_be_bytes());
    }
}
