// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;

use crate::format::{Caps, CapsValue};
use crate::pipeline::runtime::{BuildCtx, Element, ElementError, ElementShared, Item, RunCtx};

/// Stamps raw audio caps onto an unframed s16le stream and fills in packet
/// durations from the byte count.
struct AudioParse {
    rate: i64,
    channels: i64,
    format: String,
    sent_caps: bool,
}

pub(super) fn make_audioparse(shared: Arc<ElementShared>, _ctx: &BuildCtx) -> Box<dyn Element> {
    Box::new(AudioParse {
        rate: shared.prop_i64("rate").unwrap_or(48_000),
        channels: shared.prop_i64("channels").unwrap_or(2),
        format: shared
            .prop_str("raw-format")
            .unwrap_or_else(|| "s16le".into()),
        sent_caps: false,
    })
}

impl Element for AudioParse {
    fn run(&mut self, ctx: &mut RunCtx) -> Result<(), ElementError> {
        while let Some(item) = ctx.recv() {
            let ok = match item {
                // Our own caps replace whatever arrived upstream.
                Item::Caps(_) => true,
                Item::Buffer(buffer) => {
                    if !self.sent_caps {
                        let caps = Caps::new("audio/x-raw")
                            .with(
                                "format",
                                CapsValue::Str(self.format.to_ascii_uppercase()),
                            )
                            .with("rate", CapsValue::Int(self.rate as i32))
                            .with("channels", CapsValue::Int(self.channels as i32));
                        if !ctx.send(Item::Caps(caps)) {
                            return Ok(());
                        }
                        self.sent_caps = true;
                    }

                    let mut buffer = buffer;
                    if buffer.duration.is_none() {
                        let bytes_per_sec = (self.rate * self.channels * 2) as u64;
                        if bytes_per_sec > 0 {
                            buffer.duration = Some(
                                buffer.payload.len() as u64 * 1_000_000_000 / bytes_per_sec,
                            );
                        }
                    }

                    ctx.send(Item::Buffer(buffer))
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

