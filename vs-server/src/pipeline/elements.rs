// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The element set the runtime knows how to instantiate.

mod audio;
mod net;
mod record;
mod surface;
mod video;

use std::sync::Arc;

use crate::pipeline::runtime::{
    BuildCtx, Element, ElementError, ElementRegistry, ElementShared, Item, RunCtx,
};

pub fn register_standard(registry: &mut ElementRegistry) {
    registry.register("streamsrc", net::make_streamsrc);
    registry.register("framedepay", net::make_framedepay);
    registry.register("framepay", net::make_framepay);
    registry.register("tcpserversink", net::make_tcpserversink);
    registry.register("filesink", net::make_filesink);

    registry.register("surfacevideosink", surface::make_video_sink);
    registry.register("surfacevideosrc", surface::make_video_src);
    registry.register("surfaceaudiosink", surface::make_audio_sink);
    registry.register("surfaceaudiosrc", surface::make_audio_src);

    registry.register("capsfilter", video::make_capsfilter);
    registry.register("videoscale", video::make_videoscale);
    registry.register("videomix", video::make_videomix);
    registry.register("jpegenc", video::make_jpegenc);

    registry.register("audioparse", audio::make_audioparse);

    registry.register("recmux", record::make_recmux);

    registry.register("tee", make_passthrough);
    registry.register("queue", make_passthrough);
    registry.register("identity", make_passthrough);
}

/// tee/queue/identity: forward everything to every output. Fanout happens
/// in the send path, so one implementation covers all three.
struct Passthrough;

impl Element for Passthrough {
    fn run(&mut self, ctx: &mut RunCtx) -> Result<(), ElementError> {
        while let Some(item) = ctx.recv() {
            let eos = matches!(item, Item::Eos);
            if !ctx.send(item) || eos {
                break;
            }
        }
        Ok(())
    }
}

fn make_passthrough(_shared: Arc<ElementShared>, _ctx: &BuildCtx) -> Box<dyn Element> {
    Box::new(Passthrough)
}
