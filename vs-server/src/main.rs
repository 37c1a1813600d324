// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

mod case;
mod composite;
mod config;
mod events;
mod format;
mod pipeline;
mod recorder;
mod sched;
mod server;
mod surface;
mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{ServerConfig, SwitchOpts};
use crate::pipeline::Engine;
use crate::sched::Scheduler;
use crate::server::SwitchServer;
use crate::surface::SurfaceRegistry;

fn main() -> Result<()> {
    let opts = SwitchOpts::parse();

    init_logging(opts.verbose)?;
    debug!("starting up");

    let cfg = ServerConfig::from_opts(&opts).context("failed to read config")?;
    info!(
        video_caps = %cfg.video_caps,
        record = cfg.record_template.as_deref().unwrap_or("(off)"),
        "configured"
    );

    let sched = Scheduler::new();
    let surfaces = Arc::new(SurfaceRegistry::new());
    let engine = Engine::new(surfaces);

    let server = SwitchServer::new(cfg, engine, sched.handle());
    server.start().context("failed to start server")?;

    let (close_send, close_recv) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        debug!("received SIGINT");
        close_send.send(()).ok();
    })?;

    info!(
        video_port = server.cfg().video_input_port,
        audio_port = server.cfg().audio_input_port,
        controller = %server.cfg().controller_address,
        "serving"
    );

    close_recv.recv().ok();
    server.shut_down();
    sched.stop();

    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;

    let default_directive = if verbose {
        "vsserver=debug"
    } else {
        "vsserver=info"
    };

    let printed_log = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(default_directive.parse()?)
            .from_env_lossy(),
    );

    tracing_subscriber::registry().with(printed_log).init();

    Ok(())
}
