// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    Null,
    Ready,
    Paused,
    Playing,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineState::Null => "NULL",
            PipelineState::Ready => "READY",
            PipelineState::Paused => "PAUSED",
            PipelineState::Playing => "PLAYING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub enum BusMessage {
    Eos,
    Error {
        element: String,
        message: String,
        debug: String,
    },
    Warning {
        element: String,
        message: String,
    },
    Info {
        element: String,
        message: String,
    },
    Buffering {
        percent: i32,
    },
    StateChanged {
        old: PipelineState,
        new: PipelineState,
    },
}

pub type BusPoster = Arc<dyn Fn(BusMessage) + Send + Sync + 'static>;

/// The pipeline's message channel back to its owning worker. Messages are
/// dispatched asynchronously through the poster; EOS additionally fires a
/// synchronous hook on the posting thread, which is what unblocks a caller
/// sleeping in a clean shutdown.
pub struct Bus {
    poster: BusPoster,
    sync_eos: Mutex<Option<Arc<dyn Fn() + Send + Sync + 'static>>>,
    flushing: AtomicBool,
}

impl Bus {
    pub fn new(poster: BusPoster) -> Self {
        Self {
            poster,
            sync_eos: Mutex::new(None),
            flushing: AtomicBool::new(false),
        }
    }

    pub fn post(&self, msg: BusMessage) {
        if self.flushing.load(Ordering::SeqCst) {
            return;
        }

        if matches!(msg, BusMessage::Eos) {
            if let Some(hook) = self.sync_eos.lock().unwrap().clone() {
                hook();
            }
        }

        (self.poster)(msg);
    }

    /// While flushing, posted messages are discarded.
    pub fn set_flushing(&self, flushing: bool) {
        self.flushing.store(flushing, Ordering::SeqCst);
    }

    pub fn set_sync_eos(&self, hook: Arc<dyn Fn() + Send + Sync + 'static>) {
        *self.sync_eos.lock().unwrap() = Some(hook);
    }
}
