// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use bytes::Bytes;

/// A timestamped media frame. The payload is cheaply cloneable and treated
/// as immutable once published; modifying pixel data requires building a
/// new buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    pub pts: Option<u64>,
    pub duration: Option<u64>,
    pub payload: Bytes,
}

impl Buffer {
    pub fn new(payload: Bytes) -> Self {
        Self {
            pts: None,
            duration: None,
            payload,
        }
    }

    pub fn with_timing(payload: Bytes, pts: u64, duration: u64) -> Self {
        Self {
            pts: Some(pts),
            duration: Some(duration),
            payload,
        }
    }
}
