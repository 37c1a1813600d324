// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The named buffer rendezvous connecting independently running pipelines.
//!
//! A writer pipeline publishes its latest frame to a surface; any number of
//! reader pipelines copy it out. Surfaces are created on first lookup and
//! live exactly as long as someone holds a reference.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use hashbrown::HashMap;

use crate::format::VideoInfo;
use crate::pipeline::Buffer;

#[derive(Default)]
pub struct SurfaceRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    map: Mutex<HashMap<String, Weak<Surface>>>,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the surface for `channel`, creating it if absent. Two
    /// concurrent lookups of the same name observe the same instance.
    pub fn get(&self, channel: &str) -> Arc<Surface> {
        let mut map = self.inner.map.lock().unwrap();
        if let Some(surface) = map.get(channel).and_then(Weak::upgrade) {
            return surface;
        }

        let surface = Arc::new(Surface {
            channel: channel.to_owned(),
            registry: Arc::downgrade(&self.inner),
            state: Mutex::new(SurfaceState::default()),
        });

        map.insert(channel.to_owned(), Arc::downgrade(&surface));
        surface
    }

    /// Number of live surfaces, for diagnostics.
    pub fn len(&self) -> usize {
        let map = self.inner.map.lock().unwrap();
        map.values().filter(|w| w.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Surface {
    channel: String,
    registry: Weak<RegistryInner>,
    state: Mutex<SurfaceState>,
}

#[derive(Default)]
pub struct SurfaceState {
    pub video_info: VideoInfo,
    pub video_buffer: Option<Buffer>,
    pub audio_buffer: Option<Buffer>,
    pub video_buffer_count: u64,
    pub audio_buffer_count: u64,
}

impl Surface {
    /// All field access goes through this lock.
    pub fn lock(&self) -> MutexGuard<'_, SurfaceState> {
        self.state.lock().unwrap()
    }

    /// Replaces the current video buffer, dropping the previous one, and
    /// resets the reader counter.
    pub fn publish_video(&self, buffer: Buffer) {
        let mut state = self.lock();
        state.video_buffer = Some(buffer);
        state.video_buffer_count = 0;
    }

    pub fn publish_audio(&self, buffer: Buffer) {
        let mut state = self.lock();
        state.audio_buffer = Some(buffer);
        state.audio_buffer_count = 0;
    }

    /// Copies out the current video buffer, if any, bumping the reader
    /// counter.
    pub fn take_video(&self) -> Option<Buffer> {
        let mut state = self.lock();
        state.video_buffer_count += 1;
        state.video_buffer.clone()
    }

    pub fn take_audio(&self) -> Option<Buffer> {
        let mut state = self.lock();
        state.audio_buffer_count += 1;
        state.audio_buffer.clone()
    }

    pub fn set_video_info(&self, info: VideoInfo) {
        self.lock().video_info = info;
    }

    pub fn video_info(&self) -> VideoInfo {
        self.lock().video_info.clone()
    }

    /// Called when the writer stops: both buffers are dropped and the video
    /// info is zeroed, so late readers see a channel with no caps.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.video_buffer = None;
        state.audio_buffer = None;
        state.video_info = VideoInfo::zeroed();
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };

        let mut map = registry.map.lock().unwrap();
        // A new surface may already have taken this name; only unlink a
        // dead entry.
        if let Some(entry) = map.get(&self.channel) {
            if entry.strong_count() == 0 {
                map.remove(&self.channel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn buf(tag: u8) -> Buffer {
        Buffer::with_timing(Bytes::from(vec![tag; 16]), tag as u64, 1)
    }

    #[test]
    fn test_get_returns_same_instance() {
        let registry = SurfaceRegistry::new();
        let a = registry.get("input_3000");
        let b = registry.get("input_3000");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_release_unlinks_and_recreates() {
        let registry = SurfaceRegistry::new();
        let a = registry.get("composite_a");
        a.publish_video(buf(1));

        drop(a);
        assert!(registry.is_empty());

        // A fresh lookup produces a different, empty surface.
        let b = registry.get("composite_a");
        assert!(b.take_video().is_none());
    }

    #[test]
    fn test_publish_take() {
        let registry = SurfaceRegistry::new();
        let surface = registry.get("input_1");

        assert!(surface.take_video().is_none());

        surface.publish_video(buf(1));
        assert_eq!(surface.take_video().unwrap().pts, Some(1));

        // A newer publish wins and resets the reader counter.
        surface.publish_video(buf(2));
        {
            let state = surface.lock();
            assert_eq!(state.video_buffer_count, 0);
        }
        assert_eq!(surface.take_video().unwrap().pts, Some(2));
        assert_eq!(surface.lock().video_buffer_count, 1);
    }

    #[test]
    fn test_clear_zeroes_state() {
        let registry = SurfaceRegistry::new();
        let surface = registry.get("input_1");

        surface.set_video_info(crate::format::VideoInfo {
            format: "I420".into(),
            width: 300,
            height: 200,
            fps: crate::format::Fraction::new(25, 1),
            par: crate::format::Fraction::new(1, 1),
        });
        surface.publish_video(buf(1));
        surface.publish_audio(buf(2));

        surface.clear();
        assert!(surface.take_audio().is_none());
        let state = surface.lock();
        assert!(state.video_buffer.is_none());
        assert!(state.video_info.is_zeroed());
    }

    #[test]
    fn test_shared_between_writer_and_reader() {
        let registry = Arc::new(SurfaceRegistry::new());
        let writer = registry.get("branch_9");
        let reader = registry.get("branch_9");

        let registry_clone = registry.clone();
        let handle = std::thread::spawn(move || {
            let surface = registry_clone.get("branch_9");
            surface.publish_video(buf(7));
        });
        handle.join().unwrap();

        assert_eq!(reader.take_video().unwrap().pts, Some(7));
        drop(writer);
        // Still alive through the reader.
        assert_eq!(registry.len(), 1);
    }
}
