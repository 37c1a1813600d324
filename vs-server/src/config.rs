// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;

use crate::format::{parse_format, Caps, CapsValue, VideoInfo};

const DEFAULT_VIDEO_FORMAT: &str = "1280x720@25";

#[derive(Debug, Parser)]
#[command(name = "vsserver")]
#[command(about = "Live video/audio mixing server", long_about = None)]
pub struct SwitchOpts {
    /// Record the composite to this strftime-style filename template.
    #[arg(long, value_name = "TEMPLATE")]
    pub record: Option<String>,

    /// Address the UI control channel binds to.
    #[arg(long, value_name = "HOST:PORT", default_value = "127.0.0.1:5000")]
    pub controller_address: String,

    /// TCP port accepting video input streams.
    #[arg(long, value_name = "PORT", default_value_t = 3000)]
    pub video_input_port: u16,

    /// TCP port accepting audio input streams.
    #[arg(long, value_name = "PORT", default_value_t = 4000)]
    pub audio_input_port: u16,

    /// Video format, either full caps or the short WxH@R form (e.g.
    /// 720p60, VGA@75, 300x200@25).
    #[arg(long, value_name = "FORMAT")]
    pub video_caps: Option<String>,

    /// Shorthand for --video-caps debug.
    #[arg(long)]
    pub low_res: bool,

    /// Log at debug level.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Validated process-wide configuration, built once at startup and shared
/// by reference.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub video_caps: Caps,
    pub video_info: VideoInfo,
    pub audio_caps: Caps,
    pub record_template: Option<String>,
    pub controller_address: String,
    pub video_input_port: u16,
    pub audio_input_port: u16,
    pub verbose: bool,
}

impl ServerConfig {
    pub fn from_opts(opts: &SwitchOpts) -> anyhow::Result<Arc<Self>> {
        let format = match (&opts.video_caps, opts.low_res) {
            (Some(format), _) => format.as_str(),
            (None, true) => "debug",
            (None, false) => DEFAULT_VIDEO_FORMAT,
        };

        let video_caps = parse_format(format).context("invalid --video-caps")?;
        let video_info = VideoInfo::from_caps(&video_caps)
            .ok_or_else(|| anyhow!("video caps carry no geometry: {}", video_caps))?;

        Ok(Arc::new(Self {
            video_caps,
            video_info,
            audio_caps: default_audio_caps(),
            record_template: opts.record.clone(),
            controller_address: opts.controller_address.clone(),
            video_input_port: opts.video_input_port,
            audio_input_port: opts.audio_input_port,
            verbose: opts.verbose,
        }))
    }

    /// Canvas dimensions come from the configured caps.
    pub fn default_width(&self) -> u32 {
        self.video_info.width
    }

    pub fn default_height(&self) -> u32 {
        self.video_info.height
    }
}

pub fn default_audio_caps() -> Caps {
    Caps::new("audio/x-raw")
        .with("format", CapsValue::Str("S16LE".into()))
        .with("rate", CapsValue::Int(48_000))
        .with("channels", CapsValue::Int(2))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(args: &[&str]) -> SwitchOpts {
        SwitchOpts::parse_from(std::iter::once("vsserver").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let cfg = ServerConfig::from_opts(&opts(&[])).unwrap();
        assert_eq!(cfg.default_width(), 1280);
        assert_eq!(cfg.default_height(), 720);
        assert_eq!(cfg.video_input_port, 3000);
        assert_eq!(cfg.audio_input_port, 4000);
        assert_eq!(cfg.controller_address, "127.0.0.1:5000");
        assert!(cfg.record_template.is_none());
    }

    #[test]
    fn test_low_res() {
        let cfg = ServerConfig::from_opts(&opts(&["--low-res"])).unwrap();
        assert_eq!(cfg.default_width(), 300);
        assert_eq!(cfg.default_height(), 200);
    }

    #[test]
    fn test_explicit_caps_win() {
        let cfg =
            ServerConfig::from_opts(&opts(&["--low-res", "--video-caps", "720p60"])).unwrap();
        assert_eq!(cfg.default_width(), 1280);
    }

    #[test]
    fn test_bad_caps_fatal() {
        assert!(ServerConfig::from_opts(&opts(&["--video-caps", "720p@75"])).is_err());
    }
}
