// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The UI control channel: newline-delimited JSON requests over TCP, one
//! reply per request. The marshalling stays thin; every operation maps
//! straight onto a server method.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::sync::{atomic::Ordering, Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use mio::unix::SourceFd;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::case::{CaseType, ServeType};
use crate::composite::CompositeMode;
use crate::server::SwitchServer;

const ACCEPT: mio::Token = mio::Token(0);
const WAKER: mio::Token = mio::Token(1);

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    GetComposePort,
    GetEncodePort,
    GetAudioPort,
    GetPreviewPorts,
    GetCompositeMode,
    SetCompositeMode { mode: CompositeMode },
    Switch { channel: char, port: u16 },
    AdjustPip { dx: i32, dy: i32, dw: i32, dh: i32 },
    ClickVideo { x: i32, y: i32, fw: u32, fh: u32 },
    NewRecord,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlReply {
    Port { port: u16 },
    PreviewPorts { ports: Vec<PreviewPort> },
    Mode { mode: CompositeMode },
    Ok { ok: bool },
    Adjusted { mask: u32 },
    Error { message: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PreviewPort {
    pub port: u16,
    pub serve: ServeType,
    pub case: CaseType,
}

pub fn dispatch(server: &SwitchServer, request: ControlRequest) -> ControlReply {
    match request {
        ControlRequest::GetComposePort => ControlReply::Port {
            port: server.compose_port(),
        },
        ControlRequest::GetEncodePort => ControlReply::Port {
            port: server.encode_port(),
        },
        ControlRequest::GetAudioPort => ControlReply::Port {
            port: server.audio_port(),
        },
        ControlRequest::GetPreviewPorts => ControlReply::PreviewPorts {
            ports: server
                .preview_ports()
                .into_iter()
                .map(|(port, serve, case)| PreviewPort { port, serve, case })
                .collect(),
        },
        ControlRequest::GetCompositeMode => ControlReply::Mode {
            mode: server.composite_mode(),
        },
        ControlRequest::SetCompositeMode { mode } => ControlReply::Ok {
            ok: server.set_composite_mode(mode),
        },
        ControlRequest::Switch { channel, port } => ControlReply::Ok {
            ok: server.switch(channel, port),
        },
        ControlRequest::AdjustPip { dx, dy, dw, dh } => ControlReply::Adjusted {
            mask: server.adjust_pip(dx, dy, dw, dh),
        },
        ControlRequest::ClickVideo { x, y, fw, fh } => ControlReply::Ok {
            ok: server.click_video(x, y, fw, fh),
        },
        ControlRequest::NewRecord => ControlReply::Ok {
            ok: server.new_record(),
        },
    }
}

/// Accepts UI connections on the controller address and answers requests
/// until the server shuts down.
pub fn spawn(server: &Arc<SwitchServer>) -> anyhow::Result<std::thread::JoinHandle<()>> {
    let address = server.cfg().controller_address.clone();
    let listener = std::net::TcpListener::bind(&address)
        .with_context(|| format!("binding controller address {}", address))?;
    listener.set_nonblocking(true)?;

    let poll = mio::Poll::new()?;
    let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER)?);
    poll.registry().register(
        &mut SourceFd(&listener.as_raw_fd()),
        ACCEPT,
        mio::Interest::READABLE,
    )?;
    server.register_waker(waker);

    info!(%address, "controller listening");

    let weak = Arc::downgrade(server);
    let handle = std::thread::Builder::new()
        .name("controller".into())
        .spawn(move || {
            let mut poll = poll;
            let mut events = mio::Events::with_capacity(8);
            loop {
                let Some(server) = weak.upgrade() else { return };
                if server.is_shutting_down() {
                    return;
                }
                drop(server);

                poll.poll(&mut events, Some(Duration::from_millis(500))).ok();

                loop {
                    match listener.accept() {
                        Ok((stream, addr)) => {
                            info!(%addr, "controller connected");
                            spawn_client(weak.clone(), stream);
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            warn!("controller accept failed: {}", e);
                            break;
                        }
                    }
                }
            }
        })?;

    Ok(handle)
}

fn spawn_client(server: Weak<SwitchServer>, stream: TcpStream) {
    std::thread::Builder::new()
        .name("controller-client".into())
        .spawn(move || {
            if let Err(e) = client_loop(server, stream) {
                debug!("controller client ended: {:#}", e);
            }
        })
        .ok();
}

fn client_loop(server: Weak<SwitchServer>, stream: TcpStream) -> anyhow::Result<()> {
    stream.set_read_timeout(Some(Duration::from_millis(500)))?;
    stream.set_nodelay(true).ok();

    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        let Some(server) = server.upgrade() else {
            return Ok(());
        };
        if server.is_shutting_down() {
            return Ok(());
        }

        match reader.read_line(&mut line) {
            Ok(0) => return Ok(()),
            Ok(_) => {
                let reply = match serde_json::from_str::<ControlRequest>(line.trim()) {
                    Ok(request) => {
                        debug!(?request, "control request");
                        dispatch(&server, request)
                    }
                    Err(e) => ControlReply::Error {
                        message: format!("bad request: {}", e),
                    },
                };
                line.clear();

                let mut out = serde_json::to_vec(&reply)?;
                out.push(b'\n');
                writer.write_all(&out)?;
            }
            // A timeout mid-line leaves the partial read in the buffer.
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_wire_format() {
        let request: ControlRequest =
            serde_json::from_str(r#"{"op":"switch","channel":"A","port":3010}"#).unwrap();
        assert!(matches!(
            request,
            ControlRequest::Switch {
                channel: 'A',
                port: 3010
            }
        ));

        let request: ControlRequest =
            serde_json::from_str(r#"{"op":"set_composite_mode","mode":"pip"}"#).unwrap();
        assert!(matches!(
            request,
            ControlRequest::SetCompositeMode {
                mode: CompositeMode::Pip
            }
        ));

        let request: ControlRequest = serde_json::from_str(r#"{"op":"get_compose_port"}"#).unwrap();
        assert!(matches!(request, ControlRequest::GetComposePort));
    }

    #[test]
    fn test_reply_wire_format() {
        let reply = ControlReply::Port { port: 3001 };
        assert_eq!(
            serde_json::to_string(&reply).unwrap(),
            r#"{"result":"port","port":3001}"#
        );

        let reply = ControlReply::PreviewPorts {
            ports: vec![PreviewPort {
                port: 3010,
                serve: ServeType::VideoStream,
                case: CaseType::Preview,
            }],
        };
        let encoded = serde_json::to_string(&reply).unwrap();
        assert!(encoded.contains(r#""serve":"video_stream""#));
        assert!(encoded.contains(r#""case":"preview""#));
    }
}
