// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Elements touching sockets and files: the input byte-stream source, the
//! wire framing pair, the TCP fanout sink and the file sink.

use std::fs::File;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use crate::pipeline::framing::{encode_packet, Depacketizer, WirePacket};
use crate::pipeline::runtime::{
    BuildCtx, Element, ElementError, ElementShared, Item, RecvStep, RunCtx,
};
use crate::pipeline::Buffer;

const READ_CHUNK: usize = 8192;
const SOCKET_TIMEOUT: Duration = Duration::from_millis(200);

/// Reads raw bytes from an installed TCP connection, which the server
/// accepted and handed over before starting the pipeline.
struct StreamSrc {
    shared: Arc<ElementShared>,
    stream: Option<TcpStream>,
}

pub(super) fn make_streamsrc(shared: Arc<ElementShared>, _ctx: &BuildCtx) -> Box<dyn Element> {
    Box::new(StreamSrc {
        shared,
        stream: None,
    })
}

impl Element for StreamSrc {
    fn prepare(&mut self) -> Result<(), ElementError> {
        let stream = self
            .shared
            .take_stream()
            .ok_or_else(|| ElementError::Failed("no stream installed".into()))?;
        stream.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn run(&mut self, ctx: &mut RunCtx) -> Result<(), ElementError> {
        let stream = self.stream.as_mut().unwrap();
        let mut buf = [0u8; READ_CHUNK];

        loop {
            if !ctx.wait_playing() {
                return Ok(());
            }
            if ctx.eos_requested() {
                ctx.send(Item::Eos);
                return Ok(());
            }

            match stream.read(&mut buf) {
                Ok(0) => {
                    ctx.send(Item::Eos);
                    return Ok(());
                }
                Ok(n) => {
                    if !ctx.send(Item::Buffer(Buffer::new(Bytes::copy_from_slice(&buf[..n])))) {
                        return Ok(());
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Parses the wire framing back into caps and timestamped buffers.
struct FrameDepay {
    depay: Depacketizer,
}

pub(super) fn make_framedepay(_shared: Arc<ElementShared>, _ctx: &BuildCtx) -> Box<dyn Element> {
    Box::new(FrameDepay {
        depay: Depacketizer::new(),
    })
}

impl Element for FrameDepay {
    fn run(&mut self, ctx: &mut RunCtx) -> Result<(), ElementError> {
        while let Some(item) = ctx.recv() {
            let raw = match item {
                Item::Buffer(b) => b,
                Item::Eos => {
                    ctx.send(Item::Eos);
                    return Ok(());
                }
                Item::Caps(_) => continue,
            };

            let packets = self
                .depay
                .push(&raw.payload)
                .map_err(|e| ElementError::Stream(e.to_string()))?;

            for packet in packets {
                let ok = match packet {
                    WirePacket::Caps(caps) => ctx.send(Item::Caps(caps)),
                    WirePacket::Buffer(buffer) => ctx.send(Item::Buffer(buffer)),
                    WirePacket::Eos => {
                        ctx.send(Item::Eos);
                        return Ok(());
                    }
                };
                if !ok {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

/// Serializes buffers into the wire framing. Caps ride alongside untouched
/// so the downstream TCP sink can replay them to late-joining clients.
struct FramePay;

pub(super) fn make_framepay(_shared: Arc<ElementShared>, _ctx: &BuildCtx) -> Box<dyn Element> {
    Box::new(FramePay)
}

impl Element for FramePay {
    fn run(&mut self, ctx: &mut RunCtx) -> Result<(), ElementError> {
        while let Some(item) = ctx.recv() {
            let ok = match item {
                Item::Caps(caps) => ctx.send(Item::Caps(caps)),
                Item::Buffer(buffer) => {
                    let payload = encode_packet(&WirePacket::Buffer(buffer.clone()));
                    ctx.send(Item::Buffer(Buffer {
                        pts: buffer.pts,
                        duration: buffer.duration,
                        payload,
                    }))
                }
                Item::Eos => {
                    ctx.send(Item::Buffer(Buffer::new(encode_packet(&WirePacket::Eos))));
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

/// Fans the byte stream out to any number of connected TCP clients. A
/// departing client's socket is closed here so descriptors don't leak, and
/// the removal callback fires for whoever is watching.
struct TcpServerSink {
    shared: Arc<ElementShared>,
    listener: Option<TcpListener>,
    clients: Vec<(SocketAddr, TcpStream)>,
    caps_packet: Option<Bytes>,
}

pub(super) fn make_tcpserversink(shared: Arc<ElementShared>, _ctx: &BuildCtx) -> Box<dyn Element> {
    Box::new(TcpServerSink {
        shared,
        listener: None,
        clients: Vec::new(),
        caps_packet: None,
    })
}

impl TcpServerSink {
    fn accept_pending(&mut self) {
        let listener = self.listener.as_ref().unwrap();
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    debug!(element = %self.shared.name, %addr, "client connected");
                    stream.set_nodelay(true).ok();
                    stream
                        .set_write_timeout(Some(Duration::from_millis(500)))
                        .ok();
                    let mut stream = stream;
                    if let Some(caps) = &self.caps_packet {
                        if stream.write_all(caps).is_err() {
                            continue;
                        }
                    }
                    self.clients.push((addr, stream));
                }
                Err(_) => return,
            }
        }
    }

    fn broadcast(&mut self, data: &[u8]) {
        let mut dropped = Vec::new();
        self.clients.retain_mut(|(addr, stream)| {
            if stream.write_all(data).is_ok() {
                true
            } else {
                dropped.push(*addr);
                false
            }
        });

        for addr in dropped {
            debug!(element = %self.shared.name, %addr, "client removed");
            if let Some(hook) = self.shared.client_removed_hook() {
                hook(addr);
            }
        }
    }
}

impl Element for TcpServerSink {
    fn prepare(&mut self) -> Result<(), ElementError> {
        let port = self
            .shared
            .prop_i64("port")
            .ok_or_else(|| ElementError::Failed("no port configured".into()))? as u16;

        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        info!(element = %self.shared.name, port, "serving");
        self.listener = Some(listener);
        Ok(())
    }

    fn run(&mut self, ctx: &mut RunCtx) -> Result<(), ElementError> {
        loop {
            self.accept_pending();

            match ctx.recv_step(0, SOCKET_TIMEOUT) {
                RecvStep::Item(Item::Caps(caps)) => {
                    let packet = encode_packet(&WirePacket::Caps(caps));
                    self.caps_packet = Some(packet.clone());
                    self.broadcast(&packet);
                }
                RecvStep::Item(Item::Buffer(buffer)) => self.broadcast(&buffer.payload),
                RecvStep::Item(Item::Eos) => {
                    ctx.sink_eos();
                    return Ok(());
                }
                RecvStep::Timeout => continue,
                RecvStep::Closed => return Ok(()),
            }
        }
    }

    fn release(&mut self) {
        self.clients.clear();
        self.listener = None;
    }
}

/// Writes payloads to the configured location.
struct FileSink {
    shared: Arc<ElementShared>,
    file: Option<File>,
}

pub(super) fn make_filesink(shared: Arc<ElementShared>, _ctx: &BuildCtx) -> Box<dyn Element> {
    Box::new(FileSink { shared, file: None })
}

impl Element for FileSink {
    fn prepare(&mut self) -> Result<(), ElementError> {
        let location = self
            .shared
            .prop_str("location")
            .ok_or_else(|| ElementError::Failed("no location configured".into()))?;

        info!(element = %self.shared.name, %location, "writing");
        self.file = Some(File::create(location)?);
        Ok(())
    }

    fn run(&mut self, ctx: &mut RunCtx) -> Result<(), ElementError> {
        let file = self.file.as_mut().unwrap();
        while let Some(item) = ctx.recv() {
            match item {
                Item::Buffer(buffer) => file.write_all(&buffer.payload)?,
                Item::Caps(_) => (),
                Item::Eos => {
                    file.flush()?;
                    ctx.sink_eos();
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut file) = self.file.take() {
            file.flush().ok();
        }
    }
}
