// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The application framing used on every TCP leg: a fixed header carrying
//! the packet kind, timestamps and payload length. Caps packets carry the
//! canonical caps string so a stream is self-describing.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use crate::format::Caps;
use crate::pipeline::Buffer;

pub const WIRE_MAGIC: u32 = 0x4753_5746; // "GSWF"
pub const NO_TIMESTAMP: u64 = u64::MAX;

const HEADER_LEN: usize = 4 + 1 + 8 + 8 + 4;
const MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

const KIND_CAPS: u8 = 1;
const KIND_BUFFER: u8 = 2;
const KIND_EOS: u8 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum WirePacket {
    Caps(Caps),
    Buffer(Buffer),
    Eos,
}

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("bad packet magic {0:#010x}")]
    BadMagic(u32),
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("oversized packet ({0} bytes)")]
    Oversized(u32),
    #[error("malformed caps payload: {0}")]
    BadCaps(String),
}

pub fn encode_packet(packet: &WirePacket) -> Bytes {
    let (kind, pts, duration, payload) = match packet {
        WirePacket::Caps(caps) => (
            KIND_CAPS,
            NO_TIMESTAMP,
            NO_TIMESTAMP,
            Bytes::from(caps.to_string().into_bytes()),
        ),
        WirePacket::Buffer(buffer) => (
            KIND_BUFFER,
            buffer.pts.unwrap_or(NO_TIMESTAMP),
            buffer.duration.unwrap_or(NO_TIMESTAMP),
            buffer.payload.clone(),
        ),
        WirePacket::Eos => (KIND_EOS, NO_TIMESTAMP, NO_TIMESTAMP, Bytes::new()),
    };

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.write_u32::<BigEndian>(WIRE_MAGIC).unwrap();
    out.write_u8(kind).unwrap();
    out.write_u64::<BigEndian>(pts).unwrap();
    out.write_u64::<BigEndian>(duration).unwrap();
    out.write_u32::<BigEndian>(payload.len() as u32).unwrap();
    out.extend_from_slice(&payload);

    Bytes::from(out)
}

/// Incremental packet parser; feed it reads of any size.
#[derive(Default)]
pub struct Depacketizer {
    acc: BytesMut,
}

impl Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) -> Result<Vec<WirePacket>, FramingError> {
        self.acc.extend_from_slice(data);

        let mut out = Vec::new();
        loop {
            if self.acc.len() < HEADER_LEN {
                return Ok(out);
            }

            let mut header = &self.acc[..HEADER_LEN];
            let magic = header.read_u32::<BigEndian>().unwrap();
            if magic != WIRE_MAGIC {
                return Err(FramingError::BadMagic(magic));
            }

            let kind = header.read_u8().unwrap();
            let pts = header.read_u64::<BigEndian>().unwrap();
            let duration = header.read_u64::<BigEndian>().unwrap();
            let len = header.read_u32::<BigEndian>().unwrap();
            if len > MAX_PAYLOAD {
                return Err(FramingError::Oversized(len));
            }

            if self.acc.len() < HEADER_LEN + len as usize {
                return Ok(out);
            }

            self.acc.advance(HEADER_LEN);
            let payload = self.acc.split_to(len as usize).freeze();

            match kind {
                KIND_CAPS => {
                    let s = String::from_utf8_lossy(&payload).into_owned();
                    let caps =
                        Caps::parse(&s).map_err(|e| FramingError::BadCaps(e.to_string()))?;
                    out.push(WirePacket::Caps(caps));
                }
                KIND_BUFFER => {
                    out.push(WirePacket::Buffer(Buffer {
                        pts: (pts != NO_TIMESTAMP).then_some(pts),
                        duration: (duration != NO_TIMESTAMP).then_some(duration),
                        payload,
                    }));
                }
                KIND_EOS => out.push(WirePacket::Eos),
                other => return Err(FramingError::UnknownKind(other)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_packet_roundtrip() {
        let caps = crate::format::parse_format("debug").unwrap();
        let buffer = Buffer::with_timing(Bytes::from(vec![0xAB; 100]), 40_000_000, 40_000_000);

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_packet(&WirePacket::Caps(caps.clone())));
        wire.extend_from_slice(&encode_packet(&WirePacket::Buffer(buffer.clone())));
        wire.extend_from_slice(&encode_packet(&WirePacket::Eos));

        // Feed it back a few bytes at a time to exercise partial reads.
        let mut depay = Depacketizer::new();
        let mut packets = Vec::new();
        for chunk in wire.chunks(7) {
            packets.extend(depay.push(chunk).unwrap());
        }

        assert_eq!(
            packets,
            vec![
                WirePacket::Caps(caps),
                WirePacket::Buffer(buffer),
                WirePacket::Eos
            ]
        );
    }

    #[test]
    fn test_bad_magic() {
        let mut depay = Depacketizer::new();
        let err = depay.push(&[0u8; 32]).unwrap_err();
        assert!(matches!(err, FramingError::BadMagic(0)));
    }

    #[test]
    fn test_untimestamped_buffer() {
        let buffer = Buffer::new(Bytes::from_static(b"payload"));
        let wire = encode_packet(&WirePacket::Buffer(buffer.clone()));

        let mut depay = Depacketizer::new();
        let packets = depay.push(&wire).unwrap();
        assert_eq!(packets, vec![WirePacket::Buffer(buffer)]);
    }
}
