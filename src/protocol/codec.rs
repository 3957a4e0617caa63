//! Frame codecs for the ring's command protocol.
//!
//! Callers only see [`PacketCodec`]; which framing is in use is picked once from
//! [`CodecVersion`] when the session is built.
//!
//! `colmi-v1` frames are always 16 bytes:
//!
//! ```text
//! [0]     : command
//! [1-14]  : payload, zero padded
//! [15]    : checksum, sum of bytes 0-14 modulo 256
//! ```
//!
//! `raw` frames are the command byte followed by the payload, with no padding or checksum.

use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, EncodeError};

/// Total length of a `colmi-v1` frame.
pub const FRAME_LEN: usize = 16;

/// Payload bytes available in a frame (command and checksum excluded).
pub const FRAME_PAYLOAD_LEN: usize = FRAME_LEN - 2;

/// One command-tagged frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodecVersion {
    #[default]
    ColmiV1,
    Raw,
}

impl CodecVersion {
    pub fn codec(self) -> Box<dyn PacketCodec> {
        match self {
            CodecVersion::ColmiV1 => Box::new(FramedCodec),
            CodecVersion::Raw => Box::new(RawCodec),
        }
    }
}

pub trait PacketCodec: Send {
    fn version(&self) -> CodecVersion;

    /// Largest payload that can be sent with `command`.
    fn max_payload(&self, _command: u8) -> usize {
        FRAME_PAYLOAD_LEN
    }

    /// Shortest buffer that can decode to any packet.
    fn min_frame_len(&self) -> usize;

    fn encode(&self, command: u8, payload: &[u8]) -> Result<Vec<u8>, EncodeError>;

    fn decode(&self, bytes: &[u8]) -> Result<Packet, DecodeError>;
}

fn check_payload(codec: &dyn PacketCodec, command: u8, payload: &[u8]) -> Result<(), EncodeError> {
    let max = codec.max_payload(command);
    if payload.len() > max {
        return Err(EncodeError::PayloadTooLarge { command, len: payload.len(), max });
    }
    Ok(())
}

pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FramedCodec;

impl PacketCodec for FramedCodec {
    fn version(&self) -> CodecVersion {
        CodecVersion::ColmiV1
    }

    fn min_frame_len(&self) -> usize {
        FRAME_LEN
    }

    fn encode(&self, command: u8, payload: &[u8]) -> Result<Vec<u8>, EncodeError> {
        check_payload(self, command, payload)?;

        let mut frame = vec![0u8; FRAME_LEN];
        frame[0] = command;
        frame[1..1 + payload.len()].copy_from_slice(payload);
        frame[FRAME_LEN - 1] = checksum(&frame[..FRAME_LEN - 1]);
        Ok(frame)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Packet, DecodeError> {
        if bytes.len() < FRAME_LEN {
            return Err(DecodeError::TooShort { len: bytes.len(), min: FRAME_LEN });
        }
        if bytes.len() > FRAME_LEN {
            return Err(DecodeError::TooLong { len: bytes.len(), max: FRAME_LEN });
        }

        let expected = checksum(&bytes[..FRAME_LEN - 1]);
        let actual = bytes[FRAME_LEN - 1];
        if expected != actual {
            return Err(DecodeError::Checksum { expected, actual });
        }

        Ok(Packet {
            command: bytes[0],
            payload: bytes[1..FRAME_LEN - 1].to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl PacketCodec for RawCodec {
    fn version(&self) -> CodecVersion {
        CodecVersion::Raw
    }

    fn min_frame_len(&self) -> usize {
        1
    }

    fn encode(&self, command: u8, payload: &[u8]) -> Result<Vec<u8>, EncodeError> {
        check_payload(self, command, payload)?;

        let mut frame = Vec::with_capacity(1 + payload.len());
        frame.push(command);
        frame.extend_from_slice(payload);
        Ok(frame)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Packet, DecodeError> {
        let (command, payload) = bytes
            .split_first()
            .ok_or(DecodeError::TooShort { len: 0, min: 1 })?;

        if payload.len() > FRAME_PAYLOAD_LEN {
            return Err(DecodeError::TooLong { len: bytes.len(), max: FRAME_PAYLOAD_LEN + 1 });
        }

        Ok(Packet { command: *command, payload: payload.to_vec() })
    }
}
