// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Subnet frame layout and the tokio codec reading it.
//!
//! ```text
//! +--------+--------+-----------------+
//! | cmd:u16| len:u16| payload (len)   |
//! +--------+--------+-----------------+
//! ```
//! Both header fields are big-endian, `len` counts payload bytes only.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::cipher::PayloadCipher;
use crate::{AppError, AppResult};

pub const FRAME_HEADER_SIZE: usize = 4;
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

pub type SentCallback = Box<dyn FnOnce() + Send + 'static>;

/// An outbound frame waiting in a connection's queue.
pub struct Frame {
    cmd_id: u16,
    payload: Bytes,
    encryption: Option<u8>,
    enqueued_at: Instant,
    on_sent: Option<SentCallback>,
}

impl Frame {
    pub fn new(cmd_id: u16, payload: impl Into<Bytes>) -> AppResult<Frame> {
        let payload = payload.into();
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(AppError::MessageTooLarge(format!(
                "cmd {} payload of {} bytes exceeds {}",
                cmd_id,
                payload.len(),
                MAX_FRAME_PAYLOAD
            )));
        }
        Ok(Frame {
            cmd_id,
            payload,
            encryption: None,
            enqueued_at: Instant::now(),
            on_sent: None,
        })
    }

    /// Run `callback` once the frame has been written to the socket.
    pub fn with_callback(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_sent = Some(Box::new(callback));
        self
    }

    /// Replace the payload with its encrypted form.
    pub fn seal(mut self, cipher: &dyn PayloadCipher, tag: u8) -> AppResult<Self> {
        let sealed = cipher.encrypt(tag, &self.payload)?;
        if sealed.len() > MAX_FRAME_PAYLOAD {
            return Err(AppError::MessageTooLarge(format!(
                "cmd {} sealed payload of {} bytes exceeds {}",
                self.cmd_id,
                sealed.len(),
                MAX_FRAME_PAYLOAD
            )));
        }
        self.payload = sealed;
        self.encryption = Some(tag);
        Ok(self)
    }

    pub fn cmd_id(&self) -> u16 {
        self.cmd_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn encryption(&self) -> Option<u8> {
        self.encryption
    }

    /// Bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }

    pub(crate) fn mark_enqueued(&mut self) {
        self.enqueued_at = Instant::now();
    }

    pub(crate) fn take_callback(&mut self) -> Option<SentCallback> {
        self.on_sent.take()
    }

    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.wire_len());
        dst.put_u16(self.cmd_id);
        // checked against MAX_FRAME_PAYLOAD on construction
        dst.put_u16(self.payload.len() as u16);
        dst.put_slice(&self.payload);
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("cmd_id", &self.cmd_id)
            .field("len", &self.payload.len())
            .field("encryption", &self.encryption)
            .field("has_callback", &self.on_sent.is_some())
            .finish()
    }
}

/// A frame read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub cmd_id: u16,
    pub payload: Bytes,
}

impl InboundFrame {
    /// Decrypt the payload in place.
    pub fn open(mut self, cipher: &dyn PayloadCipher, tag: u8) -> AppResult<Self> {
        self.payload = cipher.decrypt(tag, &self.payload)?;
        Ok(self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(MAX_FRAME_PAYLOAD),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_PAYLOAD)
    }
}

impl Decoder for FrameCodec {
    type Item = InboundFrame;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> AppResult<Option<InboundFrame>> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let cmd_id = u16::from_be_bytes([src[0], src[1]]);
        let length = u16::from_be_bytes([src[2], src[3]]) as usize;
        if length > self.max_payload {
            return Err(AppError::MalformedFrame(format!(
                "cmd {} declares {} bytes, limit is {}",
                cmd_id, length, self.max_payload
            )));
        }
        let total = FRAME_HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(FRAME_HEADER_SIZE);
        let payload = src.split_to(length).freeze();
        Ok(Some(InboundFrame { cmd_id, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> AppResult<Option<InboundFrame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(AppError::MalformedFrame(format!(
                "stream closed with {} bytes of a partial frame",
                src.len()
            ))),
        }
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> AppResult<()> {
        if frame.payload.len() > self.max_payload {
            return Err(AppError::MessageTooLarge(format!(
                "cmd {} payload of {} bytes exceeds {}",
                frame.cmd_id,
                frame.payload.len(),
                self.max_payload
            )));
        }
        frame.write_to(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_waits_for_whole_frame() {
        let mut codec = FrameCodec::default();
        let mut buffer = BytesMut::from(&[0x00, 0x10, 0x00][..]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&[0x03, b'a', b'b']);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&[b'c', 0x00, 0x02]);
        let frame = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(frame.cmd_id, 16);
        assert_eq!(&frame.payload[..], b"abc");
        // the start of the next frame stays buffered
        assert_eq!(&buffer[..], &[0x00, 0x02]);
    }

    #[test]
    fn test_oversized_declared_length_is_malformed() {
        let mut codec = FrameCodec::new(8);
        let mut buffer = BytesMut::from(&[0x00, 0x01, 0x00, 0x09][..]);
        let err = codec.decode(&mut buffer).unwrap_err();
        assert!(matches!(err, AppError::MalformedFrame(_)));
        assert!(err.is_connection_fatal());
    }

    #[test]
    fn test_partial_frame_at_eof() {
        let mut codec = FrameCodec::default();
        let mut buffer = BytesMut::from(&[0x00, 0x01, 0x00, 0x05, 0x01][..]);
        assert!(matches!(
            codec.decode_eof(&mut buffer),
            Err(AppError::MalformedFrame(_))
        ));
        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }

    #[test]
    fn test_encode_header() {
        let frame = Frame::new(18, Bytes::from_static(b"hey")).unwrap();
        assert_eq!(frame.wire_len(), 7);
        let mut dst = BytesMut::new();
        FrameCodec::default().encode(&frame, &mut dst).unwrap();
        assert_eq!(&dst[..], &[0x00, 0x12, 0x00, 0x03, b'h', b'e', b'y']);
    }

    #[test]
    fn test_payload_limit() {
        assert!(Frame::new(1, vec![0u8; MAX_FRAME_PAYLOAD]).is_ok());
        assert!(matches!(
            Frame::new(1, vec![0u8; MAX_FRAME_PAYLOAD + 1]),
            Err(AppError::MessageTooLarge(_))
        ));
    }
}
