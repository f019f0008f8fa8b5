//! Binary header for still frames sent over the `frames` data channel.
//!
//! 24 bytes, little-endian:
//! ```text
//! [0..4]   magic: 0x46485454 ("TTHF")
//! [4]      version: 1
//! [5]      codec: 1 = H.264, 2 = JPEG
//! [6..8]   width (u16)
//! [8..10]  height (u16)
//! [10..12] flags (u16): bit 0 = keyframe
//! [12..20] timestamp_us (u64), microseconds since the Unix epoch
//! [20..24] payload_length (u32)
//! [24..]   payload
//! ```

use serde::{Deserialize, Serialize};

pub const FRAME_HEADER_SIZE: usize = 24;
pub const FRAME_MAGIC: u32 = 0x4648_5454; // "TTHF" in LE
pub const FRAME_VERSION: u8 = 1;

pub const FLAG_KEYFRAME: u16 = 0x0001;

/// Codec tag carried by every captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameCodec {
    H264,
    Jpeg,
}

impl FrameCodec {
    pub fn tag(self) -> u8 {
        match self {
            FrameCodec::H264 => 1,
            FrameCodec::Jpeg => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, FrameError> {
        match tag {
            1 => Ok(FrameCodec::H264),
            2 => Ok(FrameCodec::Jpeg),
            other => Err(FrameError::UnknownCodec(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub codec: FrameCodec,
    pub width: u16,
    pub height: u16,
    pub flags: u16,
    pub timestamp_us: u64,
    pub payload_length: u32,
}

impl FrameHeader {
    pub fn new(
        codec: FrameCodec,
        width: u16,
        height: u16,
        timestamp_us: u64,
        payload_length: u32,
        keyframe: bool,
    ) -> Self {
        Self {
            codec,
            width,
            height,
            flags: if keyframe { FLAG_KEYFRAME } else { 0 },
            timestamp_us,
            payload_length,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags & FLAG_KEYFRAME != 0
    }

    /// Serialize header to 24-byte little-endian buffer.
    pub fn serialize(&self, buf: &mut [u8; FRAME_HEADER_SIZE]) {
        buf[0..4].copy_from_slice(&FRAME_MAGIC.to_le_bytes());
        buf[4] = FRAME_VERSION;
        buf[5] = self.codec.tag();
        buf[6..8].copy_from_slice(&self.width.to_le_bytes());
        buf[8..10].copy_from_slice(&self.height.to_le_bytes());
        buf[10..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..20].copy_from_slice(&self.timestamp_us.to_le_bytes());
        buf[20..24].copy_from_slice(&self.payload_length.to_le_bytes());
    }

    /// Serialize header + payload into a single Vec.
    pub fn serialize_with_payload(&self, payload: &[u8]) -> Vec<u8> {
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        self.serialize(&mut header_buf);
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.extend_from_slice(&header_buf);
        buf.extend_from_slice(payload);
        buf
    }

    /// Deserialize header from a byte slice (must be at least 24 bytes).
    pub fn deserialize(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort(buf.len()));
        }

        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != FRAME_MAGIC {
            return Err(FrameError::BadMagic(magic));
        }

        let version = buf[4];
        if version != FRAME_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }

        Ok(Self {
            codec: FrameCodec::from_tag(buf[5])?,
            width: u16::from_le_bytes([buf[6], buf[7]]),
            height: u16::from_le_bytes([buf[8], buf[9]]),
            flags: u16::from_le_bytes([buf[10], buf[11]]),
            timestamp_us: u64::from_le_bytes([
                buf[12], buf[13], buf[14], buf[15], buf[16], buf[17], buf[18], buf[19],
            ]),
            payload_length: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
        })
    }

    /// Validate that the buffer contains a complete frame (header + payload).
    pub fn validate_complete(buf: &[u8]) -> Result<(), FrameError> {
        let header = Self::deserialize(buf)?;
        let expected = FRAME_HEADER_SIZE + header.payload_length as usize;
        if buf.len() < expected {
            return Err(FrameError::IncompletePayload {
                expected: header.payload_length as usize,
                actual: buf.len() - FRAME_HEADER_SIZE,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("buffer too short: {0} bytes (need at least {FRAME_HEADER_SIZE})")]
    TooShort(usize),
    #[error("bad magic: 0x{0:08x} (expected 0x{FRAME_MAGIC:08x})")]
    BadMagic(u32),
    #[error("unsupported version: {0} (expected {FRAME_VERSION})")]
    UnsupportedVersion(u8),
    #[error("unknown codec tag: {0}")]
    UnknownCodec(u8),
    #[error("incomplete payload: expected {expected} bytes, got {actual}")]
    IncompletePayload { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_header_roundtrip() {
        let header = FrameHeader::new(FrameCodec::Jpeg, 1920, 1080, 123456, 65536, true);
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        header.serialize(&mut buf);
        let parsed = FrameHeader::deserialize(&buf).unwrap();
        assert_eq!(header, parsed);
        assert!(parsed.is_keyframe());
        assert_eq!(parsed.codec, FrameCodec::Jpeg);
    }

    #[test]
    fn delta_frame_has_no_keyframe_flag() {
        let header = FrameHeader::new(FrameCodec::H264, 1920, 1080, 0, 1024, false);
        assert!(!header.is_keyframe());
        assert_eq!(header.flags, 0);
    }

    #[test]
    fn serialize_with_payload() {
        let payload = vec![0xDE, 0xAD, 0xBE, 0xEF];
        let header = FrameHeader::new(FrameCodec::Jpeg, 640, 480, 42, 4, true);
        let buf = header.serialize_with_payload(&payload);
        assert_eq!(buf.len(), FRAME_HEADER_SIZE + 4);
        let parsed = FrameHeader::deserialize(&buf).unwrap();
        assert_eq!(parsed.width, 640);
        assert_eq!(parsed.height, 480);
        assert_eq!(parsed.timestamp_us, 42);
        assert_eq!(parsed.payload_length, 4);
        assert_eq!(&buf[FRAME_HEADER_SIZE..], &payload);
    }

    #[test]
    fn deserialize_too_short() {
        let buf = [0u8; 10];
        match FrameHeader::deserialize(&buf) {
            Err(FrameError::TooShort(10)) => {}
            other => panic!("expected TooShort(10), got {:?}", other),
        }
    }

    #[test]
    fn deserialize_bad_magic() {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        match FrameHeader::deserialize(&buf) {
            Err(FrameError::BadMagic(0xDEADBEEF)) => {}
            other => panic!("expected BadMagic, got {:?}", other),
        }
    }

    #[test]
    fn deserialize_unknown_codec() {
        let header = FrameHeader::new(FrameCodec::Jpeg, 1, 1, 0, 0, false);
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        header.serialize(&mut buf);
        buf[5] = 9;
        match FrameHeader::deserialize(&buf) {
            Err(FrameError::UnknownCodec(9)) => {}
            other => panic!("expected UnknownCodec(9), got {:?}", other),
        }
    }

    #[test]
    fn validate_complete_incomplete_payload() {
        let payload = vec![0u8; 50];
        let header = FrameHeader::new(FrameCodec::Jpeg, 1920, 1080, 0, 100, false);
        let buf = header.serialize_with_payload(&payload);
        match FrameHeader::validate_complete(&buf) {
            Err(FrameError::IncompletePayload {
                expected: 100,
                actual: 50,
            }) => {}
            other => panic!("expected IncompletePayload, got {:?}", other),
        }
    }

    #[test]
    fn magic_bytes_spell_tthf() {
        assert_eq!(&FRAME_MAGIC.to_le_bytes(), b"TTHF");
    }
}
