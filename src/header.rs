//! MP fragment header codec.
//!
//! The header immediately precedes the fragment payload, big-endian, with
//! no other framing:
//!
//! ```text
//! Short (16 bits): [B][E][0 0][sequence: 12 bits]
//! Long  (32 bits): [B][E][0 0 0 0 0 0][sequence: 24 bits]
//! ```
//!
//! `B` marks the first fragment of a datagram, `E` the last. Reserved bits
//! are written as zero and ignored on receive.

use crate::sequence::{Seq, SeqMode};

/// Beginning-fragment flag in a short header.
pub const SHORT_FIRST_FLAG: u16 = 0x8000;

/// Ending-fragment flag in a short header.
pub const SHORT_LAST_FLAG: u16 = 0x4000;

/// Beginning-fragment flag in a long header.
pub const LONG_FIRST_FLAG: u32 = 0x8000_0000;

/// Ending-fragment flag in a long header.
pub const LONG_LAST_FLAG: u32 = 0x4000_0000;

/// Decoded MP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpHeader {
    /// Sequence number, masked to the header width.
    pub seq: Seq,
    /// First fragment of a datagram.
    pub first: bool,
    /// Last fragment of a datagram.
    pub last: bool,
}

/// Errors decoding or encoding an MP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// Frame is shorter than the header.
    Runt {
        /// Bytes available.
        len: usize,
        /// Bytes required.
        need: usize,
    },
    /// Output buffer cannot hold the header.
    BufferTooSmall,
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Runt { len, need } => {
                write!(f, "runt fragment ({} bytes, header needs {})", len, need)
            }
            Self::BufferTooSmall => write!(f, "buffer too small for MP header"),
        }
    }
}

impl std::error::Error for HeaderError {}

impl MpHeader {
    /// Create a header.
    pub const fn new(seq: Seq, first: bool, last: bool) -> Self {
        Self { seq, first, last }
    }

    /// Parse the header at the start of `frame`.
    ///
    /// Returns the header and the remaining payload.
    pub fn decode(mode: SeqMode, frame: &[u8]) -> Result<(Self, &[u8]), HeaderError> {
        let need = mode.header_len();
        if frame.len() < need {
            return Err(HeaderError::Runt {
                len: frame.len(),
                need,
            });
        }
        let header = match mode {
            SeqMode::Short => {
                let raw = u16::from_be_bytes([frame[0], frame[1]]);
                Self {
                    seq: u32::from(raw) & mode.mask(),
                    first: raw & SHORT_FIRST_FLAG != 0,
                    last: raw & SHORT_LAST_FLAG != 0,
                }
            }
            SeqMode::Long => {
                let raw = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
                Self {
                    seq: raw & mode.mask(),
                    first: raw & LONG_FIRST_FLAG != 0,
                    last: raw & LONG_LAST_FLAG != 0,
                }
            }
        };
        Ok((header, &frame[need..]))
    }

    /// Write the header into `buf`, returning the number of bytes written.
    pub fn write_to(&self, mode: SeqMode, buf: &mut [u8]) -> Result<usize, HeaderError> {
        let len = mode.header_len();
        if buf.len() < len {
            return Err(HeaderError::BufferTooSmall);
        }
        match mode {
            SeqMode::Short => {
                let mut raw = (self.seq & mode.mask()) as u16;
                if self.first {
                    raw |= SHORT_FIRST_FLAG;
                }
                if self.last {
                    raw |= SHORT_LAST_FLAG;
                }
                buf[..len].copy_from_slice(&raw.to_be_bytes());
            }
            SeqMode::Long => {
                let mut raw = self.seq & mode.mask();
                if self.first {
                    raw |= LONG_FIRST_FLAG;
                }
                if self.last {
                    raw |= LONG_LAST_FLAG;
                }
                buf[..len].copy_from_slice(&raw.to_be_bytes());
            }
        }
        Ok(len)
    }

    /// Build a complete frame: header followed by `payload`.
    pub fn encode_frame(&self, mode: SeqMode, payload: &[u8]) -> Vec<u8> {
        let len = mode.header_len();
        let mut frame = vec![0u8; len + payload.len()];
        // The buffer is sized for the header above
        let _ = self.write_to(mode, &mut frame);
        frame[len..].copy_from_slice(payload);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_header_layout() {
        let frame = MpHeader::new(0x0abc, true, false).encode_frame(SeqMode::Short, &[9]);
        assert_eq!(frame, vec![0x8a, 0xbc, 9]);

        let frame = MpHeader::new(1, false, true).encode_frame(SeqMode::Short, &[]);
        assert_eq!(frame, vec![0x40, 0x01]);
    }

    #[test]
    fn test_long_header_layout() {
        let frame = MpHeader::new(0x12_3456, true, true).encode_frame(SeqMode::Long, &[1, 2]);
        assert_eq!(frame, vec![0xc0, 0x12, 0x34, 0x56, 1, 2]);
    }

    #[test]
    fn test_decode_short() {
        let (header, payload) = MpHeader::decode(SeqMode::Short, &[0xc0, 0x05, 7, 8]).unwrap();
        assert_eq!(header, MpHeader::new(5, true, true));
        assert_eq!(payload, &[7, 8]);
    }

    #[test]
    fn test_decode_long() {
        let (header, payload) =
            MpHeader::decode(SeqMode::Long, &[0x40, 0xff, 0xff, 0xff, 0xaa]).unwrap();
        assert_eq!(header, MpHeader::new(0x00ff_ffff, false, true));
        assert_eq!(payload, &[0xaa]);
    }

    #[test]
    fn test_decode_ignores_reserved_bits() {
        // Bits 13..12 are reserved in the short format
        let (header, _) = MpHeader::decode(SeqMode::Short, &[0x30, 0x02]).unwrap();
        assert_eq!(header, MpHeader::new(2, false, false));

        // Bits 29..24 are reserved in the long format
        let (header, _) = MpHeader::decode(SeqMode::Long, &[0x3f, 0x00, 0x00, 0x09]).unwrap();
        assert_eq!(header, MpHeader::new(9, false, false));
    }

    #[test]
    fn test_decode_runt() {
        assert_eq!(
            MpHeader::decode(SeqMode::Short, &[0x80]),
            Err(HeaderError::Runt { len: 1, need: 2 })
        );
        assert_eq!(
            MpHeader::decode(SeqMode::Long, &[0x80, 0, 0]),
            Err(HeaderError::Runt { len: 3, need: 4 })
        );
        // Exactly a header is a valid empty fragment
        assert!(MpHeader::decode(SeqMode::Long, &[0, 0, 0, 0]).is_ok());
    }

    #[test]
    fn test_write_to_small_buffer() {
        let mut buf = [0u8; 3];
        assert_eq!(
            MpHeader::new(1, true, true).write_to(SeqMode::Long, &mut buf),
            Err(HeaderError::BufferTooSmall)
        );
        assert_eq!(
            MpHeader::new(1, true, true).write_to(SeqMode::Short, &mut buf),
            Ok(2)
        );
    }

    #[test]
    fn test_encode_masks_sequence() {
        let frame = MpHeader::new(0x1001, false, false).encode_frame(SeqMode::Short, &[]);
        assert_eq!(frame, vec![0x00, 0x01]);
    }
}
