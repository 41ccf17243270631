//! Length-prefix frame codec for the TCP transport.
//!
//! Wire format:
//!
//! ```text
//! --------------
//! | len | data |
//! --------------
//! ```
//!
//! The prefix is a 1, 2 or 4 byte unsigned integer in the configured
//! endianness; the payload length must lie within the configured
//! `[min, max]` bounds, which are themselves clamped to what the prefix
//! width can represent.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::FrameError;

/// Immutable framing parameters shared by all readers and writers of a
/// listener or dialer.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    len_width: usize,
    min_msg_len: u32,
    max_msg_len: u32,
    little_endian: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            len_width: 2,
            min_msg_len: 1,
            max_msg_len: 4096,
            little_endian: false,
        }
    }
}

impl FrameCodec {
    /// Build a codec, falling back to defaults for out-of-range
    /// parameters and clamping the bounds to the prefix width.
    ///
    /// A `len_width` other than 1, 2 or 4 keeps the default of 2; zero
    /// min/max lengths keep their defaults.
    pub fn new(len_width: usize, min_msg_len: u32, max_msg_len: u32, little_endian: bool) -> Self {
        let mut codec = Self {
            little_endian,
            ..Default::default()
        };
        if matches!(len_width, 1 | 2 | 4) {
            codec.len_width = len_width;
        }
        if min_msg_len != 0 {
            codec.min_msg_len = min_msg_len;
        }
        if max_msg_len != 0 {
            codec.max_msg_len = max_msg_len;
        }

        let max = match codec.len_width {
            1 => u8::MAX as u32,
            2 => u16::MAX as u32,
            _ => u32::MAX,
        };
        codec.min_msg_len = codec.min_msg_len.min(max);
        codec.max_msg_len = codec.max_msg_len.min(max);
        codec
    }

    /// Maximum payload length accepted by this codec.
    pub fn max_msg_len(&self) -> u32 {
        self.max_msg_len
    }

    /// Read one frame: exactly `len_width` header bytes, then exactly
    /// `len` payload bytes. Rejects lengths outside `[min, max]` before
    /// touching the payload.
    pub async fn read_from<R>(&self, reader: &mut R) -> Result<Vec<u8>, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header[..self.len_width]).await?;

        let msg_len = match self.len_width {
            1 => header[0] as u32,
            2 => {
                let bytes = [header[0], header[1]];
                if self.little_endian {
                    u16::from_le_bytes(bytes) as u32
                } else {
                    u16::from_be_bytes(bytes) as u32
                }
            }
            _ => {
                if self.little_endian {
                    u32::from_le_bytes(header)
                } else {
                    u32::from_be_bytes(header)
                }
            }
        };

        if msg_len > self.max_msg_len {
            return Err(FrameError::TooLong);
        }
        if msg_len < self.min_msg_len {
            return Err(FrameError::TooShort);
        }

        let mut data = vec![0u8; msg_len as usize];
        reader.read_exact(&mut data).await?;
        Ok(data)
    }

    /// Frame a message given as one or more payload slices, producing a
    /// single contiguous buffer ready for the connection's write queue.
    pub fn encode(&self, parts: &[&[u8]]) -> Result<Vec<u8>, FrameError> {
        let mut msg_len: u32 = 0;
        for part in parts {
            msg_len = msg_len.saturating_add(part.len() as u32);
        }

        if msg_len > self.max_msg_len {
            return Err(FrameError::TooLong);
        }
        if msg_len < self.min_msg_len {
            return Err(FrameError::TooShort);
        }

        let mut buf = vec![0u8; self.len_width + msg_len as usize];
        match self.len_width {
            1 => buf[0] = msg_len as u8,
            2 => {
                let bytes = if self.little_endian {
                    (msg_len as u16).to_le_bytes()
                } else {
                    (msg_len as u16).to_be_bytes()
                };
                buf[..2].copy_from_slice(&bytes);
            }
            _ => {
                let bytes = if self.little_endian {
                    msg_len.to_le_bytes()
                } else {
                    msg_len.to_be_bytes()
                };
                buf[..4].copy_from_slice(&bytes);
            }
        }

        let mut offset = self.len_width;
        for part in parts {
            buf[offset..offset + part.len()].copy_from_slice(part);
            offset += part.len();
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let codec = FrameCodec::new(2, 1, 8, false);
        let wire = codec.encode(&[&[0x41, 0x42, 0x43]]).unwrap();
        assert_eq!(wire, vec![0x00, 0x03, 0x41, 0x42, 0x43]);

        let mut reader = &wire[..];
        let payload = codec.read_from(&mut reader).await.unwrap();
        assert_eq!(payload, vec![0x41, 0x42, 0x43]);
    }

    #[tokio::test]
    async fn test_little_endian_round_trip() {
        let codec = FrameCodec::new(4, 1, 1024, true);
        let wire = codec.encode(&[b"hello", b" world"]).unwrap();
        assert_eq!(&wire[..4], &11u32.to_le_bytes());

        let mut reader = &wire[..];
        let payload = codec.read_from(&mut reader).await.unwrap();
        assert_eq!(payload, b"hello world");
    }

    #[test]
    fn test_encode_too_long() {
        let codec = FrameCodec::new(1, 1, 255, false);
        let payload = vec![0u8; 256];
        assert!(matches!(
            codec.encode(&[&payload]),
            Err(FrameError::TooLong)
        ));
    }

    #[test]
    fn test_encode_too_short() {
        let codec = FrameCodec::new(2, 4, 4096, false);
        assert!(matches!(codec.encode(&[b"abc"]), Err(FrameError::TooShort)));
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_header() {
        let codec = FrameCodec::new(2, 1, 8, false);
        let wire = [0x00u8, 0x09, 0x00];
        let mut reader = &wire[..];
        assert!(matches!(
            codec.read_from(&mut reader).await,
            Err(FrameError::TooLong)
        ));
    }

    #[tokio::test]
    async fn test_read_short_read() {
        let codec = FrameCodec::new(2, 1, 8, false);
        // Header promises 5 bytes, only 2 follow.
        let wire = [0x00u8, 0x05, 0x41, 0x42];
        let mut reader = &wire[..];
        assert!(matches!(
            codec.read_from(&mut reader).await,
            Err(FrameError::Io(_))
        ));
    }

    #[test]
    fn test_bounds_clamped_to_width() {
        let codec = FrameCodec::new(1, 1, 70000, false);
        assert_eq!(codec.max_msg_len(), 255);
    }

    #[test]
    fn test_invalid_width_keeps_default() {
        let codec = FrameCodec::new(3, 0, 0, false);
        let wire = codec.encode(&[b"ab"]).unwrap();
        assert_eq!(wire.len(), 4);
    }
}
