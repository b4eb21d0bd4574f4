//! Checksummed framing shared by node pages, data records and the journal.
//!
//! A frame is `magic: u32 | len: u32 | crc32(payload): u32 | payload`,
//! all little-endian.

/// Length of the frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 12;

/// Why a frame failed to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the header or the declared length.
    Truncated {
        /// Bytes needed.
        needed: usize,
        /// Bytes available.
        available: usize,
    },
    /// The magic number did not match.
    BadMagic {
        /// Expected magic.
        expected: u32,
        /// Magic found.
        found: u32,
    },
    /// The payload checksum did not match.
    BadChecksum {
        /// Checksum stored in the header.
        stored: u32,
        /// Checksum of the payload read.
        computed: u32,
    },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Truncated { needed, available } => {
                write!(f, "truncated frame: need {} bytes, have {}", needed, available)
            }
            FrameError::BadMagic { expected, found } => {
                write!(f, "bad magic {:#010x}, expected {:#010x}", found, expected)
            }
            FrameError::BadChecksum { stored, computed } => {
                write!(f, "crc mismatch: stored {:#010x}, computed {:#010x}", stored, computed)
            }
        }
    }
}

/// Wraps `payload` in a frame.
pub fn encode(magic: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&magic.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Reads the declared payload length from a frame header.
pub fn payload_len(header: &[u8]) -> Result<usize, FrameError> {
    if header.len() < FRAME_HEADER_LEN {
        return Err(FrameError::Truncated {
            needed: FRAME_HEADER_LEN,
            available: header.len(),
        });
    }
    Ok(read_u32(header, 4) as usize)
}

/// Verifies the frame at the start of `buf` and returns its payload.
/// Bytes after the payload are ignored.
pub fn decode(magic: u32, buf: &[u8]) -> Result<&[u8], FrameError> {
    let len = payload_len(buf)?;
    let found = read_u32(buf, 0);
    if found != magic {
        return Err(FrameError::BadMagic {
            expected: magic,
            found,
        });
    }
    let end = FRAME_HEADER_LEN + len;
    if buf.len() < end {
        return Err(FrameError::Truncated {
            needed: end,
            available: buf.len(),
        });
    }
    let payload = &buf[FRAME_HEADER_LEN..end];
    let stored = read_u32(buf, 8);
    let computed = crc32fast::hash(payload);
    if stored != computed {
        return Err(FrameError::BadChecksum { stored, computed });
    }
    Ok(payload)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(word)
}
