//! Frame envelope shared by every log.
//!
//! ```text
//! magic (4) | version u16 LE | kind u8 | len u32 LE | payload (len) | crc32 u32 LE
//! ```
//!
//! The CRC covers everything before it. Payloads are CBOR.

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// magic (4) + version (2) + kind (1) + length (4) = 11 bytes
pub(crate) const HEADER_SIZE: usize = 11;

pub(crate) const CRC_SIZE: usize = 4;

/// Current frame format version.
pub const FRAME_VERSION: u16 = 1;

/// Identifies one log family: its name in diagnostics and its magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFormat {
    /// Name used in errors and log lines.
    pub name: &'static str,
    /// Magic bytes opening every frame.
    pub magic: [u8; 4],
}

impl LogFormat {
    /// The buffer's staging log.
    pub const BUFFER: Self = Self {
        name: "buffer",
        magic: *b"VBUF",
    };

    /// The database's revision log.
    pub const DATABASE: Self = Self {
        name: "database",
        magic: *b"VDBR",
    };

    /// A transaction backup.
    pub const BACKUP: Self = Self {
        name: "backup",
        magic: *b"VTXN",
    };
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Offset of the frame's first byte.
    pub offset: u64,
    /// Caller-defined record kind.
    pub kind: u8,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Decodes the payload.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Codec`] if the payload is not a valid `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> CoreResult<T> {
        decode_payload(&self.payload)
    }
}

/// Builds a complete frame around `payload`.
pub(crate) fn encode_frame(format: LogFormat, kind: u8, payload: &[u8]) -> CoreResult<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        CoreError::invalid_operation(format!(
            "{} frame payload too large: {} bytes",
            format.name,
            payload.len()
        ))
    })?;

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    data.extend_from_slice(&format.magic);
    data.extend_from_slice(&FRAME_VERSION.to_le_bytes());
    data.push(kind);
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(payload);

    let crc = crc32fast::hash(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

/// Serializes a payload as CBOR.
pub(crate) fn encode_payload<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(buf)
}

/// Deserializes a CBOR payload.
pub(crate) fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        let frame = encode_frame(LogFormat::BUFFER, 7, b"abc").unwrap();
        assert_eq!(frame.len(), HEADER_SIZE + 3 + CRC_SIZE);
        assert_eq!(&frame[0..4], b"VBUF");
        assert_eq!(u16::from_le_bytes([frame[4], frame[5]]), FRAME_VERSION);
        assert_eq!(frame[6], 7);
        assert_eq!(
            u32::from_le_bytes([frame[7], frame[8], frame[9], frame[10]]),
            3
        );
        assert_eq!(&frame[11..14], b"abc");

        let stored = u32::from_le_bytes([frame[14], frame[15], frame[16], frame[17]]);
        assert_eq!(stored, crc32fast::hash(&frame[..14]));
    }

    #[test]
    fn payload_codec() {
        let bytes = encode_payload(&("name", 42u64)).unwrap();
        let (key, record): (String, u64) = decode_payload(&bytes).unwrap();
        assert_eq!(key, "name");
        assert_eq!(record, 42);

        let err = decode_payload::<(String, u64)>(&[0xff, 0x00]).unwrap_err();
        assert!(matches!(err, CoreError::Codec { .. }));
    }

    #[test]
    fn formats_are_distinct() {
        assert_ne!(LogFormat::BUFFER.magic, LogFormat::DATABASE.magic);
        assert_ne!(LogFormat::DATABASE.magic, LogFormat::BACKUP.magic);
    }
}
