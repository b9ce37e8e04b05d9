//! Streaming frame iterator.

use crate::error::{CoreError, CoreResult};
use crate::log::frame::{Frame, LogFormat, CRC_SIZE, FRAME_VERSION, HEADER_SIZE};
use versadb_storage::StorageBackend;

/// Reads frames one at a time from a backend.
///
/// # Error Handling
///
/// - an incomplete header or payload at the end is a torn tail: iteration
///   stops cleanly and [`Self::torn_tail`] reports it
/// - a bad magic, unknown version or CRC mismatch is an error; nothing after
///   a damaged frame can be trusted
pub struct FrameIterator<'a> {
    backend: &'a dyn StorageBackend,
    format: LogFormat,
    total_size: u64,
    offset: u64,
    finished: bool,
    torn: bool,
}

impl<'a> FrameIterator<'a> {
    /// Creates an iterator starting at offset 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn new(backend: &'a dyn StorageBackend, format: LogFormat) -> CoreResult<Self> {
        let total_size = backend.size()?;
        Ok(Self {
            backend,
            format,
            total_size,
            offset: 0,
            finished: false,
            torn: false,
        })
    }

    /// Offset just past the last complete frame read so far.
    #[must_use]
    pub fn valid_end(&self) -> u64 {
        self.offset
    }

    /// Whether iteration stopped on an incomplete trailing frame.
    #[must_use]
    pub fn torn_tail(&self) -> bool {
        self.torn
    }

    fn remaining(&self) -> u64 {
        self.total_size - self.offset
    }

    fn read_next(&mut self) -> CoreResult<Option<Frame>> {
        let start = self.offset;
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < HEADER_SIZE as u64 {
            self.torn = true;
            return Ok(None);
        }

        let header = self.backend.read_at(start, HEADER_SIZE)?;
        if header[0..4] != self.format.magic {
            return Err(CoreError::log_corruption(
                self.format.name,
                start,
                "invalid magic",
            ));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > FRAME_VERSION {
            return Err(CoreError::log_corruption(
                self.format.name,
                start,
                format!("unsupported frame version {version}"),
            ));
        }

        let kind = header[6];
        let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if remaining < total_len as u64 {
            self.torn = true;
            return Ok(None);
        }

        let body = self
            .backend
            .read_at(start + HEADER_SIZE as u64, payload_len + CRC_SIZE)?;
        let (payload, crc_bytes) = body.split_at(payload_len);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        hasher.update(payload);
        let computed = hasher.finalize();
        if stored != computed {
            return Err(CoreError::ChecksumMismatch {
                offset: start,
                expected: stored,
                actual: computed,
            });
        }

        self.offset += total_len as u64;
        Ok(Some(Frame {
            offset: start,
            kind,
            payload: payload.to_vec(),
        }))
    }
}

impl Iterator for FrameIterator<'_> {
    type Item = CoreResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.read_next() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
