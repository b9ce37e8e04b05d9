//! Framed append-only logs.
//!
//! The buffer, the database and transaction backups each persist through a
//! [`FramedLog`]: a storage backend plus a frame envelope with a CRC. Logs
//! are replayed front to back on open; a torn final frame (a crash in the
//! middle of an append) is cut off, anything else that fails to verify is
//! reported as corruption.

mod frame;
mod iterator;

pub use frame::{Frame, LogFormat, FRAME_VERSION};
pub use iterator::FrameIterator;

use crate::error::CoreResult;
use frame::{encode_frame, encode_payload};
use serde::Serialize;
use versadb_storage::StorageBackend;

/// What a replay found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Frames handed to the visitor.
    pub frames: usize,
    /// Bytes of incomplete trailing frame that were cut off.
    pub discarded_bytes: u64,
}

/// An append-only log of CBOR frames over a storage backend.
///
/// Not internally synchronized: owners wrap it in a lock.
pub struct FramedLog {
    format: LogFormat,
    backend: Box<dyn StorageBackend>,
    sync_on_append: bool,
}

impl FramedLog {
    /// Wraps `backend`.
    pub fn new(format: LogFormat, backend: Box<dyn StorageBackend>, sync_on_append: bool) -> Self {
        Self {
            format,
            backend,
            sync_on_append,
        }
    }

    /// Returns the log format.
    #[must_use]
    pub fn format(&self) -> LogFormat {
        self.format
    }

    /// Appends one record and returns the frame offset.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding, the backend write or the sync fails.
    /// The frame is then cut back off when the backend allows it, so a
    /// record reported as failed is not replayed on the next open. If the
    /// cut itself fails, a partial frame is left for replay to discard,
    /// while a complete one will come back.
    pub fn append<T: Serialize>(&mut self, kind: u8, record: &T) -> CoreResult<u64> {
        let payload = encode_payload(record)?;
        let frame = encode_frame(self.format, kind, &payload)?;
        let start = self.backend.size()?;
        let sync = self.sync_on_append;
        let written = self.backend.append(&frame).and_then(|offset| {
            if sync {
                self.backend.sync()?;
            }
            Ok(offset)
        });
        written.map_err(|e| {
            if let Err(undo) = self.backend.truncate(start) {
                tracing::warn!(
                    log = self.format.name,
                    offset = start,
                    error = %undo,
                    "could not cut back failed append"
                );
            }
            e.into()
        })
    }

    /// Flushes buffered bytes to the OS.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend flush fails.
    pub fn flush(&mut self) -> CoreResult<()> {
        self.backend.flush()?;
        Ok(())
    }

    /// Flushes and makes every appended frame durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend flush or sync fails.
    pub fn sync(&mut self) -> CoreResult<()> {
        self.backend.flush()?;
        self.backend.sync()?;
        Ok(())
    }

    /// Returns the log size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }

    /// Discards every frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend truncate fails.
    pub fn reset(&mut self) -> CoreResult<()> {
        self.backend.truncate(0)?;
        Ok(())
    }

    /// Streams the frames currently in the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn frames(&self) -> CoreResult<FrameIterator<'_>> {
        FrameIterator::new(self.backend.as_ref(), self.format)
    }

    /// Visits every frame, then cuts off a torn tail so later appends start
    /// on a frame boundary.
    ///
    /// # Errors
    ///
    /// Returns the first corruption, I/O or visitor error.
    pub fn replay<F>(&mut self, mut visit: F) -> CoreResult<ReplaySummary>
    where
        F: FnMut(&Frame) -> CoreResult<()>,
    {
        let mut summary = ReplaySummary::default();
        let (valid_end, torn) = {
            let mut iter = self.frames()?;
            for frame in iter.by_ref() {
                visit(&frame?)?;
                summary.frames += 1;
            }
            (iter.valid_end(), iter.torn_tail())
        };

        if torn {
            let size = self.backend.size()?;
            summary.discarded_bytes = size - valid_end;
            tracing::warn!(
                log = self.format.name,
                offset = valid_end,
                bytes = summary.discarded_bytes,
                "discarding torn frame at end of log"
            );
            self.backend.truncate(valid_end)?;
        }

        Ok(summary)
    }
}

impl std::fmt::Debug for FramedLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedLog")
            .field("format", &self.format.name)
            .field("sync_on_append", &self.sync_on_append)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use versadb_storage::{InMemoryBackend, SharedMemoryBackend, StorageError, StorageResult};

    #[test]
    fn append_and_replay() {
        let mut log = FramedLog::new(LogFormat::DATABASE, Box::new(InMemoryBackend::new()), false);
        assert_eq!(log.append(1, &"first").unwrap(), 0);
        log.append(2, &42u64).unwrap();

        let mut seen = Vec::new();
        let summary = log
            .replay(|frame| {
                seen.push(frame.kind);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.discarded_bytes, 0);
    }

    #[test]
    fn replay_cuts_torn_tail() {
        let disk = SharedMemoryBackend::new();
        {
            let mut log = FramedLog::new(LogFormat::BUFFER, Box::new(disk.clone()), true);
            log.append(1, &"kept").unwrap();
        }
        let kept = disk.data().len();
        let mut bytes = disk.data();
        bytes.extend_from_slice(b"VBUF\x01\x00\x01\xff");
        disk.replace(bytes);

        let mut log = FramedLog::new(LogFormat::BUFFER, Box::new(disk.clone()), true);
        let summary = log.replay(|_| Ok(())).unwrap();
        assert_eq!(summary.frames, 1);
        assert_eq!(summary.discarded_bytes, 8);
        assert_eq!(disk.data().len(), kept);

        log.append(1, &"after").unwrap();
        let payloads: Vec<String> = log
            .frames()
            .unwrap()
            .map(|f| f.unwrap().decode().unwrap())
            .collect();
        assert_eq!(payloads, vec!["kept".to_string(), "after".to_string()]);
    }

    #[test]
    fn reset_empties_the_log() {
        let mut log = FramedLog::new(LogFormat::BUFFER, Box::new(InMemoryBackend::new()), false);
        log.append(1, &1u8).unwrap();
        log.sync().unwrap();
        log.reset().unwrap();
        assert_eq!(log.size().unwrap(), 0);
        assert_eq!(log.frames().unwrap().count(), 0);
    }

    /// Memory backend whose `sync` fails while `fail` is set.
    struct FlakySync {
        inner: InMemoryBackend,
        fail: Arc<AtomicBool>,
    }

    impl StorageBackend for FlakySync {
        fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
            self.inner.read_at(offset, len)
        }

        fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
            self.inner.append(data)
        }

        fn flush(&mut self) -> StorageResult<()> {
            self.inner.flush()
        }

        fn size(&self) -> StorageResult<u64> {
            self.inner.size()
        }

        fn sync(&mut self) -> StorageResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StorageError::Closed);
            }
            self.inner.sync()
        }

        fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
            self.inner.truncate(new_size)
        }
    }

    #[test]
    fn failed_sync_cuts_the_frame_back() {
        let fail = Arc::new(AtomicBool::new(false));
        let backend = FlakySync {
            inner: InMemoryBackend::new(),
            fail: Arc::clone(&fail),
        };
        let mut log = FramedLog::new(LogFormat::DATABASE, Box::new(backend), true);
        log.append(1, &"kept").unwrap();
        let kept = log.size().unwrap();

        fail.store(true, Ordering::SeqCst);
        assert!(log.append(1, &"lost").is_err());
        assert_eq!(log.size().unwrap(), kept);

        fail.store(false, Ordering::SeqCst);
        let payloads: Vec<String> = log
            .frames()
            .unwrap()
            .map(|f| f.unwrap().decode().unwrap())
            .collect();
        assert_eq!(payloads, vec!["kept".to_string()]);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn any_cut_replays_the_complete_prefix(
                payloads in prop::collection::vec(".{0,24}", 1..8),
                cut in any::<prop::sample::Index>(),
            ) {
                let disk = SharedMemoryBackend::new();
                let mut ends = Vec::new();
                {
                    let mut log = FramedLog::new(LogFormat::BUFFER, Box::new(disk.clone()), false);
                    for payload in &payloads {
                        log.append(1, payload).unwrap();
                        ends.push(log.size().unwrap());
                    }
                }

                let mut bytes = disk.data();
                let cut_at = cut.index(bytes.len() + 1);
                bytes.truncate(cut_at);
                disk.replace(bytes);

                let mut seen = Vec::new();
                let mut log = FramedLog::new(LogFormat::BUFFER, Box::new(disk.clone()), false);
                log.replay(|frame| {
                    seen.push(frame.decode::<String>()?);
                    Ok(())
                })
                .unwrap();

                let complete = ends.iter().filter(|&&end| end <= cut_at as u64).count();
                prop_assert_eq!(&seen[..], &payloads[..complete]);
                let expected_size = if complete == 0 { 0 } else { ends[complete - 1] };
                prop_assert_eq!(disk.data().len() as u64, expected_size);
            }
        }
    }
}
