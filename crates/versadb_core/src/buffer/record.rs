//! Buffer log records.

use crate::error::{CoreError, CoreResult};
use crate::log::Frame;
use crate::write::Write;
use serde::{Deserialize, Serialize};

/// A write waiting in the buffer, tagged with its insertion sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedWrite {
    /// Position in insertion order, starting at 1.
    pub seq: u64,
    /// The stamped write.
    pub write: Write,
}

/// A frame in the buffer log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BufferRecord {
    /// A write was staged.
    Staged(BufferedWrite),
    /// Every write up to and including `through` reached the database.
    Transported { through: u64 },
}

impl BufferRecord {
    pub(crate) const STAGED: u8 = 1;
    pub(crate) const TRANSPORTED: u8 = 2;

    pub(crate) fn from_frame(frame: &Frame) -> CoreResult<Self> {
        match frame.kind {
            Self::STAGED => Ok(Self::Staged(frame.decode()?)),
            Self::TRANSPORTED => Ok(Self::Transported {
                through: frame.decode()?,
            }),
            other => Err(CoreError::log_corruption(
                "buffer",
                frame.offset,
                format!("unknown record kind {other}"),
            )),
        }
    }
}
