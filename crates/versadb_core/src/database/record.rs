//! Revision log records.

use crate::error::{CoreError, CoreResult};
use crate::log::Frame;
use crate::types::RecordId;
use crate::write::Revision;
use serde::{Deserialize, Serialize};

/// One accepted change to a field, as persisted in the revision log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RevisionRecord {
    pub key: String,
    pub record: RecordId,
    pub revision: Revision,
}

impl RevisionRecord {
    pub(crate) const KIND: u8 = 1;

    pub(crate) fn from_frame(frame: &Frame) -> CoreResult<Self> {
        if frame.kind != Self::KIND {
            return Err(CoreError::log_corruption(
                "database",
                frame.offset,
                format!("unknown record kind {}", frame.kind),
            ));
        }
        frame.decode()
    }
}
