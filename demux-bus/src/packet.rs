use std::{
    fmt::{Display, Formatter},
    sync::Arc,
};

use bytes::Bytes;

use crate::stream::LogicalStream;

/// One demuxed packet with its timing converted to seconds.
///
/// `data` is owned: the engine may reuse its packet memory on the next read.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameRecord {
    pub stream: Arc<LogicalStream>,
    pub data: Bytes,
    pub presentation_timestamp_seconds: f64,
    pub duration_seconds: f64,
}

impl FrameRecord {
    pub fn stream_id(&self) -> usize {
        self.stream.id()
    }

    pub fn timestamp_us(&self) -> i64 {
        (self.presentation_timestamp_seconds * 1e6).round() as i64
    }

    pub fn duration_us(&self) -> i64 {
        (self.duration_seconds * 1e6).round() as i64
    }
}

impl AsRef<[u8]> for FrameRecord {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Display for FrameRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "stream={} pts={:.6}s dur={:.6}s size={}",
            self.stream.id(),
            self.presentation_timestamp_seconds,
            self.duration_seconds,
            self.data.len()
        )
    }
}
