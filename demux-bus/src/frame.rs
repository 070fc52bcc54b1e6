use std::fmt::{Display, Formatter};

/// Decoded PCM for one stream, planar `f32`, one `Vec` per channel.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBuffer {
    pub stream_id: usize,
    pub sample_rate: u32,
    pub timestamp_us: i64,
    pub channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Display for AudioBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "stream={} ts={}us {}ch x {} @ {}Hz",
            self.stream_id,
            self.timestamp_us,
            self.channel_count(),
            self.frames(),
            self.sample_rate
        )
    }
}
