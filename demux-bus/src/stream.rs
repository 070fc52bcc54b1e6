use std::fmt::{Display, Formatter};

use bytes::Bytes;

/// Rational tick length of a stream, in seconds per tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    pub fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// `ticks * num / den`; a zero denominator yields 0.
    pub fn to_seconds(&self, ticks: i64) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        ticks as f64 * self.num as f64 / self.den as f64
    }
}

impl Display for TimeBase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Codec parameters read from the container, passed through to the decoder
/// untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodecDescriptor {
    pub name: String,
    pub bits_per_sample: Option<u32>,
    pub frames_per_packet: Option<u64>,
    pub extra_data: Bytes,
}

impl CodecDescriptor {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// One audio track of the container, identified by its index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalStream {
    id: usize,
    channel_count: u32,
    sample_rate: u32,
    time_base: TimeBase,
    codec: CodecDescriptor,
}

impl LogicalStream {
    pub fn new(id: usize, channel_count: u32, sample_rate: u32, time_base: TimeBase) -> Self {
        Self {
            id,
            channel_count,
            sample_rate,
            time_base,
            codec: CodecDescriptor::default(),
        }
    }

    pub fn with_codec(mut self, codec: CodecDescriptor) -> Self {
        self.codec = codec;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }
    pub fn channel_count(&self) -> u32 {
        self.channel_count
    }
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
    pub fn time_base(&self) -> TimeBase {
        self.time_base
    }
    pub fn codec(&self) -> &CodecDescriptor {
        &self.codec
    }
}

impl Display for LogicalStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} {} {}ch {}Hz tb={}",
            self.id, self.codec.name, self.channel_count, self.sample_rate, self.time_base
        )
    }
}
