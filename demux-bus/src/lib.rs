//! Streaming audio demux pipeline: bytes in, timestamped frames out,
//! optionally decoded audio out, with backpressure and a shutdown hook that
//! runs exactly once.

pub mod backend;
pub mod decoder;
pub mod deferred;
pub mod demux;
pub mod duplex;
pub mod engine;
pub mod error;
pub mod frame;
pub mod monitor;
pub mod options;
pub mod packet;
pub mod pipe;
mod queue;
pub mod reader;
pub mod signal;
pub mod stream;
pub mod transform;

#[cfg(test)]
pub(crate) mod test_support;

pub use decoder::{AudioDecodeSession, AudioDecoderService, decoder};
pub use demux::{Demuxer, StreamsHandle, demuxer};
pub use duplex::{ReadableEnd, ShutdownAwareStream, WritableEnd};
pub use engine::DemuxEngine;
pub use error::{PipelineError, Result};
pub use frame::AudioBuffer;
pub use options::PipelineOptions;
pub use packet::FrameRecord;
pub use queue::QueuingStrategy;
pub use signal::AbortSignal;
pub use stream::{LogicalStream, TimeBase};

/// Registers FFmpeg components. Call once at startup when using the FFmpeg
/// back end.
#[cfg(feature = "ffmpeg")]
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}
