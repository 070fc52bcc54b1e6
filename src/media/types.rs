use std::sync::Arc;

use bytes::Bytes;
use demux_bus::{AudioBuffer, FrameRecord, LogicalStream, PipelineOptions};

/// Input configuration
#[derive(Clone, Debug)]
pub enum InputConfig {
    File { path: String },
    /// Already loaded container bytes
    Memory { data: Bytes },
}

impl InputConfig {
    /// File extension, used as a probe hint.
    pub fn extension(&self) -> Option<&str> {
        match self {
            InputConfig::File { path } => std::path::Path::new(path)
                .extension()
                .and_then(|ext| ext.to_str()),
            InputConfig::Memory { .. } => None,
        }
    }
}

/// Pipeline configuration
#[derive(Clone, Debug)]
pub struct PipeConfig {
    pub input: InputConfig,
    // bytes per write into the demuxer
    pub chunk_size: usize,
    // run the decode stage after the demuxer
    pub decode: bool,
    pub options: PipelineOptions,
}

/// What the pipe hands to its caller, in order.
#[derive(Clone, Debug)]
pub enum PipeEvent {
    Frame(FrameRecord),
    Audio(AudioBuffer),
}

#[derive(Clone, Debug, Default)]
pub struct PipeSummary {
    pub streams: Vec<Arc<LogicalStream>>,
    pub frames: usize,
    pub bytes: usize,
    pub buffers: usize,
    // decoded samples per channel
    pub samples: usize,
}

impl PipeSummary {
    pub fn record(&mut self, event: &PipeEvent) {
        match event {
            PipeEvent::Frame(frame) => {
                self.frames += 1;
                self.bytes += frame.data.len();
            }
            PipeEvent::Audio(buffer) => {
                self.buffers += 1;
                self.samples += buffer.frames();
            }
        }
    }
}
