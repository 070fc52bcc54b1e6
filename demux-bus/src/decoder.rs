use std::{
    collections::{BTreeMap, btree_map::Entry},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    duplex::ShutdownAwareStream,
    error::{PipelineError, Result},
    frame::AudioBuffer,
    options::PipelineOptions,
    packet::FrameRecord,
    queue::QueuingStrategy,
    stream::CodecDescriptor,
    transform::{ShutdownReason, TransformController, Transformer},
};

/// Failure reported by a decode session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DecodeError(pub String);

impl DecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderConfig {
    pub codec: CodecDescriptor,
    pub channel_count: u32,
    pub sample_rate: u32,
}

/// One encoded unit handed to a session. Every chunk is a key unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedAudioChunk {
    pub data: Bytes,
    pub timestamp_us: i64,
    pub duration_us: i64,
    pub is_key: bool,
}

/// Where a session delivers its results. Both may be called from
/// `submit` or `flush`.
pub struct DecoderCallbacks {
    pub output: Box<dyn Fn(AudioBuffer) + Send + Sync>,
    pub error: Box<dyn Fn(DecodeError) + Send + Sync>,
}

#[async_trait]
pub trait AudioDecodeSession: Send {
    fn configure(&mut self, config: &DecoderConfig) -> std::result::Result<(), DecodeError>;

    fn submit(&mut self, chunk: EncodedAudioChunk) -> std::result::Result<(), DecodeError>;

    /// Emits everything still buffered.
    async fn flush(&mut self) -> std::result::Result<(), DecodeError>;

    fn close(&mut self);
}

/// Platform audio decoding service.
pub trait AudioDecoderService: Send + 'static {
    type Session: AudioDecodeSession + 'static;

    fn create(&mut self, callbacks: DecoderCallbacks) -> Self::Session;
}

struct SessionEntry<S> {
    session: S,
    failure: Arc<Mutex<Option<DecodeError>>>,
}

impl<S> SessionEntry<S> {
    fn record(&self, error: DecodeError) {
        self.failure.lock().get_or_insert(error);
    }

    fn failed(&self) -> bool {
        self.failure.lock().is_some()
    }
}

/// Decodes frame records with one lazily created session per stream.
pub struct DecodeTransformer<S: AudioDecoderService> {
    service: S,
    sessions: BTreeMap<usize, SessionEntry<S::Session>>,
}

impl<S: AudioDecoderService> DecodeTransformer<S> {
    pub fn new(service: S) -> Self {
        Self {
            service,
            sessions: BTreeMap::new(),
        }
    }
}

#[async_trait]
impl<S: AudioDecoderService> Transformer<FrameRecord, AudioBuffer> for DecodeTransformer<S> {
    async fn transform(
        &mut self,
        frame: FrameRecord,
        controller: &TransformController<AudioBuffer>,
    ) -> Result<()> {
        let stream_id = frame.stream_id();
        let entry = match self.sessions.entry(stream_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => {
                let failure = Arc::new(Mutex::new(None));
                let output = controller.clone();
                let errors = failure.clone();
                let callbacks = DecoderCallbacks {
                    output: Box::new(move |mut buffer: AudioBuffer| {
                        buffer.stream_id = stream_id;
                        if let Err(e) = output.enqueue(buffer) {
                            log::debug!("decoder: dropping output of stream {}: {}", stream_id, e);
                        }
                    }),
                    error: Box::new(move |e: DecodeError| {
                        log::error!("decoder: stream {} error: {}", stream_id, e);
                        errors.lock().get_or_insert(e);
                    }),
                };

                let stream = &frame.stream;
                let config = DecoderConfig {
                    codec: stream.codec().clone(),
                    channel_count: stream.channel_count(),
                    sample_rate: stream.sample_rate(),
                };
                log::info!("decoder: creating session for stream {}", stream);
                let session = self.service.create(callbacks);
                let mut entry = SessionEntry { session, failure };
                if let Err(e) = entry.session.configure(&config) {
                    log::error!("decoder: configure failed for stream {}: {}", stream_id, e);
                    entry.record(e);
                }
                slot.insert(entry)
            }
        };

        if entry.failed() {
            log::trace!("decoder: stream {} failed, skipping frame", stream_id);
            return Ok(());
        }
        let chunk = EncodedAudioChunk {
            timestamp_us: frame.timestamp_us(),
            duration_us: frame.duration_us(),
            data: frame.data,
            is_key: true,
        };
        if let Err(e) = entry.session.submit(chunk) {
            log::error!("decoder: submit failed for stream {}: {}", stream_id, e);
            entry.record(e);
        }
        Ok(())
    }

    async fn flush(&mut self, _controller: &TransformController<AudioBuffer>) -> Result<()> {
        let sessions = std::mem::take(&mut self.sessions);
        let outcomes = join_all(sessions.into_iter().map(|(stream_id, mut entry)| async move {
            let flushed = entry.session.flush().await;
            entry.session.close();
            let recorded = entry.failure.lock().take();
            let outcome = match recorded {
                Some(e) => Err(e),
                None => flushed,
            };
            (stream_id, outcome)
        }))
        .await;

        let mut first = None;
        for (stream_id, outcome) in outcomes {
            if let Err(e) = outcome {
                log::error!("decoder: flush failed for stream {}: {}", stream_id, e);
                first.get_or_insert(PipelineError::DecodeSessionFailure {
                    stream_id,
                    message: e.0,
                });
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn close(&mut self, reason: &ShutdownReason) {
        if let ShutdownReason::Error(e) = reason {
            log::warn!("decoder: pipeline stopped: {}", e);
        }
        for (_, mut entry) in std::mem::take(&mut self.sessions) {
            entry.session.close();
        }
    }
}

/// Builds a frames-in, audio-out duplex stream. Must be called inside a
/// tokio runtime.
pub fn decoder<S: AudioDecoderService>(
    service: S,
    options: &PipelineOptions,
) -> ShutdownAwareStream<FrameRecord, AudioBuffer> {
    ShutdownAwareStream::with_strategies(
        DecodeTransformer::new(service),
        QueuingStrategy::count(options.writable_high_water_mark),
        QueuingStrategy::count(options.readable_high_water_mark),
    )
}

#[cfg(test)]
#[path = "decoder_test.rs"]
mod decoder_test;
