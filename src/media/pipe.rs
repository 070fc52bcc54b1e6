use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use demux_bus::{decoder, demuxer, pipe::pipe, PipelineError, PipelineOptions, ReadableEnd};
use futures::{stream::BoxStream, StreamExt};
use tokio_util::{io::ReaderStream, sync::CancellationToken};

use crate::media::types::{InputConfig, PipeConfig, PipeEvent, PipeSummary};

#[cfg(feature = "ffmpeg")]
use demux_bus::backend::{FfmpegDecoderService, FfmpegEngine};
#[cfg(all(feature = "symphonia", not(feature = "ffmpeg")))]
use demux_bus::backend::{SymphoniaDecoderService, SymphoniaEngine};

type ByteSource = BoxStream<'static, std::io::Result<Bytes>>;

/// Pipeline: streams one input through the demuxer and, optionally, the decoder
pub struct Pipe {
    config: PipeConfig,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl Pipe {
    pub fn new(config: PipeConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Aborts a running pipeline; a later `run` fails at once.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Check if the pipeline is running
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    /// Check if the pipeline has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs the pipeline to the end, handing every frame (or decoded buffer)
    /// to `on_event` as it arrives.
    pub async fn run<F>(&self, on_event: F) -> anyhow::Result<PipeSummary>
    where
        F: FnMut(&PipeEvent),
    {
        if self.started.swap(true, Ordering::Relaxed) {
            anyhow::bail!("pipe already started");
        }

        log::info!("Pipe: starting with input {}", input_name(&self.config.input));
        let result = self.run_inner(on_event).await;
        match &result {
            Ok(summary) => log::info!(
                "Pipe: finished, {} frames ({} bytes), {} buffers",
                summary.frames,
                summary.bytes,
                summary.buffers
            ),
            Err(e) => log::warn!("Pipe: stopped: {:#}", e),
        }

        self.started.store(false, Ordering::Relaxed);
        result
    }

    async fn run_inner<F>(&self, mut on_event: F) -> anyhow::Result<PipeSummary>
    where
        F: FnMut(&PipeEvent),
    {
        let source = open_input(&self.config.input, self.config.chunk_size).await?;
        let options = &self.config.options;

        let demuxer = demuxer(new_engine(&self.config.input), options);
        let streams = demuxer.streams_handle();
        let signal = demuxer.abort_signal().clone();
        let (writable, frames) = demuxer.into_parts();

        let cancel = self.cancel.clone();
        let watcher = tokio::spawn(async move {
            cancel.cancelled().await;
            log::info!("Pipe: cancelled");
            signal.abort(PipelineError::aborted("pipe cancelled"));
        });
        let feeder = tokio::spawn(async move { pipe(source, &writable).await });

        let mut summary = PipeSummary::default();
        let mut emit = |event: PipeEvent| {
            summary.record(&event);
            on_event(&event);
        };
        let drained = if self.config.decode {
            let audio = frames.pipe_through(decoder(new_decoder_service(), options));
            drain(audio, |buffer| emit(PipeEvent::Audio(buffer))).await
        } else {
            drain(frames, |frame| emit(PipeEvent::Frame(frame))).await
        };
        watcher.abort();

        let fed = feeder.await?;
        drained?;
        fed?;

        summary.streams = streams.get().and_then(Result::ok).unwrap_or_default();
        Ok(summary)
    }
}

async fn drain<T: Send + 'static>(
    mut readable: ReadableEnd<T>,
    mut each: impl FnMut(T),
) -> demux_bus::Result<()> {
    while let Some(item) = readable.read().await {
        each(item?);
    }
    Ok(())
}

async fn open_input(input: &InputConfig, chunk_size: usize) -> anyhow::Result<ByteSource> {
    let chunk_size = chunk_size.max(1);
    match input {
        InputConfig::File { path } => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| anyhow::anyhow!("open {}: {}", path, e))?;
            Ok(ReaderStream::with_capacity(file, chunk_size).boxed())
        }
        InputConfig::Memory { data } => {
            let chunks: Vec<std::io::Result<Bytes>> = (0..data.len())
                .step_by(chunk_size)
                .map(|at| Ok(data.slice(at..(at + chunk_size).min(data.len()))))
                .collect();
            Ok(futures::stream::iter(chunks).boxed())
        }
    }
}

#[cfg(feature = "ffmpeg")]
fn new_engine(_input: &InputConfig) -> FfmpegEngine {
    FfmpegEngine::new()
}

#[cfg(feature = "ffmpeg")]
fn new_decoder_service() -> FfmpegDecoderService {
    FfmpegDecoderService
}

#[cfg(all(feature = "symphonia", not(feature = "ffmpeg")))]
fn new_engine(input: &InputConfig) -> SymphoniaEngine {
    match input.extension() {
        Some(ext) => SymphoniaEngine::new().with_extension(ext),
        None => SymphoniaEngine::new(),
    }
}

#[cfg(all(feature = "symphonia", not(feature = "ffmpeg")))]
fn new_decoder_service() -> SymphoniaDecoderService {
    SymphoniaDecoderService
}

/// Input name for logging
pub fn input_name(input: &InputConfig) -> String {
    match input {
        InputConfig::File { path } => path.clone(),
        InputConfig::Memory { data } => format!("memory ({} bytes)", data.len()),
    }
}

impl PipeConfig {
    pub fn builder() -> PipeConfigBuilder {
        PipeConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct PipeConfigBuilder {
    input: Option<InputConfig>,
    chunk_size: Option<usize>,
    decode: bool,
    options: PipelineOptions,
}

impl PipeConfigBuilder {
    /// Set file input source
    pub fn input_file(mut self, path: impl Into<String>) -> Self {
        self.input = Some(InputConfig::File { path: path.into() });
        self
    }

    /// Set in-memory input source
    pub fn input_memory(mut self, data: impl Into<Bytes>) -> Self {
        self.input = Some(InputConfig::Memory { data: data.into() });
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size.max(1));
        self
    }

    /// Pipe frames through the decoder
    pub fn decode(mut self, decode: bool) -> Self {
        self.decode = decode;
        self
    }

    pub fn options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> anyhow::Result<PipeConfig> {
        Ok(PipeConfig {
            input: self
                .input
                .ok_or_else(|| anyhow::anyhow!("input is required"))?,
            chunk_size: self.chunk_size.unwrap_or(64 * 1024),
            decode: self.decode,
            options: self.options,
        })
    }
}

#[cfg(test)]
#[path = "pipe_test.rs"]
mod pipe_test;
