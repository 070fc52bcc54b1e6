use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    deferred::Deferred,
    duplex::{ReadableEnd, ShutdownAwareStream, WritableEnd},
    engine::{DemuxEngine, ReadStatus},
    error::{PipelineError, Result},
    options::PipelineOptions,
    packet::FrameRecord,
    queue::QueuingStrategy,
    reader::{ByteReader, byte_channel},
    signal::AbortSignal,
    stream::LogicalStream,
    transform::{ShutdownReason, TransformController, Transformer},
};

pub type StreamList = Vec<Arc<LogicalStream>>;

/// Resolves to the streams found when the container was opened.
#[derive(Clone, Debug)]
pub struct StreamsHandle(Arc<Deferred<Result<StreamList>>>);

impl StreamsHandle {
    /// Waits for the container to be opened. Empty input yields no streams;
    /// a pipeline that fails first yields its failure.
    pub async fn wait(&self) -> Result<StreamList> {
        self.0.wait().await
    }

    pub fn get(&self) -> Option<Result<StreamList>> {
        self.0.get()
    }
}

/// Feeds written bytes to a [`DemuxEngine`] on a blocking worker and emits a
/// [`FrameRecord`] per packet.
pub struct DemuxTransformer<E: DemuxEngine> {
    engine: Option<E>,
    byte_capacity: usize,
    bytes: Option<mpsc::Sender<Bytes>>,
    worker: Option<JoinHandle<Result<()>>>,
    /// The engine reached the end of the container; later input is ignored.
    drained: bool,
    streams: Arc<Deferred<Result<StreamList>>>,
}

impl<E: DemuxEngine> DemuxTransformer<E> {
    fn new(engine: E, byte_capacity: usize, streams: Arc<Deferred<Result<StreamList>>>) -> Self {
        Self {
            engine: Some(engine),
            byte_capacity,
            bytes: None,
            worker: None,
            drained: false,
            streams,
        }
    }

    async fn join_worker(&mut self) -> Result<()> {
        match self.worker.take() {
            Some(worker) => worker
                .await
                .map_err(|e| PipelineError::transform(format!("demux worker failed: {}", e)))?,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<E: DemuxEngine> Transformer<Bytes, FrameRecord> for DemuxTransformer<E> {
    async fn start(&mut self, controller: &TransformController<FrameRecord>) -> Result<()> {
        let mut engine = self
            .engine
            .take()
            .ok_or_else(|| PipelineError::transform("demuxer already started"))?;
        let Some(packet) = engine.alloc_packet() else {
            log::error!("demuxer: unable to allocate packet");
            return Err(PipelineError::AllocationFailure);
        };

        let (tx, reader) = byte_channel(self.byte_capacity);
        self.bytes = Some(tx);

        let mut pump = PumpState {
            engine,
            packet: Some(packet),
            context: None,
        };
        let controller = controller.clone();
        let streams = self.streams.clone();
        self.worker = Some(tokio::task::spawn_blocking(move || {
            let result = pump.run(reader, &controller, &streams);
            pump.release();
            match &result {
                Ok(()) => {
                    streams.set(Ok(Vec::new()));
                    log::info!("demuxer: input fully demuxed");
                }
                Err(e) => {
                    streams.set(Err(e.clone()));
                    controller.error(e.clone());
                }
            }
            result
        }));
        Ok(())
    }

    async fn transform(
        &mut self,
        chunk: Bytes,
        _controller: &TransformController<FrameRecord>,
    ) -> Result<()> {
        if self.drained {
            log::trace!("demuxer: discarding {} trailing bytes", chunk.len());
            return Ok(());
        }
        let Some(bytes) = &self.bytes else {
            return Err(PipelineError::Closed);
        };
        let len = chunk.len();
        if bytes.send(chunk).await.is_err() {
            // the engine stopped reading; its outcome decides this write's
            self.bytes = None;
            self.join_worker().await?;
            self.drained = true;
            log::debug!("demuxer: container ended, discarding {} trailing bytes", len);
        }
        Ok(())
    }

    async fn flush(&mut self, _controller: &TransformController<FrameRecord>) -> Result<()> {
        self.bytes = None;
        self.join_worker().await
    }

    async fn close(&mut self, reason: &ShutdownReason) {
        self.bytes = None;
        if let ShutdownReason::Error(e) = reason {
            log::warn!("demuxer: pipeline stopped: {}", e);
            self.streams.set(Err(e.clone()));
        }
    }
}

/// Engine resources owned by the blocking worker. Both are released at most
/// once, on whichever path ends the worker.
struct PumpState<E: DemuxEngine> {
    engine: E,
    packet: Option<E::Packet>,
    context: Option<E::Context>,
}

impl<E: DemuxEngine> PumpState<E> {
    fn run(
        &mut self,
        mut reader: ByteReader,
        controller: &TransformController<FrameRecord>,
        published: &Deferred<Result<StreamList>>,
    ) -> Result<()> {
        let signal = controller.signal();
        if reader.at_end() {
            log::info!("demuxer: input ended before any data, nothing to open");
            published.set(Ok(Vec::new()));
            return Ok(());
        }
        check_aborted(signal)?;

        let context = self.engine.open(reader).map_err(|e| {
            log::error!("demuxer: open failed: {:#}", e);
            PipelineError::EngineOpenFailure(format!("{:#}", e))
        })?;
        let context = self.context.insert(context);

        let streams: StreamList = self
            .engine
            .enumerate_streams(context)
            .into_iter()
            .map(Arc::new)
            .collect();
        for stream in &streams {
            log::info!("demuxer: found stream {}", stream);
        }
        published.set(Ok(streams.clone()));

        // where the next frame of each stream starts, for packets without pts
        let mut next_pts: HashMap<usize, f64> = HashMap::new();
        loop {
            check_aborted(signal)?;
            let (Some(context), Some(packet)) = (self.context.as_mut(), self.packet.as_mut()) else {
                return Err(PipelineError::transform("demuxer resources already released"));
            };

            match self.engine.read_frame(context, packet) {
                ReadStatus::Ok => {
                    let data = Bytes::copy_from_slice(self.engine.packet_payload(packet));
                    let info = self.engine.packet_info(packet);
                    self.engine.unref_packet(packet);

                    let stream = streams
                        .iter()
                        .find(|s| s.id() == info.stream_index)
                        .cloned()
                        .ok_or_else(|| {
                            PipelineError::EngineReadFailure(format!(
                                "packet for unknown stream {}",
                                info.stream_index
                            ))
                        })?;
                    let time_base = stream.time_base();
                    let pts = match info.pts {
                        Some(ticks) => time_base.to_seconds(ticks),
                        None => next_pts.get(&stream.id()).copied().unwrap_or(0.0),
                    };
                    let duration = info.duration.map(|d| time_base.to_seconds(d)).unwrap_or(0.0);
                    next_pts.insert(stream.id(), pts + duration);

                    let frame = FrameRecord {
                        stream,
                        data,
                        presentation_timestamp_seconds: pts,
                        duration_seconds: duration,
                    };
                    log::trace!("demuxer: {}", frame);
                    controller.blocking_send(frame)?;
                }
                ReadStatus::EndOfStream => {
                    if let Some(context) = self.context.take() {
                        self.engine.close(context);
                    }
                    return Ok(());
                }
                ReadStatus::Error(message) => {
                    log::error!("demuxer: read failed: {}", message);
                    return Err(PipelineError::EngineReadFailure(message));
                }
            }
        }
    }

    fn release(&mut self) {
        if let Some(context) = self.context.take() {
            self.engine.close(context);
        }
        if let Some(packet) = self.packet.take() {
            self.engine.release_packet(packet);
        }
    }
}

impl<E: DemuxEngine> Drop for PumpState<E> {
    fn drop(&mut self) {
        self.release();
    }
}

fn check_aborted(signal: &AbortSignal) -> Result<()> {
    if signal.is_aborted() {
        return Err(signal
            .reason()
            .unwrap_or_else(|| PipelineError::aborted("signal fired")));
    }
    Ok(())
}

/// A bytes-in, frames-out duplex stream around one engine instance.
pub struct Demuxer {
    stream: ShutdownAwareStream<Bytes, FrameRecord>,
    streams: StreamsHandle,
}

impl Demuxer {
    /// Streams found at open; see [`StreamsHandle::wait`].
    pub async fn streams(&self) -> Result<StreamList> {
        self.streams.wait().await
    }

    pub fn streams_handle(&self) -> StreamsHandle {
        self.streams.clone()
    }

    pub fn writable(&self) -> &WritableEnd<Bytes> {
        self.stream.writable()
    }

    pub fn readable(&mut self) -> &mut ReadableEnd<FrameRecord> {
        self.stream.readable()
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        self.stream.abort_signal()
    }

    pub fn into_parts(self) -> (WritableEnd<Bytes>, ReadableEnd<FrameRecord>) {
        self.stream.into_parts()
    }
}

/// Builds a demuxer over `engine`. Must be called inside a tokio runtime.
pub fn demuxer<E: DemuxEngine>(engine: E, options: &PipelineOptions) -> Demuxer {
    let streams = Arc::new(Deferred::new());
    let transformer = DemuxTransformer::new(engine, options.byte_channel_capacity, streams.clone());
    let stream = ShutdownAwareStream::with_strategies(
        transformer,
        QueuingStrategy::count(options.writable_high_water_mark),
        QueuingStrategy::count(options.readable_high_water_mark),
    );
    Demuxer {
        stream,
        streams: StreamsHandle(streams),
    }
}

#[cfg(test)]
#[path = "demux_test.rs"]
mod demux_test;
