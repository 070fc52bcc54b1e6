//! Scripted engine, decoder and transformer used by the unit tests.

use std::{
    io::Read,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::{
    decoder::{
        AudioDecodeSession, AudioDecoderService, DecodeError, DecoderCallbacks, DecoderConfig,
        EncodedAudioChunk,
    },
    engine::{DemuxEngine, PacketInfo, ReadStatus},
    error::{PipelineError, Result},
    frame::AudioBuffer,
    reader::ByteReader,
    stream::{CodecDescriptor, LogicalStream, TimeBase},
    transform::{ShutdownReason, TransformController, Transformer},
};

const MAGIC: &[u8; 4] = b"MOCK";
const NO_VALUE: i64 = i64::MIN;
/// Stream byte that ends the container; anything after it is trailing data.
pub const END_MARKER: u8 = 0xFF;

pub struct MockStream {
    pub channels: u8,
    pub sample_rate: u32,
    pub time_base: (i32, i32),
}

pub struct MockPacket {
    pub stream: u8,
    pub pts: Option<i64>,
    pub duration: Option<i64>,
    pub payload: Vec<u8>,
}

impl MockPacket {
    pub fn new(stream: u8, pts: i64, duration: i64, payload: &[u8]) -> Self {
        Self {
            stream,
            pts: Some(pts),
            duration: Some(duration),
            payload: payload.to_vec(),
        }
    }
}

/// Serialises the toy container understood by [`MockEngine`].
pub fn encode_container(streams: &[MockStream], packets: &[MockPacket]) -> Bytes {
    let mut out = BytesMut::new();
    out.put_slice(MAGIC);
    out.put_u8(streams.len() as u8);
    for s in streams {
        out.put_u8(s.channels);
        out.put_u32_le(s.sample_rate);
        out.put_i32_le(s.time_base.0);
        out.put_i32_le(s.time_base.1);
    }
    for p in packets {
        out.put_u8(p.stream);
        out.put_i64_le(p.pts.unwrap_or(NO_VALUE));
        out.put_i64_le(p.duration.unwrap_or(NO_VALUE));
        out.put_u32_le(p.payload.len() as u32);
        out.put_slice(&p.payload);
    }
    out.freeze()
}

pub fn stereo_48k() -> MockStream {
    MockStream {
        channels: 2,
        sample_rate: 48000,
        time_base: (1, 48000),
    }
}

#[derive(Debug, Default)]
pub struct EngineCounters {
    pub allocs: AtomicUsize,
    pub releases: AtomicUsize,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub unrefs: AtomicUsize,
    pub reads: AtomicUsize,
}

impl EngineCounters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Every alloc released and every open closed.
    pub fn balanced(&self) -> bool {
        Self::get(&self.allocs) == Self::get(&self.releases)
            && Self::get(&self.opens) == Self::get(&self.closes)
    }
}

#[derive(Default)]
pub struct MockEngine {
    pub counters: Arc<EngineCounters>,
    pub fail_alloc: bool,
    /// `read_frame` call (0-based) that reports an error.
    pub fail_at_read: Option<usize>,
}

impl MockEngine {
    pub fn new() -> (Self, Arc<EngineCounters>) {
        let engine = Self::default();
        let counters = engine.counters.clone();
        (engine, counters)
    }
}

pub struct MockContext {
    reader: ByteReader,
    streams: Vec<LogicalStream>,
    read_calls: usize,
}

#[derive(Default)]
pub struct MockPacketHandle {
    payload: Vec<u8>,
    info: Option<PacketInfo>,
}

fn read_u8(r: &mut ByteReader) -> std::io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(r: &mut ByteReader) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32(r: &mut ByteReader) -> std::io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_i64(r: &mut ByteReader) -> std::io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

fn optional(value: i64) -> Option<i64> {
    (value != NO_VALUE).then_some(value)
}

impl DemuxEngine for MockEngine {
    type Context = MockContext;
    type Packet = MockPacketHandle;

    fn alloc_packet(&mut self) -> Option<MockPacketHandle> {
        if self.fail_alloc {
            return None;
        }
        self.counters.allocs.fetch_add(1, Ordering::SeqCst);
        Some(MockPacketHandle::default())
    }

    fn open(&mut self, mut input: ByteReader) -> anyhow::Result<MockContext> {
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if &magic != MAGIC {
            anyhow::bail!("not a mock container");
        }
        let count = read_u8(&mut input)?;
        let mut streams = Vec::new();
        for id in 0..count as usize {
            let channels = read_u8(&mut input)?;
            let rate = read_u32(&mut input)?;
            let num = read_i32(&mut input)?;
            let den = read_i32(&mut input)?;
            streams.push(
                LogicalStream::new(id, channels as u32, rate, TimeBase::new(num, den))
                    .with_codec(CodecDescriptor::named("mock")),
            );
        }
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(MockContext {
            reader: input,
            streams,
            read_calls: 0,
        })
    }

    fn enumerate_streams(&mut self, ctx: &MockContext) -> Vec<LogicalStream> {
        ctx.streams.clone()
    }

    fn read_frame(&mut self, ctx: &mut MockContext, packet: &mut MockPacketHandle) -> ReadStatus {
        let call = ctx.read_calls;
        ctx.read_calls += 1;
        if self.fail_at_read == Some(call) {
            return ReadStatus::Error("corrupt packet".into());
        }

        let mut first = [0u8; 1];
        match ctx.reader.read(&mut first) {
            Ok(0) => return ReadStatus::EndOfStream,
            Ok(_) if first[0] == END_MARKER => return ReadStatus::EndOfStream,
            Ok(_) => {}
            Err(e) => return ReadStatus::Error(e.to_string()),
        }
        let record = (|| -> std::io::Result<(i64, i64, Vec<u8>)> {
            let pts = read_i64(&mut ctx.reader)?;
            let duration = read_i64(&mut ctx.reader)?;
            let len = read_u32(&mut ctx.reader)?;
            let mut payload = vec![0u8; len as usize];
            ctx.reader.read_exact(&mut payload)?;
            Ok((pts, duration, payload))
        })();
        match record {
            Ok((pts, duration, payload)) => {
                packet.payload = payload;
                packet.info = Some(PacketInfo {
                    stream_index: first[0] as usize,
                    pts: optional(pts),
                    duration: optional(duration),
                });
                self.counters.reads.fetch_add(1, Ordering::SeqCst);
                ReadStatus::Ok
            }
            Err(e) => ReadStatus::Error(format!("truncated packet: {}", e)),
        }
    }

    fn packet_payload<'p>(&self, packet: &'p MockPacketHandle) -> &'p [u8] {
        &packet.payload
    }

    fn packet_info(&self, packet: &MockPacketHandle) -> PacketInfo {
        packet.info.unwrap_or(PacketInfo {
            stream_index: 0,
            pts: None,
            duration: None,
        })
    }

    fn unref_packet(&mut self, packet: &mut MockPacketHandle) {
        packet.payload.clear();
        packet.info = None;
        self.counters.unrefs.fetch_add(1, Ordering::SeqCst);
    }

    fn release_packet(&mut self, _packet: MockPacketHandle) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&mut self, _ctx: MockContext) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// What the mock decoder saw, shared by all of its sessions.
#[derive(Debug, Default)]
pub struct DecoderLog {
    pub created: AtomicUsize,
    pub configs: Mutex<Vec<DecoderConfig>>,
    pub submits: Mutex<Vec<EncodedAudioChunk>>,
    pub flushes: AtomicUsize,
    pub closes: AtomicUsize,
}

/// Emits one buffer per submitted chunk. A stream whose codec is named
/// `"broken"` reports an error through the callback instead.
#[derive(Default)]
pub struct MockDecoderService {
    pub log: Arc<DecoderLog>,
}

pub struct MockDecodeSession {
    log: Arc<DecoderLog>,
    callbacks: DecoderCallbacks,
    config: Option<DecoderConfig>,
}

impl AudioDecoderService for MockDecoderService {
    type Session = MockDecodeSession;

    fn create(&mut self, callbacks: DecoderCallbacks) -> MockDecodeSession {
        self.log.created.fetch_add(1, Ordering::SeqCst);
        MockDecodeSession {
            log: self.log.clone(),
            callbacks,
            config: None,
        }
    }
}

#[async_trait]
impl AudioDecodeSession for MockDecodeSession {
    fn configure(&mut self, config: &DecoderConfig) -> std::result::Result<(), DecodeError> {
        self.log.configs.lock().push(config.clone());
        self.config = Some(config.clone());
        Ok(())
    }

    fn submit(&mut self, chunk: EncodedAudioChunk) -> std::result::Result<(), DecodeError> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| DecodeError::new("not configured"))?;
        self.log.submits.lock().push(chunk.clone());
        if config.codec.name == "broken" {
            (self.callbacks.error)(DecodeError::new("bitstream error"));
            return Ok(());
        }
        (self.callbacks.output)(AudioBuffer {
            stream_id: usize::MAX,
            sample_rate: config.sample_rate,
            timestamp_us: chunk.timestamp_us,
            channels: vec![vec![0.0; chunk.data.len()]; config.channel_count as usize],
        });
        Ok(())
    }

    async fn flush(&mut self) -> std::result::Result<(), DecodeError> {
        tokio::task::yield_now().await;
        self.log.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Forwards every chunk; records the close hook calls.
#[derive(Clone, Default)]
pub struct Passthrough {
    pub hooks: Arc<Mutex<Vec<ShutdownReason>>>,
    pub fail_on: Option<Bytes>,
    pub terminate_on: Option<Bytes>,
    pub fail_start: bool,
}

#[async_trait]
impl Transformer<Bytes, Bytes> for Passthrough {
    async fn start(&mut self, _controller: &TransformController<Bytes>) -> Result<()> {
        if self.fail_start {
            return Err(PipelineError::transform("start refused"));
        }
        Ok(())
    }

    async fn transform(&mut self, chunk: Bytes, controller: &TransformController<Bytes>) -> Result<()> {
        if self.fail_on.as_ref() == Some(&chunk) {
            return Err(PipelineError::transform("bad chunk"));
        }
        if self.terminate_on.as_ref() == Some(&chunk) {
            controller.terminate();
            return Ok(());
        }
        controller.send(chunk).await
    }

    async fn close(&mut self, reason: &ShutdownReason) {
        self.hooks.lock().push(reason.clone());
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
