use std::{
    ffi::c_void,
    io::Read,
    os::raw::c_int,
    ptr,
};

use async_trait::async_trait;
use bytes::Bytes;
use ffmpeg_next::{
    ffi,
    format::Sample,
};

use crate::{
    decoder::{
        AudioDecodeSession, AudioDecoderService, DecodeError, DecoderCallbacks, DecoderConfig,
        EncodedAudioChunk,
    },
    engine::{DemuxEngine, PacketInfo, ReadStatus},
    frame::AudioBuffer,
    reader::ByteReader,
    stream::{CodecDescriptor, LogicalStream, TimeBase},
};

const IO_BUFFER_SIZE: usize = 32 * 1024;

/// AVIO read callback; `opaque` is the context's boxed [`ByteReader`].
unsafe extern "C" fn read_packet(opaque: *mut c_void, buf: *mut u8, buf_size: c_int) -> c_int {
    if opaque.is_null() || buf.is_null() || buf_size <= 0 {
        return ffi::AVERROR_EOF;
    }
    let reader = unsafe { &mut *(opaque as *mut ByteReader) };
    let out = unsafe { std::slice::from_raw_parts_mut(buf, buf_size as usize) };
    match reader.read(out) {
        Ok(0) => ffi::AVERROR_EOF,
        Ok(n) => n as c_int,
        Err(e) => {
            log::error!("ffmpeg: input read failed: {}", e);
            ffi::AVERROR_EXTERNAL
        }
    }
}

/// Demuxes with libavformat reading through a custom AVIO context.
#[derive(Clone, Copy, Debug, Default)]
pub struct FfmpegEngine;

impl FfmpegEngine {
    pub fn new() -> Self {
        Self
    }
}

pub struct FfmpegContext {
    format: *mut ffi::AVFormatContext,
    io: *mut ffi::AVIOContext,
    reader: *mut ByteReader,
    /// per stream index, whether packets of that stream are forwarded
    audio: Vec<bool>,
}

// owned exclusively by the demux worker
unsafe impl Send for FfmpegContext {}

impl Drop for FfmpegContext {
    fn drop(&mut self) {
        unsafe {
            if !self.format.is_null() {
                ffi::avformat_close_input(&mut self.format);
            }
            if !self.io.is_null() {
                // libavformat may have replaced the buffer we allocated
                ffi::av_freep(&mut (*self.io).buffer as *mut *mut u8 as *mut c_void);
                ffi::avio_context_free(&mut self.io);
            }
            if !self.reader.is_null() {
                drop(Box::from_raw(self.reader));
                self.reader = ptr::null_mut();
            }
        }
    }
}

pub struct FfmpegPacket(*mut ffi::AVPacket);

unsafe impl Send for FfmpegPacket {}

impl DemuxEngine for FfmpegEngine {
    type Context = FfmpegContext;
    type Packet = FfmpegPacket;

    fn alloc_packet(&mut self) -> Option<FfmpegPacket> {
        let packet = unsafe { ffi::av_packet_alloc() };
        if packet.is_null() {
            None
        } else {
            Some(FfmpegPacket(packet))
        }
    }

    fn open(&mut self, input: ByteReader) -> anyhow::Result<FfmpegContext> {
        let mut ctx = FfmpegContext {
            format: ptr::null_mut(),
            io: ptr::null_mut(),
            reader: Box::into_raw(Box::new(input)),
            audio: Vec::new(),
        };
        unsafe {
            let buffer = ffi::av_malloc(IO_BUFFER_SIZE) as *mut u8;
            if buffer.is_null() {
                return Err(anyhow::anyhow!("unable to allocate io buffer"));
            }
            ctx.io = ffi::avio_alloc_context(
                buffer,
                IO_BUFFER_SIZE as c_int,
                0,
                ctx.reader as *mut c_void,
                Some(read_packet),
                None,
                None,
            );
            if ctx.io.is_null() {
                ffi::av_free(buffer as *mut c_void);
                return Err(anyhow::anyhow!("unable to allocate io context"));
            }

            let format = ffi::avformat_alloc_context();
            if format.is_null() {
                return Err(anyhow::anyhow!("unable to allocate format context"));
            }
            (*format).pb = ctx.io;
            (*format).flags |= ffi::AVFMT_FLAG_CUSTOM_IO as c_int;
            ctx.format = format;

            // frees the format context and nulls the pointer on failure
            let ret = ffi::avformat_open_input(
                &mut ctx.format,
                ptr::null(),
                ptr::null(),
                ptr::null_mut(),
            );
            if ret < 0 {
                return Err(anyhow::anyhow!(
                    "avformat_open_input: {}",
                    ffmpeg_next::Error::from(ret)
                ));
            }
            let ret = ffi::avformat_find_stream_info(ctx.format, ptr::null_mut());
            if ret < 0 {
                return Err(anyhow::anyhow!(
                    "avformat_find_stream_info: {}",
                    ffmpeg_next::Error::from(ret)
                ));
            }

            let format = &*ctx.format;
            ctx.audio = (0..format.nb_streams as usize)
                .map(|i| {
                    let stream = *format.streams.add(i);
                    (*(*stream).codecpar).codec_type == ffi::AVMediaType::AVMEDIA_TYPE_AUDIO
                })
                .collect();
        }
        Ok(ctx)
    }

    fn enumerate_streams(&mut self, ctx: &FfmpegContext) -> Vec<LogicalStream> {
        let mut streams = Vec::new();
        for (index, _) in ctx.audio.iter().enumerate().filter(|(_, audio)| **audio) {
            unsafe {
                let stream = *(*ctx.format).streams.add(index);
                let par = &*(*stream).codecpar;
                let time_base = TimeBase::new((*stream).time_base.num, (*stream).time_base.den);
                let extra_data = if par.extradata.is_null() || par.extradata_size <= 0 {
                    Bytes::new()
                } else {
                    Bytes::copy_from_slice(std::slice::from_raw_parts(
                        par.extradata,
                        par.extradata_size as usize,
                    ))
                };
                let codec = CodecDescriptor {
                    name: ffmpeg_next::codec::Id::from(par.codec_id).name().to_string(),
                    bits_per_sample: (par.bits_per_raw_sample > 0)
                        .then_some(par.bits_per_raw_sample as u32),
                    frames_per_packet: (par.frame_size > 0).then_some(par.frame_size as u64),
                    extra_data,
                };
                streams.push(
                    LogicalStream::new(
                        index,
                        par.ch_layout.nb_channels.max(0) as u32,
                        par.sample_rate.max(0) as u32,
                        time_base,
                    )
                    .with_codec(codec),
                );
            }
        }
        streams
    }

    fn read_frame(&mut self, ctx: &mut FfmpegContext, packet: &mut FfmpegPacket) -> ReadStatus {
        loop {
            let ret = unsafe { ffi::av_read_frame(ctx.format, packet.0) };
            if ret == ffi::AVERROR_EOF {
                return ReadStatus::EndOfStream;
            }
            if ret < 0 {
                return ReadStatus::Error(ffmpeg_next::Error::from(ret).to_string());
            }
            let index = unsafe { (*packet.0).stream_index } as usize;
            if ctx.audio.get(index).copied().unwrap_or(false) {
                return ReadStatus::Ok;
            }
            unsafe { ffi::av_packet_unref(packet.0) };
        }
    }

    fn packet_payload<'p>(&self, packet: &'p FfmpegPacket) -> &'p [u8] {
        unsafe {
            let raw = &*packet.0;
            if raw.data.is_null() || raw.size <= 0 {
                &[]
            } else {
                std::slice::from_raw_parts(raw.data, raw.size as usize)
            }
        }
    }

    fn packet_info(&self, packet: &FfmpegPacket) -> PacketInfo {
        let raw = unsafe { &*packet.0 };
        PacketInfo {
            stream_index: raw.stream_index.max(0) as usize,
            pts: (raw.pts != ffi::AV_NOPTS_VALUE).then_some(raw.pts),
            // libavformat reports 0 for an unknown duration
            duration: (raw.duration > 0).then_some(raw.duration),
        }
    }

    fn unref_packet(&mut self, packet: &mut FfmpegPacket) {
        unsafe { ffi::av_packet_unref(packet.0) };
    }

    fn release_packet(&mut self, mut packet: FfmpegPacket) {
        unsafe { ffi::av_packet_free(&mut packet.0) };
    }

    fn close(&mut self, ctx: FfmpegContext) {
        drop(ctx);
    }
}

/// Decodes with libavcodec.
#[derive(Clone, Copy, Debug, Default)]
pub struct FfmpegDecoderService;

impl AudioDecoderService for FfmpegDecoderService {
    type Session = FfmpegDecodeSession;

    fn create(&mut self, callbacks: DecoderCallbacks) -> FfmpegDecodeSession {
        FfmpegDecodeSession {
            callbacks,
            decoder: None,
        }
    }
}

pub struct FfmpegDecodeSession {
    callbacks: DecoderCallbacks,
    decoder: Option<ffmpeg_next::decoder::Audio>,
}

impl FfmpegDecodeSession {
    fn open_decoder(config: &DecoderConfig) -> anyhow::Result<ffmpeg_next::decoder::Audio> {
        let codec = ffmpeg_next::decoder::find_by_name(&config.codec.name)
            .ok_or_else(|| anyhow::anyhow!("no decoder for codec {}", config.codec.name))?;

        let mut context = ffmpeg_next::codec::Context::new();
        unsafe {
            let raw = context.as_mut_ptr();
            (*raw).codec_type = ffi::AVMediaType::AVMEDIA_TYPE_AUDIO;
            (*raw).codec_id = codec.id().into();
            (*raw).sample_rate = config.sample_rate as c_int;
            (*raw).pkt_timebase = ffi::AVRational {
                num: 1,
                den: 1_000_000,
            };
            ffi::av_channel_layout_default(&mut (*raw).ch_layout, config.channel_count as c_int);
            if let Some(bits) = config.codec.bits_per_sample {
                (*raw).bits_per_coded_sample = bits as c_int;
            }

            let extra = &config.codec.extra_data;
            if !extra.is_empty() {
                let padded = extra.len() + ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
                let buf = ffi::av_mallocz(padded) as *mut u8;
                if buf.is_null() {
                    return Err(anyhow::anyhow!("unable to allocate extradata"));
                }
                ptr::copy_nonoverlapping(extra.as_ptr(), buf, extra.len());
                (*raw).extradata = buf;
                (*raw).extradata_size = extra.len() as c_int;
            }
        }
        Ok(context.decoder().audio()?)
    }
}

fn drain(decoder: &mut ffmpeg_next::decoder::Audio, callbacks: &DecoderCallbacks) {
    let mut frame = ffmpeg_next::frame::Audio::empty();
    loop {
        match decoder.receive_frame(&mut frame) {
            Ok(()) => match planar_f32(&frame) {
                Ok(channels) => (callbacks.output)(AudioBuffer {
                    stream_id: 0,
                    sample_rate: frame.rate(),
                    timestamp_us: frame.pts().unwrap_or(0),
                    channels,
                }),
                Err(e) => (callbacks.error)(e),
            },
            Err(ffmpeg_next::Error::Eof) => break,
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                break;
            }
            Err(e) => {
                (callbacks.error)(DecodeError::new(e.to_string()));
                break;
            }
        }
    }
}

/// Converts any integer or float layout to planar `f32`.
fn planar_f32(frame: &ffmpeg_next::frame::Audio) -> Result<Vec<Vec<f32>>, DecodeError> {
    let channels = unsafe { (*frame.as_ptr()).ch_layout.nb_channels }.max(0) as usize;
    let samples = frame.samples();
    let (width, convert): (usize, fn(&[u8]) -> f32) = match frame.format() {
        Sample::U8(_) => (1, |b| (b[0] as f32 - 128.0) / 128.0),
        Sample::I16(_) => (2, |b| i16::from_ne_bytes([b[0], b[1]]) as f32 / 32768.0),
        Sample::I32(_) => (4, |b| {
            i32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as f32 / 2_147_483_648.0
        }),
        Sample::F32(_) => (4, |b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
        Sample::F64(_) => (8, |b| {
            f64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32
        }),
        other => {
            return Err(DecodeError::new(format!("unsupported sample format {:?}", other)));
        }
    };

    let planar = frame.is_planar();
    let mut out = Vec::with_capacity(channels);
    for ch in 0..channels {
        let data = frame.data(if planar { ch } else { 0 });
        let mut plane = Vec::with_capacity(samples);
        for i in 0..samples {
            let offset = if planar { i * width } else { (i * channels + ch) * width };
            let bytes = data
                .get(offset..offset + width)
                .ok_or_else(|| DecodeError::new("frame shorter than its sample count"))?;
            plane.push(convert(bytes));
        }
        out.push(plane);
    }
    Ok(out)
}

#[async_trait]
impl AudioDecodeSession for FfmpegDecodeSession {
    fn configure(&mut self, config: &DecoderConfig) -> Result<(), DecodeError> {
        let decoder =
            Self::open_decoder(config).map_err(|e| DecodeError::new(format!("{:#}", e)))?;
        self.decoder = Some(decoder);
        Ok(())
    }

    fn submit(&mut self, chunk: EncodedAudioChunk) -> Result<(), DecodeError> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| DecodeError::new("session is not configured"))?;
        let mut packet = ffmpeg_next::Packet::copy(&chunk.data);
        packet.set_pts(Some(chunk.timestamp_us));
        packet.set_duration(chunk.duration_us);
        if chunk.is_key {
            packet.set_flags(ffmpeg_next::packet::Flags::KEY);
        }
        decoder
            .send_packet(&packet)
            .map_err(|e| DecodeError::new(e.to_string()))?;
        drain(decoder, &self.callbacks);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), DecodeError> {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder
                .send_eof()
                .map_err(|e| DecodeError::new(e.to_string()))?;
            drain(decoder, &self.callbacks);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.decoder = None;
    }
}
