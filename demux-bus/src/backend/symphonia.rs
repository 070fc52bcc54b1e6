use std::collections::HashMap;

use ::symphonia::core::{
    audio::{Channels, SampleBuffer},
    codecs::{
        CODEC_TYPE_AAC, CODEC_TYPE_ALAC, CODEC_TYPE_FLAC, CODEC_TYPE_MP1, CODEC_TYPE_MP2,
        CODEC_TYPE_MP3, CODEC_TYPE_NULL, CODEC_TYPE_OPUS, CODEC_TYPE_PCM_ALAW,
        CODEC_TYPE_PCM_F32LE, CODEC_TYPE_PCM_F64LE,
        CODEC_TYPE_PCM_MULAW, CODEC_TYPE_PCM_S16BE, CODEC_TYPE_PCM_S16LE, CODEC_TYPE_PCM_S24LE,
        CODEC_TYPE_PCM_S32LE, CODEC_TYPE_PCM_U8, CODEC_TYPE_VORBIS, CodecParameters, CodecType,
        Decoder, DecoderOptions,
    },
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, Packet, Track},
    io::{MediaSource, MediaSourceStream},
    meta::MetadataOptions,
    probe::Hint,
};
use async_trait::async_trait;
use bytes::Bytes;

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

/// Codec names shared by the engine and the decoder.
const KNOWN_CODECS: &[(&str, CodecType)] = &[
    ("pcm_s16le", CODEC_TYPE_PCM_S16LE),
    ("pcm_s16be", CODEC_TYPE_PCM_S16BE),
    ("pcm_s24le", CODEC_TYPE_PCM_S24LE),
    ("pcm_s32le", CODEC_TYPE_PCM_S32LE),
    ("pcm_f32le", CODEC_TYPE_PCM_F32LE),
    ("pcm_f64le", CODEC_TYPE_PCM_F64LE),
    ("pcm_u8", CODEC_TYPE_PCM_U8),
    ("pcm_alaw", CODEC_TYPE_PCM_ALAW),
    ("pcm_mulaw", CODEC_TYPE_PCM_MULAW),
    ("flac", CODEC_TYPE_FLAC),
    ("alac", CODEC_TYPE_ALAC),
    ("mp1", CODEC_TYPE_MP1),
    ("mp2", CODEC_TYPE_MP2),
    ("mp3", CODEC_TYPE_MP3),
    ("aac", CODEC_TYPE_AAC),
    ("vorbis", CODEC_TYPE_VORBIS),
    ("opus", CODEC_TYPE_OPUS),
];

fn codec_name(codec: CodecType) -> String {
    if let Some((name, _)) = KNOWN_CODECS.iter().find(|(_, ty)| *ty == codec) {
        return name.to_string();
    }
    ::symphonia::default::get_codecs()
        .get_codec(codec)
        .map(|d| d.short_name.to_string())
        .unwrap_or_else(|| format!("{:?}", codec))
}

fn codec_type(name: &str) -> Option<CodecType> {
    KNOWN_CODECS
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, ty)| *ty)
}

/// Time base of a track, falling back to one tick per sample.
fn track_time_base(params: &CodecParameters) -> Option<TimeBase> {
    match params.time_base {
        Some(tb) => Some(TimeBase::new(
            i32::try_from(tb.numer).ok()?,
            i32::try_from(tb.denom).ok()?,
        )),
        None => params
            .sample_rate
            .and_then(|rate| i32::try_from(rate).ok())
            .filter(|&rate| rate > 0)
            .map(|rate| TimeBase::new(1, rate)),
    }
}

/// Maps track id to stream index for the tracks exposed as streams.
fn playable_tracks(tracks: &[Track]) -> HashMap<u32, usize> {
    tracks
        .iter()
        .enumerate()
        .filter_map(|(index, track)| {
            if track.codec_params.codec == CODEC_TYPE_NULL {
                log::debug!("symphonia: skipping track {} without codec", track.id);
                return None;
            }
            if track_time_base(&track.codec_params).is_none() {
                log::warn!("symphonia: skipping track {}: no usable time base", track.id);
                return None;
            }
            Some((track.id, index))
        })
        .collect()
}

impl MediaSource for ByteReader {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// Demuxes any container symphonia can probe.
#[derive(Clone, Debug, Default)]
pub struct SymphoniaEngine {
    hint: Hint,
}

impl SymphoniaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Helps the probe pick a format, e.g. `"wav"`.
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.hint.with_extension(extension);
        self
    }
}

pub struct SymphoniaContext {
    reader: Box<dyn FormatReader>,
    /// track id -> stream index, playable tracks only
    tracks: HashMap<u32, usize>,
}

#[derive(Default)]
pub struct SymphoniaPacket {
    current: Option<(usize, Packet)>,
}

impl DemuxEngine for SymphoniaEngine {
    type Context = SymphoniaContext;
    type Packet = SymphoniaPacket;

    fn alloc_packet(&mut self) -> Option<SymphoniaPacket> {
        Some(SymphoniaPacket::default())
    }

    fn open(&mut self, input: ByteReader) -> anyhow::Result<SymphoniaContext> {
        let stream = MediaSourceStream::new(Box::new(input), Default::default());
        let probed = ::symphonia::default::get_probe()
            .format(
                &self.hint,
                stream,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| anyhow::anyhow!("probe failed: {}", e))?;

        let tracks = playable_tracks(probed.format.tracks());
        Ok(SymphoniaContext {
            reader: probed.format,
            tracks,
        })
    }

    fn enumerate_streams(&mut self, ctx: &SymphoniaContext) -> Vec<LogicalStream> {
        ctx.reader
            .tracks()
            .iter()
            .enumerate()
            .filter(|(_, track)| ctx.tracks.contains_key(&track.id))
            .filter_map(|(index, track)| {
                let params = &track.codec_params;
                let sample_rate = params.sample_rate.unwrap_or(0);
                let time_base = track_time_base(params)?;
                let codec = CodecDescriptor {
                    name: codec_name(params.codec),
                    bits_per_sample: params.bits_per_sample,
                    frames_per_packet: params.max_frames_per_packet,
                    extra_data: params
                        .extra_data
                        .as_deref()
                        .map(Bytes::copy_from_slice)
                        .unwrap_or_default(),
                };
                let channels = params.channels.map(|c| c.count() as u32).unwrap_or(0);
                Some(LogicalStream::new(index, channels, sample_rate, time_base).with_codec(codec))
            })
            .collect()
    }

    fn read_frame(&mut self, ctx: &mut SymphoniaContext, packet: &mut SymphoniaPacket) -> ReadStatus {
        loop {
            match ctx.reader.next_packet() {
                Ok(next) => match ctx.tracks.get(&next.track_id()) {
                    Some(&index) => {
                        packet.current = Some((index, next));
                        return ReadStatus::Ok;
                    }
                    None => log::trace!("symphonia: skipping packet of track {}", next.track_id()),
                },
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return ReadStatus::EndOfStream;
                }
                Err(e) => return ReadStatus::Error(e.to_string()),
            }
        }
    }

    fn packet_payload<'p>(&self, packet: &'p SymphoniaPacket) -> &'p [u8] {
        packet.current.as_ref().map(|(_, p)| p.buf()).unwrap_or(&[])
    }

    fn packet_info(&self, packet: &SymphoniaPacket) -> PacketInfo {
        match &packet.current {
            Some((index, p)) => PacketInfo {
                stream_index: *index,
                pts: Some(p.ts() as i64),
                duration: Some(p.dur() as i64),
            },
            None => PacketInfo {
                stream_index: 0,
                pts: None,
                duration: None,
            },
        }
    }

    fn unref_packet(&mut self, packet: &mut SymphoniaPacket) {
        packet.current = None;
    }

    fn release_packet(&mut self, packet: SymphoniaPacket) {
        drop(packet);
    }

    fn close(&mut self, ctx: SymphoniaContext) {
        drop(ctx);
    }
}

/// Decodes with symphonia's codec registry.
#[derive(Clone, Copy, Debug, Default)]
pub struct SymphoniaDecoderService;

impl AudioDecoderService for SymphoniaDecoderService {
    type Session = SymphoniaDecodeSession;

    fn create(&mut self, callbacks: DecoderCallbacks) -> SymphoniaDecodeSession {
        SymphoniaDecodeSession {
            callbacks,
            decoder: None,
        }
    }
}

pub struct SymphoniaDecodeSession {
    callbacks: DecoderCallbacks,
    decoder: Option<Box<dyn Decoder>>,
}

impl SymphoniaDecodeSession {
    fn parameters(config: &DecoderConfig) -> Result<CodecParameters, DecodeError> {
        let codec = codec_type(&config.codec.name)
            .ok_or_else(|| DecodeError::new(format!("unsupported codec {}", config.codec.name)))?;

        let mut params = CodecParameters::new();
        params.for_codec(codec).with_sample_rate(config.sample_rate);
        if config.channel_count > 0 {
            let mask = if config.channel_count >= 32 {
                u32::MAX
            } else {
                (1u32 << config.channel_count) - 1
            };
            params.with_channels(Channels::from_bits_truncate(mask));
        }
        if let Some(bits) = config.codec.bits_per_sample {
            params.with_bits_per_sample(bits).with_bits_per_coded_sample(bits);
        }
        if let Some(frames) = config.codec.frames_per_packet {
            params.with_max_frames_per_packet(frames);
        }
        if !config.codec.extra_data.is_empty() {
            params.with_extra_data(config.codec.extra_data.to_vec().into_boxed_slice());
        }
        Ok(params)
    }
}

#[async_trait]
impl AudioDecodeSession for SymphoniaDecodeSession {
    fn configure(&mut self, config: &DecoderConfig) -> Result<(), DecodeError> {
        let params = Self::parameters(config)?;
        let decoder = ::symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| DecodeError::new(e.to_string()))?;
        self.decoder = Some(decoder);
        Ok(())
    }

    fn submit(&mut self, chunk: EncodedAudioChunk) -> Result<(), DecodeError> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| DecodeError::new("session is not configured"))?;
        let packet = Packet::new_from_slice(
            0,
            chunk.timestamp_us.max(0) as u64,
            chunk.duration_us.max(0) as u64,
            &chunk.data,
        );
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let frames = decoded.frames();
                if frames == 0 {
                    return Ok(());
                }
                let mut samples = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                samples.copy_planar_ref(decoded);
                let channels = samples
                    .samples()
                    .chunks(frames)
                    .take(spec.channels.count())
                    .map(|c| c.to_vec())
                    .collect();
                (self.callbacks.output)(AudioBuffer {
                    stream_id: 0,
                    sample_rate: spec.rate,
                    timestamp_us: chunk.timestamp_us,
                    channels,
                });
            }
            Err(SymphoniaError::DecodeError(e)) => {
                log::warn!("symphonia: skipping undecodable packet: {}", e);
            }
            Err(e) => (self.callbacks.error)(DecodeError::new(e.to_string())),
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), DecodeError> {
        Ok(())
    }

    fn close(&mut self) {
        self.decoder = None;
    }
}
