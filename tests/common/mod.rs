//! Shared fixtures for the end-to-end conversion tests: in-memory source
//! files built with the muxers, and a passthrough codec provider.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use framecast::{
    AudioCodec, CodecError, CodecProvider, EncodedChunk, TrackDescriptor, VideoCodec,
};
use framecast_core::media::{
    AudioProperties, Rotation, SampleAspect, TrackProperties, VideoProperties,
};
use framecast_core::BufferWriter;
use framecast_media::{Mp4Muxer, WebmMuxer};
use framecast_pipeline::{
    AudioDecoder, AudioDecoderConfig, AudioEncoder, AudioEncoderConfig, AudioFrame,
    EncodedPacket, PixelFormat, VideoDecoder, VideoDecoderConfig, VideoEncoder,
    VideoEncoderConfig, VideoFrame,
};

// ---------------------------------------------------------------------------
// Track descriptors
// ---------------------------------------------------------------------------

pub fn h264_track(id: u32) -> TrackDescriptor {
    TrackDescriptor {
        id,
        timescale: 90_000,
        properties: TrackProperties::Video(VideoProperties {
            codec: VideoCodec::H264,
            codec_string: "avc1.64001F".into(),
            coded_width: 320,
            coded_height: 240,
            display_width: 320,
            display_height: 240,
            rotation: Rotation::None,
            sample_aspect: SampleAspect::default(),
            color: None,
            codec_private: Some(Bytes::from_static(&[
                0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1, 0x00, 0x01, 0x67,
            ])),
        }),
    }
}

pub fn aac_track(id: u32) -> TrackDescriptor {
    TrackDescriptor {
        id,
        timescale: 48_000,
        properties: TrackProperties::Audio(AudioProperties {
            codec: AudioCodec::Aac,
            codec_string: "mp4a.40.2".into(),
            channels: 2,
            sample_rate: 48_000,
            codec_private: Some(Bytes::from_static(&[0x11, 0x90])),
        }),
    }
}

pub fn vp8_track(id: u32) -> TrackDescriptor {
    TrackDescriptor {
        id,
        timescale: 1000,
        properties: TrackProperties::Video(VideoProperties {
            codec: VideoCodec::Vp8,
            codec_string: "vp8".into(),
            coded_width: 320,
            coded_height: 240,
            display_width: 320,
            display_height: 240,
            rotation: Rotation::None,
            sample_aspect: SampleAspect::default(),
            color: None,
            codec_private: None,
        }),
    }
}

pub fn opus_track(id: u32) -> TrackDescriptor {
    TrackDescriptor {
        id,
        timescale: 1000,
        properties: TrackProperties::Audio(AudioProperties {
            codec: AudioCodec::Opus,
            codec_string: "opus".into(),
            channels: 2,
            sample_rate: 48_000,
            codec_private: Some(Bytes::from_static(b"OpusHead\x01\x02")),
        }),
    }
}

pub fn chunk(
    track_id: u32,
    ts_micros: i64,
    dur_micros: u32,
    key: bool,
    fill: u8,
    len: usize,
) -> EncodedChunk {
    EncodedChunk {
        track_id,
        data: Bytes::from(vec![fill; len]),
        timestamp_micros: ts_micros,
        duration_micros: dur_micros,
        is_keyframe: key,
    }
}

// ---------------------------------------------------------------------------
// Fixture files
// ---------------------------------------------------------------------------

/// A small h264+aac MP4: `video_frames` samples at 30 fps (keyframe every
/// 10) plus `audio_frames` AAC frames at 48 kHz.
pub fn mp4_fixture(video_frames: usize, audio_frames: usize) -> Vec<u8> {
    let mut muxer = Mp4Muxer::new(BufferWriter::new());
    let video = muxer.add_track(&h264_track(1)).unwrap();
    let audio = muxer.add_track(&aac_track(2)).unwrap();

    for i in 0..video_frames {
        let ts = i as i64 * 33_333;
        muxer
            .add_sample(video, &chunk(video, ts, 33_333, i % 10 == 0, 0x5A, 120))
            .unwrap();
    }
    for i in 0..audio_frames {
        let ts = i as i64 * 21_333;
        muxer
            .add_sample(audio, &chunk(audio, ts, 21_333, true, 0xA5, 48))
            .unwrap();
    }

    muxer.finalize().unwrap();
    muxer.into_writer().take().to_vec()
}

/// A small vp8+opus WebM with the same shape.
pub fn webm_fixture(video_frames: usize, audio_frames: usize) -> Vec<u8> {
    let mut muxer = WebmMuxer::new(BufferWriter::new());
    let video = muxer.add_track(&vp8_track(1)).unwrap();
    let audio = muxer.add_track(&opus_track(2)).unwrap();

    for i in 0..video_frames {
        let ts = i as i64 * 33_000;
        muxer
            .add_sample(video, &chunk(video, ts, 33_000, i % 10 == 0, 0x5A, 120))
            .unwrap();
    }
    for i in 0..audio_frames {
        let ts = i as i64 * 20_000;
        muxer
            .add_sample(audio, &chunk(audio, ts, 20_000, true, 0xA5, 48))
            .unwrap();
    }

    muxer.finalize().unwrap();
    muxer.into_writer().take().to_vec()
}

// ---------------------------------------------------------------------------
// Passthrough codecs
// ---------------------------------------------------------------------------

/// Decoder/encoder pair that shuttles payload bytes through unchanged:
/// every chunk decodes to one frame, every frame encodes to one packet,
/// with a keyframe every eighth video output.
pub struct PassthroughCodecs;

struct PassVideoDecoder;

#[async_trait]
impl VideoDecoder for PassVideoDecoder {
    fn configure(&mut self, _: &VideoDecoderConfig) -> Result<(), CodecError> {
        Ok(())
    }
    async fn decode(&mut self, chunk: &EncodedChunk) -> Result<Vec<VideoFrame>, CodecError> {
        Ok(vec![VideoFrame {
            width: 320,
            height: 240,
            format: PixelFormat::I420,
            data: chunk.data.clone(),
            timestamp_micros: chunk.timestamp_micros,
            duration_micros: chunk.duration_micros,
        }])
    }
    async fn flush(&mut self) -> Result<Vec<VideoFrame>, CodecError> {
        Ok(Vec::new())
    }
    fn close(&mut self) {}
}

struct PassVideoEncoder {
    emitted: u64,
}

#[async_trait]
impl VideoEncoder for PassVideoEncoder {
    fn configure(&mut self, _: &VideoEncoderConfig) -> Result<(), CodecError> {
        Ok(())
    }
    async fn encode(
        &mut self,
        frame: VideoFrame,
        force_keyframe: bool,
    ) -> Result<Vec<EncodedPacket>, CodecError> {
        let is_keyframe = force_keyframe || self.emitted % 8 == 0;
        self.emitted += 1;
        Ok(vec![EncodedPacket {
            data: frame.data,
            timestamp_micros: frame.timestamp_micros,
            duration_micros: frame.duration_micros,
            is_keyframe,
        }])
    }
    async fn flush(&mut self) -> Result<Vec<EncodedPacket>, CodecError> {
        Ok(Vec::new())
    }
    fn codec_private(&self) -> Option<Bytes> {
        None
    }
    fn close(&mut self) {}
}

struct PassAudioDecoder;

#[async_trait]
impl AudioDecoder for PassAudioDecoder {
    fn configure(&mut self, _: &AudioDecoderConfig) -> Result<(), CodecError> {
        Ok(())
    }
    async fn decode(&mut self, chunk: &EncodedChunk) -> Result<Vec<AudioFrame>, CodecError> {
        Ok(vec![AudioFrame {
            channels: 2,
            sample_rate: 48_000,
            data: chunk.data.clone(),
            timestamp_micros: chunk.timestamp_micros,
            duration_micros: chunk.duration_micros,
        }])
    }
    async fn flush(&mut self) -> Result<Vec<AudioFrame>, CodecError> {
        Ok(Vec::new())
    }
    fn close(&mut self) {}
}

struct PassAudioEncoder;

#[async_trait]
impl AudioEncoder for PassAudioEncoder {
    fn configure(&mut self, _: &AudioEncoderConfig) -> Result<(), CodecError> {
        Ok(())
    }
    async fn encode(&mut self, frame: AudioFrame) -> Result<Vec<EncodedPacket>, CodecError> {
        Ok(vec![EncodedPacket {
            data: frame.data,
            timestamp_micros: frame.timestamp_micros,
            duration_micros: frame.duration_micros,
            is_keyframe: true,
        }])
    }
    async fn flush(&mut self) -> Result<Vec<EncodedPacket>, CodecError> {
        Ok(Vec::new())
    }
    fn codec_private(&self) -> Option<Bytes> {
        Some(Bytes::from_static(b"OpusHead\x01\x02"))
    }
    fn close(&mut self) {}
}

impl CodecProvider for PassthroughCodecs {
    fn video_decoder(&self) -> Result<Box<dyn VideoDecoder>, CodecError> {
        Ok(Box::new(PassVideoDecoder))
    }
    fn video_encoder(&self) -> Result<Box<dyn VideoEncoder>, CodecError> {
        Ok(Box::new(PassVideoEncoder { emitted: 0 }))
    }
    fn audio_decoder(&self) -> Result<Box<dyn AudioDecoder>, CodecError> {
        Ok(Box::new(PassAudioDecoder))
    }
    fn audio_encoder(&self) -> Result<Box<dyn AudioEncoder>, CodecError> {
        Ok(Box::new(PassAudioEncoder))
    }
}

pub fn passthrough() -> Arc<dyn CodecProvider> {
    Arc::new(PassthroughCodecs)
}

// ---------------------------------------------------------------------------
// Demux helper for round-trip assertions
// ---------------------------------------------------------------------------

/// Fully demux an in-memory container into its tracks and sample positions.
pub fn demux_all(
    file: &[u8],
) -> (
    Vec<TrackDescriptor>,
    std::collections::HashMap<u32, Vec<framecast::SamplePosition>>,
) {
    let format = framecast::detect_format(file).expect("recognizable container");
    let mut demuxer = framecast::demuxer_for(format);
    demuxer.push(file).expect("parseable container");
    demuxer.finish().expect("complete container");

    let mut tracks = Vec::new();
    let mut samples: std::collections::HashMap<u32, Vec<framecast::SamplePosition>> =
        std::collections::HashMap::new();
    while let Some(event) = demuxer.poll_event() {
        match event {
            framecast::DemuxEvent::Track(t) => tracks.push(t),
            framecast::DemuxEvent::Samples {
                track_id,
                positions,
            } => samples.entry(track_id).or_default().extend(positions),
            framecast::DemuxEvent::Done => break,
        }
    }
    (tracks, samples)
}
