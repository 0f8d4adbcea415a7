//! Per-track codec stage: decoder, optional frame hook, encoder.
//!
//! A stage enforces a bounded in-flight window between submission and
//! decoder output, keeps its first failure and re-raises it on every later
//! interaction, and forwards encoded output in DTS order tagged with the
//! muxer track id.

use framecast_core::{CodecDirection, EncodedChunk, Error, Result};

use crate::codec::{AudioDecoder, AudioEncoder, VideoDecoder, VideoEncoder};
use crate::frame::VideoFrame;

/// Default in-flight window for video decoders.
pub const VIDEO_IN_FLIGHT: usize = 8;
/// Default in-flight window for audio decoders.
pub const AUDIO_IN_FLIGHT: usize = 32;

/// User hook invoked on every decoded video frame before re-encoding.
pub type VideoFrameHook = Box<dyn FnMut(VideoFrame) -> VideoFrame + Send>;

enum StageCodecs {
    Video {
        decoder: Box<dyn VideoDecoder>,
        encoder: Box<dyn VideoEncoder>,
        hook: Option<VideoFrameHook>,
    },
    Audio {
        decoder: Box<dyn AudioDecoder>,
        encoder: Box<dyn AudioEncoder>,
    },
}

/// Output of one stage interaction.
#[derive(Debug, Default)]
pub struct StageOutput {
    /// Encoded chunks ready for the muxer, in DTS order.
    pub chunks: Vec<EncodedChunk>,
    /// Frames the decoder produced during this interaction.
    pub decoded: u64,
}

/// One track's decode-transform-encode stage.
pub struct CodecStage {
    /// Source track id, used in error reports.
    track_id: u32,
    /// Muxer-assigned output track id stamped onto encoded chunks.
    output_track: u32,
    codecs: StageCodecs,
    max_in_flight: usize,
    in_flight: usize,
    /// First failure, re-raised on every subsequent interaction.
    failure: Option<(CodecDirection, String)>,
    closed: bool,
    last_output_micros: Option<i64>,
}

impl CodecStage {
    /// Build a video stage. The decoder and encoder must already be
    /// configured.
    pub fn video(
        track_id: u32,
        output_track: u32,
        decoder: Box<dyn VideoDecoder>,
        encoder: Box<dyn VideoEncoder>,
        hook: Option<VideoFrameHook>,
    ) -> Self {
        Self {
            track_id,
            output_track,
            codecs: StageCodecs::Video {
                decoder,
                encoder,
                hook,
            },
            max_in_flight: VIDEO_IN_FLIGHT,
            in_flight: 0,
            failure: None,
            closed: false,
            last_output_micros: None,
        }
    }

    /// Build an audio stage.
    pub fn audio(
        track_id: u32,
        output_track: u32,
        decoder: Box<dyn AudioDecoder>,
        encoder: Box<dyn AudioEncoder>,
    ) -> Self {
        Self {
            track_id,
            output_track,
            codecs: StageCodecs::Audio { decoder, encoder },
            max_in_flight: AUDIO_IN_FLIGHT,
            in_flight: 0,
            failure: None,
            closed: false,
            last_output_micros: None,
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self.codecs, StageCodecs::Video { .. })
    }

    fn check_usable(&self) -> Result<()> {
        if let Some((stage, message)) = &self.failure {
            return Err(Error::codec_failure(*stage, self.track_id, message.clone()));
        }
        if self.closed {
            return Err(Error::codec_failure(
                CodecDirection::Decode,
                self.track_id,
                "stage closed",
            ));
        }
        Ok(())
    }

    fn fail(&mut self, stage: CodecDirection, message: String) -> Error {
        if self.failure.is_none() {
            self.failure = Some((stage, message.clone()));
        }
        Error::codec_failure(stage, self.track_id, message)
    }

    /// Submit one source chunk and collect whatever output it produced.
    ///
    /// Suspends cooperatively when the decoder's in-flight window is full.
    pub async fn push_chunk(&mut self, chunk: &EncodedChunk) -> Result<StageOutput> {
        self.check_usable()?;

        if self.in_flight >= self.max_in_flight {
            // The window is full: give codec-owned workers a turn before
            // submitting more.
            tracing::trace!(track = self.track_id, "in-flight window full");
            tokio::task::yield_now().await;
        }

        let mut output = StageOutput::default();
        self.in_flight += 1;

        match &mut self.codecs {
            StageCodecs::Video {
                decoder,
                encoder,
                hook,
            } => {
                let frames = match decoder.decode(chunk).await {
                    Ok(frames) => frames,
                    Err(e) => return Err(self.fail(CodecDirection::Decode, e.to_string())),
                };
                self.in_flight = self.in_flight.saturating_sub(frames.len());
                output.decoded += frames.len() as u64;

                for frame in frames {
                    let frame = match hook {
                        Some(hook) => hook(frame),
                        None => frame,
                    };
                    let packets = match encoder.encode(frame, false).await {
                        Ok(p) => p,
                        Err(e) => return Err(self.fail(CodecDirection::Encode, e.to_string())),
                    };
                    collect_packets(
                        packets,
                        self.output_track,
                        &mut self.last_output_micros,
                        &mut output.chunks,
                    );
                }
            }
            StageCodecs::Audio { decoder, encoder } => {
                let frames = match decoder.decode(chunk).await {
                    Ok(frames) => frames,
                    Err(e) => return Err(self.fail(CodecDirection::Decode, e.to_string())),
                };
                self.in_flight = self.in_flight.saturating_sub(frames.len());
                output.decoded += frames.len() as u64;

                for frame in frames {
                    let packets = match encoder.encode(frame).await {
                        Ok(p) => p,
                        Err(e) => return Err(self.fail(CodecDirection::Encode, e.to_string())),
                    };
                    collect_packets(
                        packets,
                        self.output_track,
                        &mut self.last_output_micros,
                        &mut output.chunks,
                    );
                }
            }
        }

        Ok(output)
    }

    /// Drain the decoder, then the encoder. Resolves only after every
    /// submitted chunk has produced its emissions.
    pub async fn flush(&mut self) -> Result<StageOutput> {
        self.check_usable()?;
        let mut output = StageOutput::default();

        match &mut self.codecs {
            StageCodecs::Video {
                decoder,
                encoder,
                hook,
            } => {
                let frames = match decoder.flush().await {
                    Ok(frames) => frames,
                    Err(e) => return Err(self.fail(CodecDirection::Decode, e.to_string())),
                };
                output.decoded += frames.len() as u64;
                for frame in frames {
                    let frame = match hook {
                        Some(hook) => hook(frame),
                        None => frame,
                    };
                    let packets = match encoder.encode(frame, false).await {
                        Ok(p) => p,
                        Err(e) => return Err(self.fail(CodecDirection::Encode, e.to_string())),
                    };
                    collect_packets(
                        packets,
                        self.output_track,
                        &mut self.last_output_micros,
                        &mut output.chunks,
                    );
                }
                let tail = match encoder.flush().await {
                    Ok(p) => p,
                    Err(e) => return Err(self.fail(CodecDirection::Encode, e.to_string())),
                };
                collect_packets(
                    tail,
                    self.output_track,
                    &mut self.last_output_micros,
                    &mut output.chunks,
                );
            }
            StageCodecs::Audio { decoder, encoder } => {
                let frames = match decoder.flush().await {
                    Ok(frames) => frames,
                    Err(e) => return Err(self.fail(CodecDirection::Decode, e.to_string())),
                };
                output.decoded += frames.len() as u64;
                for frame in frames {
                    let packets = match encoder.encode(frame).await {
                        Ok(p) => p,
                        Err(e) => return Err(self.fail(CodecDirection::Encode, e.to_string())),
                    };
                    collect_packets(
                        packets,
                        self.output_track,
                        &mut self.last_output_micros,
                        &mut output.chunks,
                    );
                }
                let tail = match encoder.flush().await {
                    Ok(p) => p,
                    Err(e) => return Err(self.fail(CodecDirection::Encode, e.to_string())),
                };
                collect_packets(
                    tail,
                    self.output_track,
                    &mut self.last_output_micros,
                    &mut output.chunks,
                );
            }
        }

        self.in_flight = 0;
        Ok(output)
    }

    /// Release both codecs. Later pushes fail.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match &mut self.codecs {
            StageCodecs::Video {
                decoder, encoder, ..
            } => {
                decoder.close();
                encoder.close();
            }
            StageCodecs::Audio { decoder, encoder } => {
                decoder.close();
                encoder.close();
            }
        }
    }
}

/// Tag packets with the output track, restore DTS order within the batch,
/// and flag cross-batch regressions.
fn collect_packets(
    packets: Vec<crate::codec::EncodedPacket>,
    output_track: u32,
    last_micros: &mut Option<i64>,
    out: &mut Vec<EncodedChunk>,
) {
    let mut batch: Vec<EncodedChunk> = packets
        .into_iter()
        .map(|p| p.into_chunk(output_track))
        .collect();
    batch.sort_by_key(|c| c.timestamp_micros);
    for chunk in batch {
        if let Some(last) = *last_micros {
            if chunk.timestamp_micros <= last {
                tracing::warn!(
                    track = output_track,
                    ts = chunk.timestamp_micros,
                    last,
                    "encoder emitted non-monotonic timestamp"
                );
            }
        }
        *last_micros = Some(chunk.timestamp_micros);
        out.push(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{
        AudioDecoderConfig, AudioEncoderConfig, CodecError, EncodedPacket, VideoDecoderConfig,
        VideoEncoderConfig,
    };
    use crate::frame::PixelFormat;
    use async_trait::async_trait;
    use bytes::Bytes;

    /// Decoder that emits one frame per chunk, carrying the chunk timestamp.
    struct FakeVideoDecoder {
        fail_on: Option<usize>,
        seen: usize,
    }

    #[async_trait]
    impl VideoDecoder for FakeVideoDecoder {
        fn configure(&mut self, _: &VideoDecoderConfig) -> std::result::Result<(), CodecError> {
            Ok(())
        }

        async fn decode(&mut self, chunk: &EncodedChunk) -> std::result::Result<Vec<VideoFrame>, CodecError> {
            self.seen += 1;
            if self.fail_on == Some(self.seen) {
                return Err(CodecError::Failed("bitstream error".into()));
            }
            Ok(vec![VideoFrame {
                width: 16,
                height: 16,
                format: PixelFormat::I420,
                data: chunk.data.clone(),
                timestamp_micros: chunk.timestamp_micros,
                duration_micros: chunk.duration_micros,
            }])
        }

        async fn flush(&mut self) -> std::result::Result<Vec<VideoFrame>, CodecError> {
            Ok(Vec::new())
        }

        fn close(&mut self) {}
    }

    /// Encoder that turns every frame into one packet, first frame keyed.
    struct FakeVideoEncoder {
        emitted: usize,
    }

    #[async_trait]
    impl VideoEncoder for FakeVideoEncoder {
        fn configure(&mut self, _: &VideoEncoderConfig) -> std::result::Result<(), CodecError> {
            Ok(())
        }

        async fn encode(
            &mut self,
            frame: VideoFrame,
            _force_keyframe: bool,
        ) -> std::result::Result<Vec<EncodedPacket>, CodecError> {
            let is_keyframe = self.emitted == 0;
            self.emitted += 1;
            Ok(vec![EncodedPacket {
                data: frame.data,
                timestamp_micros: frame.timestamp_micros,
                duration_micros: frame.duration_micros,
                is_keyframe,
            }])
        }

        async fn flush(&mut self) -> std::result::Result<Vec<EncodedPacket>, CodecError> {
            Ok(Vec::new())
        }

        fn codec_private(&self) -> Option<Bytes> {
            None
        }

        fn close(&mut self) {}
    }

    struct NoopAudioDecoder;

    #[async_trait]
    impl AudioDecoder for NoopAudioDecoder {
        fn configure(&mut self, _: &AudioDecoderConfig) -> std::result::Result<(), CodecError> {
            Ok(())
        }
        async fn decode(
            &mut self,
            chunk: &EncodedChunk,
        ) -> std::result::Result<Vec<crate::frame::AudioFrame>, CodecError> {
            Ok(vec![crate::frame::AudioFrame {
                channels: 2,
                sample_rate: 48_000,
                data: chunk.data.clone(),
                timestamp_micros: chunk.timestamp_micros,
                duration_micros: chunk.duration_micros,
            }])
        }
        async fn flush(&mut self) -> std::result::Result<Vec<crate::frame::AudioFrame>, CodecError> {
            Ok(Vec::new())
        }
        fn close(&mut self) {}
    }

    struct NoopAudioEncoder;

    #[async_trait]
    impl AudioEncoder for NoopAudioEncoder {
        fn configure(&mut self, _: &AudioEncoderConfig) -> std::result::Result<(), CodecError> {
            Ok(())
        }
        async fn encode(
            &mut self,
            frame: crate::frame::AudioFrame,
        ) -> std::result::Result<Vec<EncodedPacket>, CodecError> {
            Ok(vec![EncodedPacket {
                data: frame.data,
                timestamp_micros: frame.timestamp_micros,
                duration_micros: frame.duration_micros,
                is_keyframe: true,
            }])
        }
        async fn flush(&mut self) -> std::result::Result<Vec<EncodedPacket>, CodecError> {
            Ok(Vec::new())
        }
        fn codec_private(&self) -> Option<Bytes> {
            None
        }
        fn close(&mut self) {}
    }

    fn chunk(ts: i64) -> EncodedChunk {
        EncodedChunk {
            track_id: 1,
            data: Bytes::from_static(&[9, 9, 9]),
            timestamp_micros: ts,
            duration_micros: 33_333,
            is_keyframe: false,
        }
    }

    fn video_stage(fail_on: Option<usize>) -> CodecStage {
        CodecStage::video(
            1,
            4,
            Box::new(FakeVideoDecoder { fail_on, seen: 0 }),
            Box::new(FakeVideoEncoder { emitted: 0 }),
            None,
        )
    }

    #[tokio::test]
    async fn push_produces_tagged_chunks() {
        let mut stage = video_stage(None);
        let output = stage.push_chunk(&chunk(0)).await.unwrap();
        assert_eq!(output.decoded, 1);
        assert_eq!(output.chunks.len(), 1);
        assert_eq!(output.chunks[0].track_id, 4);
        assert!(output.chunks[0].is_keyframe);

        let output = stage.push_chunk(&chunk(33_333)).await.unwrap();
        assert!(!output.chunks[0].is_keyframe);
    }

    #[tokio::test]
    async fn frame_hook_runs_between_decode_and_encode() {
        let mut stage = CodecStage::video(
            1,
            1,
            Box::new(FakeVideoDecoder {
                fail_on: None,
                seen: 0,
            }),
            Box::new(FakeVideoEncoder { emitted: 0 }),
            Some(Box::new(|mut frame: VideoFrame| {
                frame.data = Bytes::from_static(&[0xFE]);
                frame
            })),
        );
        let output = stage.push_chunk(&chunk(0)).await.unwrap();
        assert_eq!(&output.chunks[0].data[..], &[0xFE]);
    }

    #[tokio::test]
    async fn first_error_is_sticky() {
        let mut stage = video_stage(Some(2));
        stage.push_chunk(&chunk(0)).await.unwrap();

        let err = stage.push_chunk(&chunk(1)).await.unwrap_err();
        assert!(matches!(err, Error::CodecFailure { track: 1, .. }));

        // The same failure is re-raised on every later interaction.
        let err = stage.push_chunk(&chunk(2)).await.unwrap_err();
        assert!(err.to_string().contains("bitstream error"));
        let err = stage.flush().await.unwrap_err();
        assert!(err.to_string().contains("bitstream error"));
    }

    #[tokio::test]
    async fn close_rejects_further_pushes() {
        let mut stage = video_stage(None);
        stage.close();
        assert!(stage.push_chunk(&chunk(0)).await.is_err());
    }

    #[tokio::test]
    async fn audio_stage_round_trip() {
        let mut stage =
            CodecStage::audio(2, 9, Box::new(NoopAudioDecoder), Box::new(NoopAudioEncoder));
        assert!(!stage.is_video());
        let output = stage.push_chunk(&chunk(0)).await.unwrap();
        assert_eq!(output.chunks.len(), 1);
        assert_eq!(output.chunks[0].track_id, 9);
        assert!(output.chunks[0].is_keyframe);
        let flushed = stage.flush().await.unwrap();
        assert!(flushed.chunks.is_empty());
    }
}
