//! The pipeline controller: drives demuxer, codec stages, and muxer
//! end-to-end for one conversion.
//!
//! Per discovered track the controller decides copy vs transcode: a track
//! whose input codec is natively carried by the target container is
//! forwarded bit-for-bit (unless a frame hook forces the video track through
//! the codecs); everything else goes through a [`CodecStage`] built from the
//! caller's codec provider.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use framecast_core::{
    container_carries_audio, container_carries_video, media::ticks_to_micros, BufferWriter,
    ContainerFormat, ConversionOptions, EncodedChunk, Error, MediaState, ProgressSender, Result,
    SamplePosition, SourceReader, TrackDescriptor, TrackProperties,
};
use framecast_media::{
    demux::{demuxer_for, detect_format, DemuxEvent, Demuxer},
    mux::{Mp4Muxer, WebmMuxer},
    ParseError,
};
use tokio_util::sync::CancellationToken;

use crate::codec::{
    AudioDecoderConfig, AudioEncoderConfig, CodecProvider, LatencyMode, VideoDecoderConfig,
    VideoEncoderConfig,
};
use crate::context::PipelineContext;
use crate::stage::{CodecStage, VideoFrameHook};

/// Source bytes are pulled in windows of this size.
const READ_WINDOW: u32 = 256 * 1024;

/// Default encoder bitrates when the caller does not override them.
const DEFAULT_VIDEO_BITRATE: u64 = 2_500_000;
const DEFAULT_AUDIO_BITRATE: u64 = 128_000;

/// Everything `convert` needs for one run.
pub struct ConvertRequest {
    /// Target container and codecs; validated before any I/O.
    pub options: ConversionOptions,
    /// The source byte stream.
    pub reader: Arc<dyn SourceReader>,
    /// Codec factory for tracks that need transcoding. Copy-only runs may
    /// omit it.
    pub codecs: Option<Arc<dyn CodecProvider>>,
    /// Optional per-frame hook; forces the video track onto the transcode
    /// path.
    pub on_video_frame: Option<VideoFrameHook>,
    /// Progress observer.
    pub on_progress: Option<ProgressSender>,
    /// Shared abort token.
    pub signal: CancellationToken,
}

impl ConvertRequest {
    pub fn new(options: ConversionOptions, reader: Arc<dyn SourceReader>) -> Self {
        Self {
            options,
            reader,
            codecs: None,
            on_video_frame: None,
            on_progress: None,
            signal: CancellationToken::new(),
        }
    }
}

/// A finished conversion.
#[derive(Debug)]
pub struct Conversion {
    output: Bytes,
    state: MediaState,
}

impl Conversion {
    /// The serialized target container.
    pub fn save(&self) -> Bytes {
        self.output.clone()
    }

    /// Final progress counters.
    pub fn state(&self) -> &MediaState {
        &self.state
    }
}

/// Run a conversion to completion.
pub async fn convert(request: ConvertRequest) -> Result<Conversion> {
    request.options.validate()?;

    let ctx = PipelineContext::new()
        .with_cancellation(request.signal.clone())
        .with_progress(request.on_progress.unwrap_or_else(ProgressSender::noop));

    // Sniff the input container before constructing anything.
    let head = request.reader.read_at(0, 16).await?;
    let input_format = detect_format(&head).ok_or_else(|| {
        Error::unsupported_config("src", "unrecognized container signature")
    })?;

    tracing::info!(%input_format, to = %request.options.to, "starting conversion");

    let mut pipeline = Pipeline {
        options: request.options,
        reader: request.reader,
        codecs: request.codecs,
        frame_hook: request.on_video_frame,
        ctx,
        input_format,
        demuxer: demuxer_for(input_format),
        muxer: TargetMuxer::new(request.options),
        tracks: HashMap::new(),
        state: MediaState::default(),
    };

    let result = pipeline.run().await;
    pipeline.close_stages();
    let output = match result {
        Ok(()) => pipeline.muxer.into_output(),
        Err(e) => return Err(e),
    };

    Ok(Conversion {
        output,
        state: pipeline.state,
    })
}

// ---------------------------------------------------------------------------
// Target muxer dispatch
// ---------------------------------------------------------------------------

enum TargetMuxer {
    Webm(WebmMuxer<BufferWriter>),
    Mp4(Mp4Muxer<BufferWriter>),
}

impl TargetMuxer {
    fn new(options: ConversionOptions) -> Self {
        match options.to {
            ContainerFormat::Mp4 => Self::Mp4(Mp4Muxer::new(BufferWriter::new())),
            _ => Self::Webm(WebmMuxer::new(BufferWriter::new())),
        }
    }

    fn add_track(&mut self, descriptor: &TrackDescriptor) -> Result<u32> {
        match self {
            Self::Webm(m) => m.add_track(descriptor),
            Self::Mp4(m) => m.add_track(descriptor),
        }
    }

    fn add_sample(&mut self, track: u32, chunk: &EncodedChunk) -> Result<()> {
        match self {
            Self::Webm(m) => m.add_sample(track, chunk),
            Self::Mp4(m) => m.add_sample(track, chunk),
        }
    }

    fn finalize(&mut self) -> Result<()> {
        match self {
            Self::Webm(m) => m.finalize(),
            Self::Mp4(m) => m.finalize(),
        }
    }

    fn into_output(self) -> Bytes {
        match self {
            Self::Webm(m) => m.into_writer().take(),
            Self::Mp4(m) => m.into_writer().take(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

enum Route {
    /// Forward chunks unchanged under the muxer-assigned track id.
    Copy { output_track: u32 },
    /// Decode, optionally transform, re-encode.
    Transcode { stage: CodecStage },
}

struct TrackState {
    timescale: u32,
    is_video: bool,
    route: Route,
}

struct Pipeline {
    options: ConversionOptions,
    reader: Arc<dyn SourceReader>,
    codecs: Option<Arc<dyn CodecProvider>>,
    frame_hook: Option<VideoFrameHook>,
    ctx: PipelineContext,
    input_format: ContainerFormat,
    demuxer: Box<dyn Demuxer>,
    muxer: TargetMuxer,
    tracks: HashMap<u32, TrackState>,
    state: MediaState,
}

impl Pipeline {
    async fn run(&mut self) -> Result<()> {
        let mut offset = 0u64;
        let mut done = false;

        while !done {
            self.ctx.check_cancelled()?;

            let window = self.reader.read_at(offset, READ_WINDOW).await?;
            if window.is_empty() {
                self.demuxer.finish().map_err(|e| self.parse_error(e))?;
            } else {
                offset += window.len() as u64;
                self.demuxer.push(&window).map_err(|e| self.parse_error(e))?;
            }

            while let Some(event) = self.demuxer.poll_event() {
                match event {
                    DemuxEvent::Track(descriptor) => self.handle_track(descriptor)?,
                    DemuxEvent::Samples {
                        track_id,
                        positions,
                    } => self.handle_samples(track_id, positions).await?,
                    DemuxEvent::Done => {
                        done = true;
                        break;
                    }
                }
            }

            if window.is_empty() && !done {
                // A clean source must end with a Done event.
                return Err(Error::malformed(
                    self.input_format,
                    offset,
                    "demuxer produced no end-of-stream event",
                ));
            }
        }

        // Drain every transcode stage, then close the container.
        self.flush_stages().await?;
        self.ctx.check_cancelled()?;
        self.muxer.finalize()?;
        Ok(())
    }

    fn parse_error(&self, e: ParseError) -> Error {
        e.into_core(self.input_format)
    }

    // -- Track routing ------------------------------------------------------

    fn handle_track(&mut self, descriptor: TrackDescriptor) -> Result<()> {
        let is_video = descriptor.is_video();
        let copy = match &descriptor.properties {
            TrackProperties::Video(v) => {
                container_carries_video(self.options.to, v.codec) && self.frame_hook.is_none()
            }
            TrackProperties::Audio(a) => container_carries_audio(self.options.to, a.codec),
        };

        let route = if copy {
            let output_track = self.muxer.add_track(&descriptor)?;
            tracing::info!(track = descriptor.id, output_track, "copying track");
            Route::Copy { output_track }
        } else {
            let stage = self.build_stage(&descriptor)?;
            tracing::info!(track = descriptor.id, "transcoding track");
            Route::Transcode { stage }
        };

        self.tracks.insert(
            descriptor.id,
            TrackState {
                timescale: descriptor.timescale,
                is_video,
                route,
            },
        );
        Ok(())
    }

    fn build_stage(&mut self, descriptor: &TrackDescriptor) -> Result<CodecStage> {
        let provider = self.codecs.clone().ok_or_else(|| {
            Error::unsupported_config("codecs", "transcode required but no codec provider given")
        })?;

        match &descriptor.properties {
            TrackProperties::Video(v) => {
                let mut decoder = provider
                    .video_decoder()
                    .map_err(|e| Error::codec_failure(
                        framecast_core::CodecDirection::Decode,
                        descriptor.id,
                        e.to_string(),
                    ))?;
                decoder
                    .configure(&VideoDecoderConfig {
                        codec_string: v.codec_string.clone(),
                        coded_width: v.coded_width,
                        coded_height: v.coded_height,
                        description: v.codec_private.clone(),
                    })
                    .map_err(|e| Error::codec_failure(
                        framecast_core::CodecDirection::Decode,
                        descriptor.id,
                        e.to_string(),
                    ))?;

                let mut encoder = provider
                    .video_encoder()
                    .map_err(|e| Error::codec_failure(
                        framecast_core::CodecDirection::Encode,
                        descriptor.id,
                        e.to_string(),
                    ))?;
                encoder
                    .configure(&VideoEncoderConfig {
                        codec: self.options.video_codec,
                        width: v.coded_width,
                        height: v.coded_height,
                        bitrate: DEFAULT_VIDEO_BITRATE,
                        framerate: 30.0,
                        latency_mode: LatencyMode::Quality,
                    })
                    .map_err(|e| Error::codec_failure(
                        framecast_core::CodecDirection::Encode,
                        descriptor.id,
                        e.to_string(),
                    ))?;

                // Register the output track with the target codec identity.
                let mut out = descriptor.clone();
                if let TrackProperties::Video(vp) = &mut out.properties {
                    vp.codec = self.options.video_codec;
                    vp.codec_string = self.options.video_codec.to_string();
                    vp.codec_private = encoder.codec_private();
                }
                let output_track = self.muxer.add_track(&out)?;

                Ok(CodecStage::video(
                    descriptor.id,
                    output_track,
                    decoder,
                    encoder,
                    self.frame_hook.take(),
                ))
            }
            TrackProperties::Audio(a) => {
                let mut decoder = provider
                    .audio_decoder()
                    .map_err(|e| Error::codec_failure(
                        framecast_core::CodecDirection::Decode,
                        descriptor.id,
                        e.to_string(),
                    ))?;
                decoder
                    .configure(&AudioDecoderConfig {
                        codec_string: a.codec_string.clone(),
                        channels: a.channels,
                        sample_rate: a.sample_rate,
                        description: a.codec_private.clone(),
                    })
                    .map_err(|e| Error::codec_failure(
                        framecast_core::CodecDirection::Decode,
                        descriptor.id,
                        e.to_string(),
                    ))?;

                let mut encoder = provider
                    .audio_encoder()
                    .map_err(|e| Error::codec_failure(
                        framecast_core::CodecDirection::Encode,
                        descriptor.id,
                        e.to_string(),
                    ))?;
                encoder
                    .configure(&AudioEncoderConfig {
                        codec: self.options.audio_codec,
                        channels: a.channels,
                        sample_rate: a.sample_rate,
                        bitrate: DEFAULT_AUDIO_BITRATE,
                    })
                    .map_err(|e| Error::codec_failure(
                        framecast_core::CodecDirection::Encode,
                        descriptor.id,
                        e.to_string(),
                    ))?;

                let mut out = descriptor.clone();
                if let TrackProperties::Audio(ap) = &mut out.properties {
                    ap.codec = self.options.audio_codec;
                    ap.codec_string = self.options.audio_codec.to_string();
                    ap.codec_private = encoder.codec_private();
                }
                let output_track = self.muxer.add_track(&out)?;

                Ok(CodecStage::audio(
                    descriptor.id,
                    output_track,
                    decoder,
                    encoder,
                ))
            }
        }
    }

    // -- Sample flow --------------------------------------------------------

    async fn handle_samples(
        &mut self,
        track_id: u32,
        positions: Vec<SamplePosition>,
    ) -> Result<()> {
        let Some(track) = self.tracks.get(&track_id) else {
            tracing::debug!(track = track_id, "samples for unrouted track");
            return Ok(());
        };
        let timescale = track.timescale;
        let is_video = track.is_video;

        for position in positions {
            self.ctx.check_cancelled()?;

            let data = self
                .reader
                .read_at(position.file_offset, position.size)
                .await?;
            if data.len() < position.size as usize {
                return Err(Error::malformed(
                    self.input_format,
                    position.file_offset,
                    "sample payload extends past end of source",
                ));
            }

            // Chunks travel in decode order; timestamps are normalized DTS.
            let chunk = EncodedChunk {
                track_id,
                data,
                timestamp_micros: ticks_to_micros(position.dts, timescale),
                duration_micros: ticks_to_micros(i64::from(position.duration), timescale)
                    .max(1) as u32,
                is_keyframe: position.is_keyframe,
            };

            let Some(track) = self.tracks.get_mut(&track_id) else {
                return Ok(());
            };
            match &mut track.route {
                Route::Copy { output_track } => {
                    let output_track = *output_track;
                    let mut forwarded = chunk;
                    forwarded.track_id = output_track;
                    self.muxer.add_sample(output_track, &forwarded)?;
                    self.record_output(is_video, forwarded.timestamp_micros, forwarded.duration_micros);
                }
                Route::Transcode { stage } => {
                    let output = stage.push_chunk(&chunk).await?;
                    if is_video {
                        self.state.decoded_video += output.decoded;
                    } else {
                        self.state.decoded_audio += output.decoded;
                    }
                    for encoded in output.chunks {
                        self.muxer.add_sample(encoded.track_id, &encoded)?;
                        self.record_output(
                            is_video,
                            encoded.timestamp_micros,
                            encoded.duration_micros,
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn record_output(&mut self, is_video: bool, timestamp_micros: i64, duration_micros: u32) {
        if is_video {
            self.state.encoded_video += 1;
        } else {
            self.state.encoded_audio += 1;
        }
        self.state.observe_output(timestamp_micros, duration_micros);
        self.ctx.report(&self.state);
    }

    // -- Flush / teardown ---------------------------------------------------

    async fn flush_stages(&mut self) -> Result<()> {
        let mut track_ids: Vec<u32> = self.tracks.keys().copied().collect();
        track_ids.sort_unstable();

        for track_id in track_ids {
            self.ctx.check_cancelled()?;
            let drained = {
                let Some(track) = self.tracks.get_mut(&track_id) else {
                    continue;
                };
                match &mut track.route {
                    Route::Transcode { stage } => {
                        let output = stage.flush().await?;
                        stage.close();
                        Some((track.is_video, output))
                    }
                    Route::Copy { .. } => None,
                }
            };

            if let Some((is_video, output)) = drained {
                if is_video {
                    self.state.decoded_video += output.decoded;
                } else {
                    self.state.decoded_audio += output.decoded;
                }
                for encoded in output.chunks {
                    self.muxer.add_sample(encoded.track_id, &encoded)?;
                    self.record_output(
                        is_video,
                        encoded.timestamp_micros,
                        encoded.duration_micros,
                    );
                }
            }
        }
        Ok(())
    }

    fn close_stages(&mut self) {
        for track in self.tracks.values_mut() {
            if let Route::Transcode { stage } = &mut track.route {
                stage.close();
            }
        }
    }
}
