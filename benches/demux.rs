//! Benchmarks for container demuxing.
//!
//! Measures moov/sample-table resolution and cluster walking over synthetic
//! in-memory files built with the muxers.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use framecast::{
    demuxer_for, detect_format, AudioCodec, BufferWriter, DemuxEvent, EncodedChunk, Mp4Muxer,
    TrackDescriptor, VideoCodec, WebmMuxer,
};
use framecast_core::media::{
    AudioProperties, Rotation, SampleAspect, TrackProperties, VideoProperties,
};

fn video_track(timescale: u32, codec: VideoCodec) -> TrackDescriptor {
    TrackDescriptor {
        id: 1,
        timescale,
        properties: TrackProperties::Video(VideoProperties {
            codec,
            codec_string: String::new(),
            coded_width: 1280,
            coded_height: 720,
            display_width: 1280,
            display_height: 720,
            rotation: Rotation::None,
            sample_aspect: SampleAspect::default(),
            color: None,
            codec_private: Some(Bytes::from_static(&[0x01, 0x64, 0x00, 0x1F, 0xFF])),
        }),
    }
}

fn audio_track(codec: AudioCodec) -> TrackDescriptor {
    TrackDescriptor {
        id: 2,
        timescale: 48_000,
        properties: TrackProperties::Audio(AudioProperties {
            codec,
            codec_string: String::new(),
            channels: 2,
            sample_rate: 48_000,
            codec_private: Some(Bytes::from_static(&[0x11, 0x90])),
        }),
    }
}

fn sample(track: u32, ts: i64, key: bool) -> EncodedChunk {
    EncodedChunk {
        track_id: track,
        data: Bytes::from_static(&[0x42; 256]),
        timestamp_micros: ts,
        duration_micros: 33_333,
        is_keyframe: key,
    }
}

fn build_mp4(frames: usize) -> Vec<u8> {
    let mut muxer = Mp4Muxer::new(BufferWriter::new());
    let video = muxer.add_track(&video_track(90_000, VideoCodec::H264)).unwrap();
    let audio = muxer.add_track(&audio_track(AudioCodec::Aac)).unwrap();
    for i in 0..frames {
        muxer
            .add_sample(video, &sample(video, i as i64 * 33_333, i % 30 == 0))
            .unwrap();
        muxer
            .add_sample(audio, &sample(audio, i as i64 * 21_333, true))
            .unwrap();
    }
    muxer.finalize().unwrap();
    muxer.into_writer().take().to_vec()
}

fn build_webm(frames: usize) -> Vec<u8> {
    let mut muxer = WebmMuxer::new(BufferWriter::new());
    let video = muxer.add_track(&video_track(1000, VideoCodec::Vp8)).unwrap();
    for i in 0..frames {
        muxer
            .add_sample(video, &sample(video, i as i64 * 33_000, i % 30 == 0))
            .unwrap();
    }
    muxer.finalize().unwrap();
    muxer.into_writer().take().to_vec()
}

fn demux_count(file: &[u8]) -> usize {
    let mut demuxer = demuxer_for(detect_format(file).unwrap());
    demuxer.push(file).unwrap();
    demuxer.finish().unwrap();
    let mut samples = 0;
    while let Some(event) = demuxer.poll_event() {
        if let DemuxEvent::Samples { positions, .. } = event {
            samples += positions.len();
        }
    }
    samples
}

fn bench_mp4_demux(c: &mut Criterion) {
    let mut group = c.benchmark_group("mp4_demux");
    for frames in [100usize, 1000] {
        let file = build_mp4(frames);
        group.throughput(Throughput::Bytes(file.len() as u64));
        group.bench_function(format!("{frames}_frames"), |b| {
            b.iter(|| demux_count(black_box(&file)))
        });
    }
    group.finish();
}

fn bench_webm_demux(c: &mut Criterion) {
    let mut group = c.benchmark_group("webm_demux");
    for frames in [100usize, 1000] {
        let file = build_webm(frames);
        group.throughput(Throughput::Bytes(file.len() as u64));
        group.bench_function(format!("{frames}_frames"), |b| {
            b.iter(|| demux_count(black_box(&file)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_mp4_demux, bench_webm_demux);
criterion_main!(benches);
