//! Transcode-path conversions through the passthrough codec provider.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use framecast::{convert, ConversionOptions, ConvertRequest, Error, MemoryReader};

#[tokio::test]
async fn mp4_to_webm_transcodes_both_tracks() {
    let source = common::mp4_fixture(20, 30);

    let mut request = ConvertRequest::new(
        ConversionOptions::webm(),
        Arc::new(MemoryReader::new(source)),
    );
    request.codecs = Some(common::passthrough());

    let conversion = convert(request).await.unwrap();
    let state = conversion.state();

    // One decoded frame and one encoded chunk per source sample.
    assert_eq!(state.decoded_video, 20);
    assert_eq!(state.encoded_video, 20);
    assert_eq!(state.decoded_audio, 30);
    assert_eq!(state.encoded_audio, 30);

    // The output is a well-formed WebM with both tracks.
    let (tracks, samples) = common::demux_all(&conversion.save());
    assert_eq!(tracks.len(), 2);
    let totals: usize = samples.values().map(Vec::len).sum();
    assert_eq!(totals, 50);
}

#[tokio::test]
async fn transcode_without_provider_is_rejected() {
    let source = common::mp4_fixture(4, 0);

    // h264 into WebM needs codecs; none were supplied.
    let request = ConvertRequest::new(
        ConversionOptions::webm(),
        Arc::new(MemoryReader::new(source)),
    );
    let err = convert(request).await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedConfig { .. }));
}

#[tokio::test]
async fn frame_hook_sees_every_decoded_frame() {
    let source = common::mp4_fixture(15, 0);
    let seen = Arc::new(AtomicU64::new(0));
    let seen_hook = seen.clone();

    let mut request = ConvertRequest::new(
        ConversionOptions::webm(),
        Arc::new(MemoryReader::new(source)),
    );
    request.codecs = Some(common::passthrough());
    request.on_video_frame = Some(Box::new(move |frame| {
        seen_hook.fetch_add(1, Ordering::SeqCst);
        frame
    }));

    convert(request).await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 15);
}

#[tokio::test]
async fn frame_hook_forces_video_off_the_copy_path() {
    // vp8 into WebM would normally copy; a frame hook forces transcoding.
    let source = common::webm_fixture(10, 0);
    let seen = Arc::new(AtomicU64::new(0));
    let seen_hook = seen.clone();

    let mut request = ConvertRequest::new(
        ConversionOptions::webm(),
        Arc::new(MemoryReader::new(source)),
    );
    request.codecs = Some(common::passthrough());
    request.on_video_frame = Some(Box::new(move |frame| {
        seen_hook.fetch_add(1, Ordering::SeqCst);
        frame
    }));

    let conversion = convert(request).await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 10);
    assert_eq!(conversion.state().decoded_video, 10);
}

#[tokio::test]
async fn progress_snapshots_arrive_in_order() {
    let source = common::mp4_fixture(8, 0);
    let timeline = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = timeline.clone();

    let mut request = ConvertRequest::new(
        ConversionOptions::webm(),
        Arc::new(MemoryReader::new(source)),
    );
    request.codecs = Some(common::passthrough());
    request.on_progress = Some(framecast::ProgressSender::new(move |state| {
        sink.lock().unwrap().push(state.encoded_video);
    }));

    convert(request).await.unwrap();

    let counts = timeline.lock().unwrap();
    assert_eq!(*counts.last().unwrap(), 8);
    assert!(counts.windows(2).all(|w| w[0] <= w[1]), "monotone snapshots");
}
