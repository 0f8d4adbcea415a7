//! Cancellation behavior: aborting mid-stream rejects promptly and stops
//! progress delivery.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use framecast::{convert, ConversionOptions, ConvertRequest, Error, MemoryReader, ProgressSender};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn abort_before_start_rejects_immediately() {
    let source = common::webm_fixture(10, 10);
    let mut request = ConvertRequest::new(
        ConversionOptions::webm(),
        Arc::new(MemoryReader::new(source)),
    );
    request.signal.cancel();

    let err = convert(request).await.unwrap_err();
    assert!(err.is_aborted());
}

#[tokio::test]
async fn abort_mid_stream_stops_progress() {
    let source = common::webm_fixture(0, 200);
    let signal = CancellationToken::new();

    let updates = Arc::new(AtomicU64::new(0));
    let updates_in_callback = updates.clone();
    let cancel_from_callback = signal.clone();

    let mut request = ConvertRequest::new(
        ConversionOptions::webm(),
        Arc::new(MemoryReader::new(source)),
    );
    request.signal = signal;
    request.on_progress = Some(ProgressSender::new(move |_| {
        let seen = updates_in_callback.fetch_add(1, Ordering::SeqCst) + 1;
        if seen == 5 {
            cancel_from_callback.cancel();
        }
    }));

    let err = convert(request).await.unwrap_err();
    assert!(matches!(err, Error::Aborted { cause: None }));

    // The abort was observed at the next sample boundary: exactly the five
    // updates that ran before cancellation, nothing after rejection.
    assert_eq!(updates.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn abort_is_idempotent() {
    let source = common::webm_fixture(4, 0);
    let signal = CancellationToken::new();
    signal.cancel();
    signal.cancel(); // calling twice is a no-op

    let mut request = ConvertRequest::new(
        ConversionOptions::webm(),
        Arc::new(MemoryReader::new(source)),
    );
    request.signal = signal;

    let err = convert(request).await.unwrap_err();
    assert!(err.is_aborted());
}
