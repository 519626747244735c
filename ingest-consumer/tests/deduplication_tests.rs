use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ingest_consumer::processor::DeduplicatingProcessor;
use ingest_consumer::test_utils::RecordingSink;
use ingest_consumer::RetentionPolicy;

fn processor_with(
    sink: RecordingSink,
    policy: RetentionPolicy,
) -> Arc<DeduplicatingProcessor<RecordingSink>> {
    Arc::new(DeduplicatingProcessor::new(sink, policy))
}

#[tokio::test]
async fn test_repeated_identity_is_written_once() {
    let sink = RecordingSink::new();
    let processor = processor_with(sink.clone(), RetentionPolicy::unbounded());

    for payload in [&b"a"[..], b"b", b"c", b"a"] {
        processor
            .process("42", Bytes::copy_from_slice(payload))
            .await
            .unwrap();
    }
    processor
        .process("43", Bytes::from_static(b"other"))
        .await
        .unwrap();

    assert_eq!(sink.write_count("42"), 1);
    assert_eq!(sink.write_count("43"), 1);
    assert_eq!(sink.writes()[0], ("42".to_string(), Bytes::from_static(b"a")));
    assert_eq!(processor.seen_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_write_once() {
    // the winner's write is slow so the loser arrives while it is in flight
    let sink = RecordingSink::with_delay(Duration::from_millis(50));
    let processor = processor_with(sink.clone(), RetentionPolicy::unbounded());

    let first = {
        let processor = processor.clone();
        tokio::spawn(async move { processor.process("42", Bytes::from_static(b"one")).await })
    };
    let second = {
        let processor = processor.clone();
        tokio::spawn(async move { processor.process("42", Bytes::from_static(b"two")).await })
    };

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(sink.attempts(), 1);
    assert_eq!(sink.write_count("42"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_does_not_wait_for_in_flight_write() {
    let sink = RecordingSink::with_delay(Duration::from_secs(2));
    let processor = processor_with(sink.clone(), RetentionPolicy::unbounded());

    let winner = {
        let processor = processor.clone();
        tokio::spawn(async move { processor.process("slow", Bytes::from_static(b"x")).await })
    };

    // wait until the winner has passed the gate
    while !processor.has_seen("slow") {
        tokio::task::yield_now().await;
    }

    let duplicate = tokio::time::timeout(
        Duration::from_millis(500),
        processor.process("slow", Bytes::from_static(b"x")),
    )
    .await;
    assert!(matches!(duplicate, Ok(Ok(()))));

    winner.await.unwrap().unwrap();
    assert_eq!(sink.write_count("slow"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_identities() {
    let sink = RecordingSink::new();
    let processor = processor_with(sink.clone(), RetentionPolicy::unbounded());

    let handles: Vec<_> = (0..200)
        .map(|i| {
            let processor = processor.clone();
            tokio::spawn(async move {
                let identity = (i % 50).to_string();
                processor.process(&identity, Bytes::from_static(b"p")).await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(sink.attempts(), 50);
    for i in 0..50 {
        assert_eq!(sink.write_count(&i.to_string()), 1);
    }
}

#[tokio::test]
async fn test_sink_error_is_returned_and_not_retried() {
    let sink = RecordingSink::new();
    sink.fail_identity("42");
    let processor = processor_with(sink.clone(), RetentionPolicy::unbounded());

    assert!(processor
        .process("42", Bytes::from_static(b"hello"))
        .await
        .is_err());
    assert!(processor
        .process("42", Bytes::from_static(b"hello"))
        .await
        .is_ok());

    assert_eq!(sink.attempts(), 1);
}

#[tokio::test]
async fn test_bounded_retention_forgets_oldest_identity() {
    let sink = RecordingSink::new();
    let policy = RetentionPolicy::unbounded().with_max_identities(NonZeroUsize::new(2).unwrap());
    let processor = processor_with(sink.clone(), policy);

    for identity in ["a", "b", "c"] {
        processor
            .process(identity, Bytes::from_static(b"p"))
            .await
            .unwrap();
    }

    // "a" was evicted to make room for "c", so it is written again
    processor.process("a", Bytes::from_static(b"p")).await.unwrap();
    // "c" is still retained
    processor.process("c", Bytes::from_static(b"p")).await.unwrap();

    assert_eq!(sink.write_count("a"), 2);
    assert_eq!(sink.write_count("c"), 1);
    assert_eq!(processor.seen_count(), 2);
}

#[tokio::test]
async fn test_time_bounded_retention() {
    let sink = RecordingSink::new();
    let processor = processor_with(
        sink.clone(),
        RetentionPolicy::unbounded().with_max_age(Duration::from_millis(20)),
    );

    processor.process("42", Bytes::from_static(b"p")).await.unwrap();
    processor.process("42", Bytes::from_static(b"p")).await.unwrap();
    assert_eq!(sink.write_count("42"), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;

    processor.process("42", Bytes::from_static(b"p")).await.unwrap();
    assert_eq!(sink.write_count("42"), 2);
}
