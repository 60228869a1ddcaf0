use bytes::Bytes;
use serde_json::Value;

use workpipe::{FailureKind, FnStage, Pipeline, PipelineConfig, StageError, WorkItem};

fn config(name: &str) -> PipelineConfig {
    PipelineConfig {
        name: name.into(),
        max_simultaneous: Some(2),
        ..Default::default()
    }
}

/// Upstream half of a paired run: writes the given bytes as one final frame
/// and records the producer counter.
fn writer_stage(data: &'static [u8]) -> FnStage<Bytes> {
    FnStage::pooled(move |mut item: WorkItem<Bytes>, _| async move {
        let mut pipe = match item.take_pipe_writer() {
            Some(pipe) => pipe,
            None => return Err(StageError::failed("missing pipe writer")),
        };
        pipe.write_eof(data).await?;
        item.set_extra("bytes_written", pipe.tell());
        Ok(item)
    })
    .paired()
}

/// Downstream half: reads to end-of-stream, stores the bytes as the payload
/// and records the consumer counter.
fn reader_stage() -> FnStage<Bytes> {
    FnStage::pooled(|mut item: WorkItem<Bytes>, _| async move {
        let mut pipe = match item.take_pipe_reader() {
            Some(pipe) => pipe,
            None => return Err(StageError::failed("missing pipe reader")),
        };
        let mut collected = Vec::new();
        loop {
            let chunk = pipe.read().await?;
            if chunk.is_empty() {
                break;
            }
            collected.extend_from_slice(&chunk);
        }
        item.set_extra("bytes_read", pipe.tell());
        item.payload = Bytes::from(collected);
        Ok(item)
    })
}

fn extra_u64(item: &WorkItem<Bytes>, key: &str) -> Option<u64> {
    item.extra(key).and_then(Value::as_u64)
}

/// Two paired stages stream ten bytes through the channel; both endpoint
/// counters account for them.
#[tokio::test]
async fn paired_stages_stream_through_the_pipe() {
    let mut pipeline = Pipeline::new(config("paired"));
    pipeline.add_stage(writer_stage(b"helloworld")).unwrap();
    pipeline.add_stage(reader_stage()).unwrap();

    let item = pipeline
        .submit(WorkItem::new(Bytes::new()))
        .unwrap()
        .result()
        .await
        .expect("paired run failed");

    assert_eq!(item.payload.as_ref(), b"helloworld");
    assert_eq!(extra_u64(&item, "bytes_written"), Some(10));
    assert_eq!(extra_u64(&item, "bytes_read"), Some(10));
    assert_eq!(item.stage(), 2);

    pipeline.shutdown().await.unwrap();
    assert!(pipeline.anomalies().is_empty());
}

/// An upstream half that fails before writing: the downstream half observes
/// the peer closing as an empty read, the item fails, and the pipeline keeps
/// serving later items.
#[tokio::test]
async fn upstream_failure_reads_as_empty_and_pipeline_survives() {
    let mut pipeline = Pipeline::new(config("paired-fail"));
    pipeline
        .add_stage(
            FnStage::pooled(|mut item: WorkItem<Bytes>, _| async move {
                let pipe = match item.take_pipe_writer() {
                    Some(pipe) => pipe,
                    None => return Err(StageError::failed("missing pipe writer")),
                };
                drop(pipe);
                Err(StageError::failed("upstream boom"))
            })
            .paired()
            .accept_when(|item| item.payload.is_empty()),
        )
        .unwrap();
    pipeline
        .add_stage(reader_stage().accept_when(|item| item.payload.is_empty()))
        .unwrap();

    let failed = pipeline
        .submit(WorkItem::new(Bytes::new()))
        .unwrap()
        .join()
        .await
        .unwrap();

    assert!(failed.is_failed());
    assert!(!failed.failures().is_empty());
    assert!(failed
        .failures()
        .iter()
        .any(|f| f.message.contains("upstream boom")));
    assert_eq!(extra_u64(&failed, "bytes_read"), Some(0));
    assert!(failed.payload.is_empty());

    // A payload that skips the failing pair still flows through untouched.
    let skipped = pipeline
        .submit(WorkItem::new(Bytes::from_static(b"later")))
        .unwrap()
        .result()
        .await
        .unwrap();
    assert_eq!(skipped.payload.as_ref(), b"later");

    pipeline.shutdown().await.unwrap();
    assert!(pipeline.was_graceful_shutdown());
}

/// The last stage declaring pairing finalizes the item with a
/// `PairedLastStage` failure.
#[tokio::test]
async fn last_stage_pairing_is_rejected() {
    let mut pipeline = Pipeline::new(config("paired-last"));
    pipeline.add_stage(writer_stage(b"never")).unwrap();

    let item = pipeline
        .submit(WorkItem::new(Bytes::new()))
        .unwrap()
        .join()
        .await
        .unwrap();

    assert!(item.is_failed());
    assert_eq!(item.failures()[0].kind, FailureKind::PairedLastStage);
    assert_eq!(item.failures()[0].stage, Some(0));

    pipeline.shutdown().await.unwrap();
}

/// Both paired completions are merged before any later stage runs: stage 2
/// must see the extras of both halves.
#[tokio::test]
async fn paired_halves_merge_before_next_stage() {
    let mut pipeline = Pipeline::new(config("paired-batch"));
    pipeline.add_stage(writer_stage(b"payload")).unwrap();
    pipeline.add_stage(reader_stage()).unwrap();
    pipeline
        .add_stage(FnStage::inline(|mut item: WorkItem<Bytes>, _| async move {
            if item.extra("bytes_written").is_none() || item.extra("bytes_read").is_none() {
                return Err(StageError::failed(
                    "paired results were not merged before the next stage",
                ));
            }
            item.set_extra("both_seen", true);
            Ok(item)
        }))
        .unwrap();

    let item = pipeline
        .submit(WorkItem::new(Bytes::new()))
        .unwrap()
        .result()
        .await
        .unwrap();
    assert_eq!(item.extra("both_seen").and_then(Value::as_bool), Some(true));
    assert_eq!(item.stage(), 3);

    pipeline.shutdown().await.unwrap();
}

/// Either predicate of a pair refusing skips the upstream stage by one and
/// re-evaluates from there.
#[tokio::test]
async fn refused_pair_is_skipped() {
    // Upstream refuses outright: the walk falls through both stages to the
    // final one.
    let mut pipeline = Pipeline::new(config("paired-skip-up"));
    pipeline
        .add_stage(writer_stage(b"never").accept_when(|_| false))
        .unwrap();
    pipeline
        .add_stage(reader_stage().accept_when(|_| false))
        .unwrap();
    pipeline
        .add_stage(FnStage::inline(|mut item: WorkItem<Bytes>, _| async move {
            item.payload = Bytes::from_static(b"tail only");
            Ok(item)
        }))
        .unwrap();

    let item = pipeline
        .submit(WorkItem::new(Bytes::new()))
        .unwrap()
        .result()
        .await
        .unwrap();
    assert_eq!(item.payload.as_ref(), b"tail only");

    pipeline.shutdown().await.unwrap();

    // Downstream refusing also skips the pair.
    let mut pipeline = Pipeline::new(config("paired-skip-down"));
    pipeline.add_stage(writer_stage(b"never")).unwrap();
    pipeline
        .add_stage(reader_stage().accept_when(|_| false))
        .unwrap();
    pipeline
        .add_stage(FnStage::inline(|mut item: WorkItem<Bytes>, _| async move {
            item.payload = Bytes::from_static(b"tail only");
            Ok(item)
        }))
        .unwrap();

    let item = pipeline
        .submit(WorkItem::new(Bytes::new()))
        .unwrap()
        .result()
        .await
        .unwrap();
    assert_eq!(item.payload.as_ref(), b"tail only");

    pipeline.shutdown().await.unwrap();
}

/// Streaming more data than the pipe buffers forces real interleaving; every
/// byte is accounted for on both endpoints.
#[tokio::test]
async fn multi_chunk_stream_accounts_all_bytes() {
    const CHUNK: usize = 32 * 1024;
    const CHUNKS: usize = 6;

    let mut pipeline = Pipeline::new(PipelineConfig {
        name: "paired-bulk".into(),
        max_simultaneous: Some(1),
        pipe_capacity: 16 * 1024,
    });
    pipeline
        .add_stage(
            FnStage::pooled(|mut item: WorkItem<Bytes>, _| async move {
                let mut pipe = match item.take_pipe_writer() {
                    Some(pipe) => pipe,
                    None => return Err(StageError::failed("missing pipe writer")),
                };
                for i in 0..CHUNKS {
                    let chunk = vec![i as u8; CHUNK];
                    pipe.write(&chunk).await?;
                }
                pipe.write_eof(b"").await?;
                item.set_extra("bytes_written", pipe.tell());
                Ok(item)
            })
            .paired(),
        )
        .unwrap();
    pipeline.add_stage(reader_stage()).unwrap();

    let item = pipeline
        .submit(WorkItem::new(Bytes::new()))
        .unwrap()
        .result()
        .await
        .unwrap();

    let total = (CHUNK * CHUNKS) as u64;
    assert_eq!(item.payload.len() as u64, total);
    assert_eq!(extra_u64(&item, "bytes_written"), Some(total));
    assert_eq!(extra_u64(&item, "bytes_read"), Some(total));
    for (i, window) in item.payload.chunks(CHUNK).enumerate() {
        assert!(window.iter().all(|b| *b == i as u8));
    }

    pipeline.shutdown().await.unwrap();
}

/// Several paired items in flight at once make progress even with the
/// smallest admission setting: the second pool guarantees every admitted
/// upstream half has a downstream half draining its pipe.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_paired_items_make_progress() {
    const ITEMS: usize = 4;

    let mut pipeline = Pipeline::new(PipelineConfig {
        name: "paired-concurrent".into(),
        max_simultaneous: Some(1),
        pipe_capacity: 8 * 1024,
    });
    pipeline
        .add_stage(
            FnStage::pooled(|mut item: WorkItem<Bytes>, _| async move {
                let mut pipe = match item.take_pipe_writer() {
                    Some(pipe) => pipe,
                    None => return Err(StageError::failed("missing pipe writer")),
                };
                let data = item.payload.clone();
                for chunk in data.chunks(4 * 1024) {
                    pipe.write(chunk).await?;
                }
                pipe.write_eof(b"").await?;
                Ok(item)
            })
            .paired(),
        )
        .unwrap();
    pipeline.add_stage(reader_stage()).unwrap();

    let handles: Vec<_> = (0..ITEMS)
        .map(|i| {
            let payload = Bytes::from(vec![i as u8; 64 * 1024]);
            pipeline.submit(WorkItem::new(payload)).unwrap()
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let item = handle.result().await.unwrap();
        assert_eq!(item.payload.len(), 64 * 1024);
        assert!(item.payload.iter().all(|b| *b == i as u8));
    }

    pipeline.shutdown().await.unwrap();
    assert!(pipeline.was_graceful_shutdown());
    assert!(pipeline.anomalies().is_empty());
}
