use serde_json::Value;

use workpipe::{FnStage, Pipeline, PipelineConfig, WorkItem};

/// Many items with mixed placements and per-item skip decisions: every
/// submission completes exactly once with the expected payload.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fifty_items_mixed_stages() {
    let mut pipeline = Pipeline::new(PipelineConfig {
        name: "stress".into(),
        max_simultaneous: Some(8),
        ..Default::default()
    });

    pipeline
        .add_stage(FnStage::inline(|mut item: WorkItem<String>, _| async move {
            item.payload.push('a');
            Ok(item)
        }))
        .unwrap();
    pipeline
        .add_stage(
            FnStage::pooled(|mut item: WorkItem<String>, _| async move {
                item.payload.push('b');
                Ok(item)
            })
            .accept_when(|item| {
                item.extra("want_b").and_then(Value::as_bool).unwrap_or(false)
            }),
        )
        .unwrap();
    pipeline
        .add_stage(FnStage::pooled(|mut item: WorkItem<String>, _| async move {
            item.payload.push('c');
            Ok(item)
        }))
        .unwrap();

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let mut item = WorkItem::new(format!("{i}:"));
            if i % 2 == 0 {
                item.set_extra("want_b", true);
            }
            (i, pipeline.submit(item).unwrap())
        })
        .collect();

    for (i, handle) in handles {
        let item = handle.result().await.unwrap();
        let expected = if i % 2 == 0 {
            format!("{i}:abc")
        } else {
            format!("{i}:ac")
        };
        assert_eq!(item.payload, expected);
        assert_eq!(item.stage(), 3);
    }

    pipeline.shutdown().await.unwrap();
    assert!(pipeline.was_graceful_shutdown());
    assert!(pipeline.anomalies().is_empty());
}
