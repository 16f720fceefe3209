//! Integration tests for pulling from foreign generators.

mod support;

use futures::TryStreamExt;

use exobridge::Call;
use exobridge::CallOptions;
use exobridge::Error;
use exobridge::StreamItem;
use exobridge::tagpack::StreamKind;
use exobridge::tagpack::StreamRef;
use exobridge::tagpack::Value;

use support::Harness;

async fn range(h: &Harness, ctx: &exobridge::CallerContext, n: i64) -> StreamRef {
    let value = h
        .bridge
        .call(ctx, Call::new("toy", "range").arg(n), CallOptions::new())
        .await
        .expect("range failed");
    value.as_stream_ref().expect("expected a stream ref").clone()
}

#[tokio::test]
async fn test_generators_come_back_as_stream_refs() {
    let h = Harness::new(1);
    let ctx = h.bridge.context();
    let stream = range(&h, &ctx, 3).await;

    assert_eq!(stream.stream_kind, StreamKind::Generator);
    assert!(!stream.exhausted);
    assert_eq!(h.stats.pulls(), 0);
}

#[tokio::test]
async fn test_pull_until_end() {
    let h = Harness::new(1);
    let ctx = h.bridge.context();
    let stream = range(&h, &ctx, 3).await;

    for expected in 0..3 {
        let item = h.bridge.next(&ctx, &stream, CallOptions::new()).await.unwrap();
        assert_eq!(item, StreamItem::Item(Value::Int(expected)));
    }
    assert_eq!(h.bridge.next(&ctx, &stream, CallOptions::new()).await.unwrap(), StreamItem::End);
    assert_eq!(h.stats.pulls(), 4);
}

#[tokio::test]
async fn test_pulls_after_the_end_stay_local() {
    let h = Harness::new(1);
    let ctx = h.bridge.context();
    let stream = range(&h, &ctx, 1).await;

    let mut cursor = h.bridge.stream(&ctx, stream.clone(), CallOptions::new());
    assert_eq!(cursor.next().await.unwrap(), StreamItem::Item(Value::Int(0)));
    assert_eq!(cursor.next().await.unwrap(), StreamItem::End);
    assert!(cursor.is_done());
    let pulls = h.stats.pulls();

    for _ in 0..3 {
        assert_eq!(cursor.next().await.unwrap(), StreamItem::End);
    }
    // a stale copy of the stream ref is answered from the session's records
    assert!(!stream.exhausted);
    assert_eq!(h.bridge.next(&ctx, &stream, CallOptions::new()).await.unwrap(), StreamItem::End);

    assert_eq!(h.stats.pulls(), pulls);
}

#[tokio::test]
async fn test_stream_adapter_collects_every_item() {
    let h = Harness::new(1);
    let ctx = h.bridge.context();
    let stream = range(&h, &ctx, 5).await;

    let items: Vec<Value> = h
        .bridge
        .stream(&ctx, stream, CallOptions::new())
        .into_stream()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(items, (0..5).map(Value::Int).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_pulls_never_queue_for_a_busy_worker() {
    let h = Harness::new(1);
    let ctx = h.bridge.context();
    let stream = range(&h, &ctx, 3).await;

    let busy = {
        let bridge = h.bridge.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { bridge.call(&ctx, Call::new("toy", "sleep").arg(150), CallOptions::new()).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    let result = h.bridge.next(&ctx, &stream, CallOptions::new()).await;
    assert!(matches!(result, Err(Error::NoWorkerAvailable { .. })), "got {:?}", result);

    busy.await.unwrap().unwrap();
    // the failed pull consumed nothing
    let item = h.bridge.next(&ctx, &stream, CallOptions::new()).await.unwrap();
    assert_eq!(item, StreamItem::Item(Value::Int(0)));
}

#[tokio::test]
async fn test_pulls_stay_on_the_worker_holding_the_stream() {
    let h = Harness::new(2);
    let ctx = h.bridge.context();
    let stream = range(&h, &ctx, 3).await;
    assert_eq!(h.workers[0].registry().len(), 1);

    let busy = {
        let bridge = h.bridge.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { bridge.call(&ctx, Call::new("toy", "sleep").arg(150), CallOptions::new()).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    // w2 is free but does not hold the stream
    let result = h.bridge.next(&ctx, &stream, CallOptions::new()).await;
    assert!(matches!(result, Err(Error::NoWorkerAvailable { .. })), "got {:?}", result);
    assert_eq!(h.stats.pulls(), 0);

    assert_eq!(busy.await.unwrap().unwrap(), Value::Str("w1".into()));
    let item = h.bridge.next(&ctx, &stream, CallOptions::new()).await.unwrap();
    assert_eq!(item, StreamItem::Item(Value::Int(0)));
}

#[tokio::test]
async fn test_streams_belong_to_their_session() {
    let h = Harness::new(1);
    let owner = h.bridge.context();
    let other = h.bridge.context();
    let stream = range(&h, &owner, 3).await;

    let result = h.bridge.next(&other, &stream, CallOptions::new()).await;
    assert!(matches!(result, Err(Error::SessionMismatch { .. })), "got {:?}", result);
}
