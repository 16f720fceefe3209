//! Tests for the peer, pool and router against hand-driven duplex transports.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;
use tagpack::SymbolTable;
use tokio::time::Instant;

use crate::callback::CallbackRegistry;
use crate::callback::Origin;
use crate::duplex::DuplexChannelTransport;
use crate::error::Error;
use crate::frame::CallType;
use crate::frame::Envelope;
use crate::frame::Frame;
use crate::frame::FrameHead;
use crate::frame::MAX_FRAME_DEPTH;
use crate::frame::Outcome;
use crate::peer::Peer;
use crate::pool::Pool;
use crate::pool::Worker;
use crate::pool::WorkerId;
use crate::router;
use crate::router::Affinity;
use crate::transport::Transport;

fn callbacks() -> Arc<CallbackRegistry> {
    Arc::new(CallbackRegistry::new(SymbolTable::new(), Duration::from_secs(1)))
}

fn peer(id: WorkerId) -> (Peer, DuplexChannelTransport) {
    let (host, worker) = DuplexChannelTransport::pair();
    let origin = Origin {
        pool: "test".into(),
        worker: id,
    };
    (Peer::new(id.to_string(), Box::new(host), callbacks(), origin), worker)
}

/// A pool of `n` workers whose far ends are kept alive but never answer.
fn pool(n: u64) -> (Arc<Pool>, Vec<DuplexChannelTransport>) {
    let pool = Arc::new(Pool::new("test"));
    let mut ends = Vec::new();
    for i in 1..=n {
        let (peer, end) = peer(WorkerId(i));
        pool.insert(Worker::new(WorkerId(i), "test", peer));
        ends.push(end);
    }
    (pool, ends)
}

fn deadline(ms: u64) -> Instant {
    Instant::now() + Duration::from_millis(ms)
}

// ============================================================================
//  PEER
// ============================================================================

#[tokio::test]
async fn test_peer_correlates_replies_by_seq() {
    let (peer, worker) = peer(WorkerId(1));
    let peer = Arc::new(peer);

    let mut first = Envelope::new(CallType::DynamicCall);
    first.function = Some("first".into());
    let mut second = Envelope::new(CallType::DynamicCall);
    second.function = Some("second".into());

    let a = tokio::spawn({
        let peer = peer.clone();
        async move { peer.call(first, deadline(1000)).await }
    });
    let b = tokio::spawn({
        let peer = peer.clone();
        async move { peer.call(second, deadline(1000)).await }
    });

    let mut calls = Vec::new();
    for _ in 0..2 {
        let bytes = worker.recv().await.unwrap().unwrap();
        match Frame::from_bytes(&bytes).unwrap() {
            Frame::Call { seq, envelope } => calls.push((seq, envelope.function.unwrap())),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    // answer out of order
    for (seq, function) in calls.into_iter().rev() {
        let reply = Frame::Reply {
            seq,
            result: Outcome::Ok {
                value: Json::from(function),
            },
        };
        worker.send(&reply.to_bytes().unwrap()).await.unwrap();
    }

    assert_eq!(a.await.unwrap().unwrap(), Json::from("first"));
    assert_eq!(b.await.unwrap().unwrap(), Json::from("second"));
    assert_eq!(peer.in_flight(), 0);
}

#[tokio::test]
async fn test_peer_times_out_and_forgets_the_call() {
    let (peer, _worker) = peer(WorkerId(1));
    let result = peer.call(Envelope::new(CallType::DynamicCall), deadline(20)).await;
    assert_eq!(result, Err(Error::Timeout));
    assert_eq!(peer.in_flight(), 0);
}

#[tokio::test]
async fn test_peer_fails_pending_calls_when_worker_hangs_up() {
    let (peer, worker) = peer(WorkerId(1));
    let call = tokio::spawn(async move { peer.call(Envelope::new(CallType::DynamicCall), deadline(1000)).await });

    let _ = worker.recv().await.unwrap();
    worker.close();

    assert!(matches!(call.await.unwrap(), Err(Error::Transport(_))));
    assert_eq!(worker.frames_sent(), 0);
}

#[tokio::test]
async fn test_closed_transport_refuses_to_send() {
    let (host, worker) = DuplexChannelTransport::pair();
    host.send(b"one").await.unwrap();
    assert_eq!(host.frames_sent(), 1);

    host.close();
    assert!(host.is_closed());
    assert!(matches!(host.send(b"two").await, Err(crate::transport::Error::ConnectionLost(_))));

    // what was sent before the hang-up is still delivered
    assert_eq!(worker.recv().await.unwrap(), Some(b"one".to_vec()));
    assert_eq!(worker.recv().await.unwrap(), None);
}

#[tokio::test]
async fn test_peer_surfaces_foreign_errors() {
    let (peer, worker) = peer(WorkerId(1));
    let call = tokio::spawn(async move { peer.call(Envelope::new(CallType::DynamicCall), deadline(1000)).await });

    let bytes = worker.recv().await.unwrap().unwrap();
    let Frame::Call { seq, .. } = Frame::from_bytes(&bytes).unwrap() else {
        panic!("expected a call frame");
    };
    let reply = Frame::Reply {
        seq,
        result: Outcome::from(Err(Error::foreign("ValueError", "bad input"))),
    };
    worker.send(&reply.to_bytes().unwrap()).await.unwrap();

    match call.await.unwrap() {
        Err(Error::Foreign { message, detail }) => {
            assert_eq!(message, "bad input");
            assert_eq!(detail.as_deref(), Some("ValueError"));
        }
        other => panic!("expected a foreign error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_reply_fails_only_its_call() {
    let (peer, worker) = peer(WorkerId(1));
    let peer = Arc::new(peer);

    let broken = tokio::spawn({
        let peer = peer.clone();
        async move { peer.call(Envelope::new(CallType::DynamicCall), deadline(1000)).await }
    });
    let bytes = worker.recv().await.unwrap().unwrap();
    let Frame::Call { seq, .. } = Frame::from_bytes(&bytes).unwrap() else {
        panic!("expected a call frame");
    };
    let garbled = format!(r#"{{"frame":"reply","seq":{},"result":{{"status":"maybe"}}}}"#, seq);
    worker.send(garbled.as_bytes()).await.unwrap();
    worker.send(b"not json at all").await.unwrap();

    assert!(matches!(broken.await.unwrap(), Err(Error::Protocol(_))));
    assert!(!peer.is_closed());

    let healthy = tokio::spawn({
        let peer = peer.clone();
        async move { peer.call(Envelope::new(CallType::DynamicCall), deadline(1000)).await }
    });
    let bytes = worker.recv().await.unwrap().unwrap();
    let Frame::Call { seq, .. } = Frame::from_bytes(&bytes).unwrap() else {
        panic!("expected a call frame");
    };
    let reply = Frame::Reply {
        seq,
        result: Outcome::Ok { value: Json::from(7) },
    };
    worker.send(&reply.to_bytes().unwrap()).await.unwrap();
    assert_eq!(healthy.await.unwrap().unwrap(), Json::from(7));
}

#[tokio::test]
async fn test_hung_up_worker_is_not_routable() {
    let (pool, ends) = pool(2);
    ends[0].close();

    let worker = pool.get(WorkerId(1)).unwrap();
    for _ in 0..100 {
        if worker.peer().is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(worker.is_tainted());

    let checkout = router::checkout(&pool, Some(WorkerId(1)), Affinity::Hint).await.unwrap();
    assert_eq!(checkout.worker().id(), WorkerId(2));
    assert!(matches!(
        router::checkout(&pool, Some(WorkerId(1)), Affinity::StrictQueue).await,
        Err(Error::PreferredWorkerUnavailable(WorkerId(1)))
    ));

    // restoring by hand does not bring a dead connection back
    pool.restore(WorkerId(1));
    assert!(worker.is_tainted());
}

// ============================================================================
//  ROUTER
// ============================================================================

#[tokio::test]
async fn test_checkout_without_preference_takes_lowest_free_worker() {
    let (pool, _ends) = pool(3);
    let first = router::checkout(&pool, None, Affinity::Hint).await.unwrap();
    assert_eq!(first.worker().id(), WorkerId(1));

    let second = router::checkout(&pool, None, Affinity::StrictFailFast).await.unwrap();
    assert_eq!(second.worker().id(), WorkerId(2));
}

#[tokio::test]
async fn test_fail_fast_busy_preferred_worker() {
    let (pool, _ends) = pool(2);
    let held = router::checkout(&pool, Some(WorkerId(1)), Affinity::StrictFailFast).await.unwrap();

    let result = router::checkout(&pool, Some(WorkerId(1)), Affinity::StrictFailFast).await;
    assert!(matches!(result, Err(Error::WorkerBusy(WorkerId(1)))));

    drop(held);
    let again = router::checkout(&pool, Some(WorkerId(1)), Affinity::StrictFailFast).await.unwrap();
    assert_eq!(again.worker().id(), WorkerId(1));
}

#[tokio::test]
async fn test_hint_falls_back_when_preferred_is_busy() {
    let (pool, _ends) = pool(2);
    let _held = router::checkout(&pool, Some(WorkerId(1)), Affinity::Hint).await.unwrap();

    let fallback = router::checkout(&pool, Some(WorkerId(1)), Affinity::Hint).await.unwrap();
    assert_eq!(fallback.worker().id(), WorkerId(2));
}

#[tokio::test]
async fn test_strict_queue_waits_for_preferred_worker() {
    let (pool, _ends) = pool(2);
    let held = router::checkout(&pool, Some(WorkerId(1)), Affinity::StrictQueue).await.unwrap();

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move {
            router::checkout(&pool, Some(WorkerId(1)), Affinity::StrictQueue)
                .await
                .map(|c| c.worker().id())
        }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    drop(held);
    assert_eq!(waiter.await.unwrap().unwrap(), WorkerId(1));
}

#[tokio::test]
async fn test_strict_modes_reject_tainted_preferred_worker() {
    let (pool, _ends) = pool(2);
    pool.taint(WorkerId(1));

    for mode in [Affinity::StrictQueue, Affinity::StrictFailFast] {
        let result = router::checkout(&pool, Some(WorkerId(1)), mode).await;
        assert!(matches!(result, Err(Error::PreferredWorkerUnavailable(WorkerId(1)))));
    }

    let hint = router::checkout(&pool, Some(WorkerId(1)), Affinity::Hint).await.unwrap();
    assert_eq!(hint.worker().id(), WorkerId(2));
}

#[tokio::test]
async fn test_strict_modes_reject_removed_preferred_worker() {
    let (pool, _ends) = pool(1);
    pool.remove(WorkerId(1));
    let result = router::checkout(&pool, Some(WorkerId(1)), Affinity::StrictQueue).await;
    assert!(matches!(result, Err(Error::PreferredWorkerUnavailable(WorkerId(1)))));
}

#[tokio::test]
async fn test_any_free_worker_wakes_on_release() {
    let (pool, _ends) = pool(1);
    let held = router::checkout(&pool, None, Affinity::Hint).await.unwrap();

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { router::checkout(&pool, None, Affinity::Hint).await.map(|c| c.worker().id()) }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(held);

    let id = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap().unwrap();
    assert_eq!(id, WorkerId(1));
}

#[tokio::test]
async fn test_empty_pool_has_no_worker() {
    let pool = Pool::new("empty");
    let result = router::checkout(&pool, None, Affinity::Hint).await;
    assert!(matches!(result, Err(Error::NoWorkerAvailable { .. })));
}

#[tokio::test]
async fn test_try_checkout_never_waits() {
    let (pool, _ends) = pool(1);
    let _held = router::try_checkout(&pool, None, Affinity::Hint, false).unwrap();

    assert!(matches!(
        router::try_checkout(&pool, None, Affinity::Hint, false),
        Err(Error::NoWorkerAvailable { .. })
    ));
    assert!(matches!(
        router::try_checkout(&pool, Some(WorkerId(1)), Affinity::StrictQueue, false),
        Err(Error::WorkerBusy(WorkerId(1)))
    ));
}

#[tokio::test]
async fn test_try_checkout_does_not_leave_a_pinned_worker() {
    let (pool, _ends) = pool(2);
    let _held = router::try_checkout(&pool, Some(WorkerId(1)), Affinity::Hint, true).unwrap();

    assert!(matches!(
        router::try_checkout(&pool, Some(WorkerId(1)), Affinity::Hint, true),
        Err(Error::NoWorkerAvailable { .. })
    ));
    // unpinned, the same call may go elsewhere
    let fallback = router::try_checkout(&pool, Some(WorkerId(1)), Affinity::Hint, false).unwrap();
    assert_eq!(fallback.worker().id(), WorkerId(2));
}

#[tokio::test]
async fn test_restored_worker_is_routable_again() {
    let (pool, _ends) = pool(1);
    pool.taint(WorkerId(1));
    assert!(matches!(
        router::try_checkout(&pool, None, Affinity::Hint, false),
        Err(Error::NoWorkerAvailable { .. })
    ));

    pool.restore(WorkerId(1));
    let checkout = router::try_checkout(&pool, None, Affinity::Hint, false).unwrap();
    assert_eq!(checkout.worker().id(), WorkerId(1));
}

#[test]
fn test_affinity_parse() {
    assert_eq!(Affinity::parse("hint"), Some(Affinity::Hint));
    assert_eq!(Affinity::parse("strict_queue"), Some(Affinity::StrictQueue));
    assert_eq!(Affinity::parse("strict_fail_fast"), Some(Affinity::StrictFailFast));
    assert_eq!(Affinity::parse("sticky"), None);
    assert_eq!(Affinity::default(), Affinity::Hint);
}

// ============================================================================
//  WIRE
// ============================================================================

#[test]
fn test_reply_shape_keeps_error_lookalikes_as_values() {
    let value = serde_json::json!({"status": "error", "error": "just a dict"});
    let reply = Frame::Reply {
        seq: 3,
        result: Outcome::Ok { value: value.clone() },
    };
    let bytes = reply.to_bytes().unwrap();
    let json: Json = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["frame"], Json::from("reply"));
    assert_eq!(json["result"]["status"], Json::from("ok"));

    match Frame::from_bytes(&bytes).unwrap() {
        Frame::Reply { result, .. } => assert_eq!(result.into_result().unwrap(), value),
        other => panic!("unexpected frame {:?}", other),
    }
}

fn nested_reply(levels: usize) -> String {
    format!(
        r#"{{"frame":"reply","seq":1,"result":{{"status":"ok","value":{}0{}}}}}"#,
        "[".repeat(levels),
        "]".repeat(levels)
    )
}

#[test]
fn test_frames_nest_past_the_json_default_limit() {
    // a tuple in a tuple costs two JSON levels per value level
    let bytes = nested_reply(2 * tagpack::MAX_DEPTH);
    assert!(matches!(Frame::from_bytes(bytes.as_bytes()), Ok(Frame::Reply { .. })));

    let bytes = nested_reply(MAX_FRAME_DEPTH);
    match Frame::from_bytes(bytes.as_bytes()) {
        Err(Error::Protocol(message)) => assert!(message.contains("levels deep"), "{}", message),
        other => panic!("expected a protocol error, got {:?}", other),
    }
}

#[test]
fn test_frame_head_survives_a_bad_body() {
    let head = FrameHead::peek(br#"{"frame":"call","seq":9,"envelope":{"call_type":"teleport"}}"#);
    assert_eq!(head, Some(FrameHead { frame: "call".into(), seq: 9 }));

    // brackets inside strings do not count as nesting
    let text = format!(r#"{{"frame":"reply","seq":2,"result":{{"status":"ok","value":"{}"}}}}"#, "[".repeat(1000));
    assert!(Frame::from_bytes(text.as_bytes()).is_ok());

    assert_eq!(FrameHead::peek(b"{\"seq\":1}"), None);
}

#[test]
fn test_errors_survive_the_wire() {
    let errors = [
        Error::foreign("KeyError", "'missing'"),
        Error::RefNotFound { ref_id: "abc".into() },
        Error::InvalidRef("no id".into()),
        Error::InvalidEnvelope("missing session_id".into()),
        Error::WorkerBusy(WorkerId(4)),
        Error::ArityMismatch {
            callback_id: "cb:1".into(),
            expected: 2,
            got: 3,
        },
        Error::StreamExhausted,
        Error::Timeout,
    ];

    for error in errors {
        assert_eq!(Error::from_wire(error.to_wire()), error);
    }
}

#[test]
fn test_host_only_errors_cross_as_foreign() {
    let wire = Error::PoolNotFound("gpu".into()).to_wire();
    assert_eq!(wire.detail.as_deref(), Some("pool_not_found"));
    assert!(matches!(Error::from_wire(wire), Error::Foreign { .. }));
}
