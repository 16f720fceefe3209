//! Integration tests for host callbacks invoked from foreign code.

mod support;

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use exobridge::Affinity;
use exobridge::Call;
use exobridge::CallOptions;
use exobridge::Error;
use exobridge::Invocation;
use exobridge::Kwargs;
use exobridge::SessionOptions;
use exobridge::tagpack::CallbackRef;
use exobridge::tagpack::Value;

use support::Harness;

fn apply(callback: &CallbackRef, args: impl IntoIterator<Item = Value>) -> Call {
    Call::new("toy", "apply").arg(Value::Callback(callback.clone())).args(args)
}

#[tokio::test]
async fn test_foreign_code_calls_back_into_the_host() {
    let h = Harness::new(1);
    let ctx = h.bridge.context();

    let add = h.bridge.register_callback_fn(Some(2), |args| {
        let a = args[0].as_int().unwrap_or(0);
        let b = args[1].as_int().unwrap_or(0);
        Ok(Value::Int(a + b))
    });

    let result = h
        .bridge
        .call(&ctx, apply(&add, [Value::Int(2), Value::Int(3)]), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(result, Value::Int(5));
}

#[tokio::test]
async fn test_callback_arity_is_checked() {
    let h = Harness::new(1);
    let ctx = h.bridge.context();
    let add = h.bridge.register_callback_fn(Some(2), |_| Ok(Value::None));

    let result = h.bridge.call(&ctx, apply(&add, [Value::Int(1)]), CallOptions::new()).await;
    assert_eq!(
        result,
        Err(Error::ArityMismatch {
            callback_id: add.id.clone(),
            expected: 2,
            got: 1,
        })
    );
}

#[tokio::test]
async fn test_unregistered_callback() {
    let h = Harness::new(1);
    let ctx = h.bridge.context();
    let noop = h.bridge.register_callback_fn(None, |_| Ok(Value::None));
    assert!(h.bridge.unregister_callback(&noop.id));

    let result = h.bridge.call(&ctx, apply(&noop, []), CallOptions::new()).await;
    assert_eq!(result, Err(Error::CallbackNotFound(noop.id.clone())));
}

#[tokio::test]
async fn test_callback_errors_reach_the_caller() {
    let h = Harness::new(1);
    let ctx = h.bridge.context();
    let boom = h
        .bridge
        .register_callback_fn(None, |_| Err(Error::foreign("KeyError", "'missing'")));

    match h.bridge.call(&ctx, apply(&boom, []), CallOptions::new()).await {
        Err(Error::Foreign { message, detail }) => {
            assert_eq!(message, "'missing'");
            assert_eq!(detail.as_deref(), Some("KeyError"));
        }
        other => panic!("expected a foreign error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_slow_callback_times_out() {
    let h = Harness::with_config(1, |config| config.callback_timeout_ms = 30);
    let ctx = h.bridge.context();
    let slow = h.bridge.register_callback(None, |_: Invocation| async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(Value::None)
    });

    let result = h.bridge.call(&ctx, apply(&slow, []), CallOptions::new()).await;
    assert_eq!(result, Err(Error::Timeout));
}

#[tokio::test]
async fn test_callback_uses_refs_it_was_lent() {
    let h = Harness::new(1);
    let ctx = h.bridge.context();
    let bridge = h.bridge.clone();

    // the only worker is busy running `lend` while the callback calls back in
    let bump = h.bridge.register_callback(Some(1), move |invocation: Invocation| {
        let bridge = bridge.clone();
        async move {
            let counter = invocation.args[0]
                .as_object_ref()
                .cloned()
                .ok_or_else(|| Error::foreign("TypeError", "expected a ref"))?;
            let ctx = bridge.context();
            bridge
                .method_call(&ctx, &counter, "increment", vec![Value::Int(7)], Kwargs::new(), CallOptions::new())
                .await
        }
    });

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        h.bridge
            .call(&ctx, Call::new("toy", "lend").arg(Value::Callback(bump)), CallOptions::new()),
    )
    .await
    .expect("reentrant call deadlocked");
    assert_eq!(result, Ok(Value::Int(7)));
}

#[tokio::test]
async fn test_recursive_callbacks_on_a_single_worker() {
    let h = Harness::new(1);
    let scope = h
        .bridge
        .with_session("recursive", SessionOptions::new().affinity(Affinity::StrictQueue))
        .unwrap();

    let this: Arc<OnceLock<CallbackRef>> = Arc::new(OnceLock::new());
    let countdown = {
        let bridge = h.bridge.clone();
        let this = this.clone();
        h.bridge.register_callback(Some(1), move |invocation: Invocation| {
            let bridge = bridge.clone();
            let this = this.clone();
            async move {
                let n = invocation.args[0].as_int().unwrap_or(0);
                if n == 0 {
                    return Ok(Value::Int(0));
                }
                let callback = this
                    .get()
                    .cloned()
                    .ok_or_else(|| Error::CallbackNotFound("countdown".into()))?;
                let inner = bridge
                    .call(&bridge.context(), apply(&callback, [Value::Int(n - 1)]), CallOptions::new())
                    .await?;
                Ok(Value::Int(inner.as_int().unwrap_or(0) + 1))
            }
        })
    };
    this.set(countdown.clone()).unwrap();

    // host -> worker -> host -> worker -> ... -> host, all on one worker
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        h.bridge.call(&scope, apply(&countdown, [Value::Int(4)]), CallOptions::new()),
    )
    .await
    .expect("recursive callbacks deadlocked");
    assert_eq!(result, Ok(Value::Int(4)));
}

#[tokio::test]
async fn test_callback_sees_the_invoking_session() {
    let h = Harness::new(1);
    let scope = h.bridge.with_session("seen", SessionOptions::new()).unwrap();

    let echo_session = h
        .bridge
        .register_callback(Some(0), |invocation: Invocation| async move { Ok(Value::Str(invocation.session_id)) });

    let result = h.bridge.call(&scope, apply(&echo_session, []), CallOptions::new()).await.unwrap();
    assert_eq!(result, Value::Str("seen".into()));
}
