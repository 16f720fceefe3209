//! A toy interpreter and a harness that wires it to a bridge over duplex channels.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use exobridge::Bridge;
use exobridge::BridgeConfig;
use exobridge::CallScope;
use exobridge::DuplexChannelTransport;
use exobridge::Error;
use exobridge::Interpreter;
use exobridge::Kwargs;
use exobridge::Result;
use exobridge::WorkerConfig;
use exobridge::WorkerHandle;
use exobridge::WorkerServer;
use exobridge::tagpack::Opaque;
use exobridge::tagpack::StreamKind;
use exobridge::tagpack::Value;

/// Counts what reached the workers.
#[derive(Default)]
pub struct Stats {
    pub calls: AtomicUsize,
    pub pulls: AtomicUsize,
}

impl Stats {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }
}

pub struct Counter(AtomicI64);

pub struct Lock(AtomicBool);

type Generator = Mutex<std::vec::IntoIter<i64>>;

/// Module `toy`:
/// - `add(a, b)`, `echo(x)`, `whoami()`, `sleep(ms)`, `fail()`
/// - `counter(start)` returns a live `Counter`
/// - `slow_counter(ms)` sleeps, then returns a live `Counter`
/// - `range(n)` returns a generator over `0..n`
/// - `with_lock()` returns `[1, 2, <Lock>, 4]`
/// - `deep(n)` returns a list nested `n` levels deep
/// - `apply(callback, *args)` invokes a host callback
/// - `lend(callback)` invokes a host callback with a fresh `Counter`
pub struct Toy {
    name: String,
    stats: Arc<Stats>,
}

impl Toy {
    pub fn new(name: impl Into<String>, stats: Arc<Stats>) -> Self {
        Self {
            name: name.into(),
            stats,
        }
    }
}

fn int(args: &[Value], i: usize) -> Result<i64> {
    args.get(i)
        .and_then(Value::as_int)
        .ok_or_else(|| Error::foreign("TypeError", format!("argument {} must be an int", i)))
}

fn counter(target: &Value) -> Result<&Counter> {
    target
        .as_opaque()
        .and_then(|o| o.downcast_ref::<Counter>())
        .ok_or_else(|| Error::foreign("TypeError", "not a Counter"))
}

#[async_trait::async_trait]
impl Interpreter for Toy {
    async fn call(&self, scope: &CallScope, module: &str, function: &str, args: Vec<Value>, _kwargs: Kwargs) -> Result<Value> {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        if module != "toy" {
            return Err(Error::foreign("ModuleNotFoundError", format!("No module named '{}'", module)));
        }

        match function {
            "add" => Ok(Value::Int(int(&args, 0)? + int(&args, 1)?)),
            "echo" => Ok(args.into_iter().next().unwrap_or(Value::None)),
            "whoami" => Ok(Value::Str(self.name.clone())),
            "sleep" => {
                tokio::time::sleep(Duration::from_millis(int(&args, 0)? as u64)).await;
                Ok(Value::Str(self.name.clone()))
            }
            "fail" => Err(Error::foreign("ValueError", "toy failure")),
            "counter" => Ok(Value::Opaque(Opaque::object(
                "Counter",
                "toy",
                Counter(AtomicI64::new(int(&args, 0).unwrap_or(0))),
            ))),
            "slow_counter" => {
                tokio::time::sleep(Duration::from_millis(int(&args, 0)? as u64)).await;
                Ok(Value::Opaque(Opaque::object("Counter", "toy", Counter(AtomicI64::new(0)))))
            }
            "range" => {
                let items: Vec<i64> = (0..int(&args, 0)?).collect();
                let generator: Generator = Mutex::new(items.into_iter());
                Ok(Value::Opaque(Opaque::stream(StreamKind::Generator, "generator", "toy", generator)))
            }
            "with_lock" => Ok(Value::List(vec![
                Value::Int(1),
                Value::Int(2),
                Value::Opaque(Opaque::object("Lock", "threading", Lock(AtomicBool::new(false)))),
                Value::Int(4),
            ])),
            "deep" => {
                let mut value = Value::Int(0);
                for _ in 0..int(&args, 0)? {
                    value = Value::List(vec![value]);
                }
                Ok(value)
            }
            "apply" => {
                let mut args = args.into_iter();
                let Some(Value::Callback(callback)) = args.next() else {
                    return Err(Error::foreign("TypeError", "first argument must be callable"));
                };
                scope.invoke(&callback, args.collect()).await
            }
            "lend" => {
                let Some(Value::Callback(callback)) = args.first() else {
                    return Err(Error::foreign("TypeError", "first argument must be callable"));
                };
                let lent = Value::Opaque(Opaque::object("Counter", "toy", Counter(AtomicI64::new(0))));
                scope.invoke(callback, vec![lent]).await
            }
            other => Err(Error::foreign(
                "AttributeError",
                format!("module 'toy' has no attribute '{}'", other),
            )),
        }
    }

    async fn call_method(
        &self,
        _scope: &CallScope,
        target: &Value,
        method: &str,
        args: Vec<Value>,
        _kwargs: Kwargs,
    ) -> Result<Value> {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(lock) = target.as_opaque().and_then(|o| o.downcast_ref::<Lock>()) {
            return match method {
                "acquire" => Ok(Value::Bool(!lock.0.swap(true, Ordering::SeqCst))),
                "locked" => Ok(Value::Bool(lock.0.load(Ordering::SeqCst))),
                _ => Err(Error::foreign("AttributeError", format!("'Lock' has no attribute '{}'", method))),
            };
        }

        let counter = counter(target)?;
        match method {
            "increment" => {
                let by = int(&args, 0).unwrap_or(1);
                Ok(Value::Int(counter.0.fetch_add(by, Ordering::SeqCst) + by))
            }
            "get" => Ok(Value::Int(counter.0.load(Ordering::SeqCst))),
            _ => Err(Error::foreign("AttributeError", format!("'Counter' has no attribute '{}'", method))),
        }
    }

    async fn get_attr(&self, _scope: &CallScope, target: &Value, attr: &str) -> Result<Value> {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        match attr {
            "value" => Ok(Value::Int(counter(target)?.0.load(Ordering::SeqCst))),
            _ => Err(Error::foreign("AttributeError", format!("no attribute '{}'", attr))),
        }
    }

    async fn set_attr(&self, _scope: &CallScope, target: &Value, attr: &str, value: Value) -> Result<()> {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        let new = value
            .as_int()
            .ok_or_else(|| Error::foreign("TypeError", "value must be an int"))?;
        match attr {
            "value" => {
                counter(target)?.0.store(new, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(Error::foreign("AttributeError", format!("can't set attribute '{}'", attr))),
        }
    }

    async fn module_attr(&self, _scope: &CallScope, module: &str, attr: &str) -> Result<Value> {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        match (module, attr) {
            ("toy", "VERSION") => Ok(Value::Str("1.0".into())),
            _ => Err(Error::foreign(
                "AttributeError",
                format!("module '{}' has no attribute '{}'", module, attr),
            )),
        }
    }

    async fn next(&self, _scope: &CallScope, stream: &Value) -> Result<Option<Value>> {
        self.stats.pulls.fetch_add(1, Ordering::SeqCst);
        let generator = stream
            .as_opaque()
            .and_then(|o| o.downcast_ref::<Generator>())
            .ok_or_else(|| Error::foreign("TypeError", "object is not an iterator"))?;
        let mut items = generator
            .lock()
            .map_err(|_| Error::foreign("RuntimeError", "generator already executing"))?;
        Ok(items.next().map(Value::Int))
    }
}

/// A bridge with `workers` toy workers in the default pool, named `w1`, `w2`, ...
pub struct Harness {
    pub bridge: Bridge,
    pub workers: Vec<WorkerHandle>,
    pub stats: Arc<Stats>,
}

impl Harness {
    pub fn new(workers: usize) -> Self {
        Self::with_config(workers, |_| {})
    }

    pub fn with_config(workers: usize, configure: impl FnOnce(&mut BridgeConfig)) -> Self {
        exobridge::telemetry::init_with_default("warn");

        let stats = Arc::new(Stats::default());
        let mut builder = Bridge::builder().configure(configure);
        let mut handles = Vec::new();

        for i in 1..=workers {
            let (host, worker) = DuplexChannelTransport::pair();
            let server = WorkerServer::new(Toy::new(format!("w{}", i), stats.clone()), WorkerConfig::default());
            handles.push(server.spawn(worker));
            builder = builder.worker(host);
        }

        Self {
            bridge: builder.build().expect("Failed to build bridge"),
            workers: handles,
            stats,
        }
    }

    /// Live objects across all workers.
    pub fn live_refs(&self) -> usize {
        self.workers.iter().map(|w| w.registry().len()).sum()
    }

    pub fn live_refs_in(&self, session_id: &str) -> usize {
        self.workers.iter().map(|w| w.registry().session_len(session_id)).sum()
    }
}

/// Polls `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
