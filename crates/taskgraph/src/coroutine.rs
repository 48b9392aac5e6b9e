//! Adapter turning an `async` body into a [`Task`].
//!
//! The body is an ordinary Rust future. Awaiting [`Co::branch`] or
//! [`Co::run`] parks the request in a slot shared with the adapter and
//! returns `Pending`; the adapter surfaces it as a [`Signal`] and, once the
//! runner answers, stores the reply in the same slot and polls again. The
//! future is polled with a no-op waker: it only ever waits on the runner.

use std::any::type_name;
use std::borrow::Cow;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::task::noop_waker_ref;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::key::CacheKey;
use crate::task::{BoxTask, Signal, Task};
use crate::value::Value;

type Body = Pin<Box<dyn Future<Output = Result<Value, TaskError>>>>;

enum Request {
    Branch(Vec<BoxTask>),
    Await(BoxTask),
}

impl Request {
    fn close(self) {
        let tasks = match self {
            Request::Branch(children) => children,
            Request::Await(child) => vec![child],
        };
        for mut task in tasks {
            if let Err(e) = task.close() {
                warn!(task = %task.label(), error = %e, "closing unsubmitted child failed");
            }
        }
    }
}

#[derive(Default)]
struct Exchange {
    request: Option<Request>,
    reply: Option<Result<Value, TaskError>>,
    /// Requests parked while another suspension was outstanding.
    displaced: Vec<Request>,
}

/// Handle through which a coroutine body asks the runner for work.
#[derive(Clone)]
pub struct Co {
    exchange: Rc<RefCell<Exchange>>,
}

impl Co {
    /// Run `children` and resume with their results as a list, in
    /// submission order. If a child aborts, the abort value is returned
    /// instead of the list.
    pub fn branch<I>(&self, children: I) -> Suspend
    where
        I: IntoIterator<Item = BoxTask>,
    {
        self.suspend(Request::Branch(children.into_iter().collect()))
    }

    /// Run one child and resume with its value.
    pub fn run(&self, child: impl Task + 'static) -> Suspend {
        self.suspend(Request::Await(Box::new(child)))
    }

    pub fn run_boxed(&self, child: BoxTask) -> Suspend {
        self.suspend(Request::Await(child))
    }

    fn suspend(&self, request: Request) -> Suspend {
        Suspend {
            exchange: Rc::clone(&self.exchange),
            request: Some(request),
        }
    }
}

/// Future returned by [`Co::branch`] and [`Co::run`].
#[must_use = "a branch only runs when awaited"]
pub struct Suspend {
    exchange: Rc<RefCell<Exchange>>,
    request: Option<Request>,
}

impl Future for Suspend {
    type Output = Result<Value, TaskError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut exchange = this.exchange.borrow_mut();
        if let Some(request) = this.request.take() {
            let busy = exchange.request.is_some()
                || exchange.reply.is_some()
                || !exchange.displaced.is_empty();
            if busy {
                let earlier = exchange.request.take();
                exchange.displaced.extend(earlier);
                exchange.displaced.push(request);
            } else {
                exchange.request = Some(request);
            }
            return Poll::Pending;
        }
        match exchange.reply.take() {
            Some(reply) => Poll::Ready(reply),
            None => Poll::Pending,
        }
    }
}

impl Drop for Suspend {
    fn drop(&mut self) {
        // Never awaited: its children were never handed to the runner.
        if let Some(request) = self.request.take() {
            request.close();
        }
    }
}

/// A suspendable body wrapped as a cacheable [`Task`].
pub struct CoroutineTask {
    key: CacheKey,
    body: Option<Body>,
    exchange: Rc<RefCell<Exchange>>,
    started: bool,
}

impl CoroutineTask {
    /// Build a task whose identity is `name` plus `args`.
    ///
    /// The body is not polled until the first `resume`.
    pub fn named<A, F, Fut, T>(
        name: impl Into<Cow<'static, str>>,
        args: A,
        func: F,
    ) -> Result<Self, TaskError>
    where
        A: Serialize + 'static,
        F: FnOnce(Co, A) -> Fut + 'static,
        Fut: Future<Output = Result<T, TaskError>> + 'static,
        T: Into<Value>,
    {
        let key = CacheKey::new(name, &args)?;
        let exchange = Rc::new(RefCell::new(Exchange::default()));
        let co = Co {
            exchange: Rc::clone(&exchange),
        };
        let body: Body = Box::pin(async move { func(co, args).await.map(Into::into) });
        Ok(Self {
            key,
            body: Some(body),
            exchange,
            started: false,
        })
    }

    fn step(&mut self) -> Result<Signal, TaskError> {
        let Some(body) = self.body.as_mut() else {
            return Err(TaskError::msg(format!("{} resumed after completion", self.key)));
        };
        self.started = true;
        let mut cx = Context::from_waker(noop_waker_ref());
        let polled = panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(&mut cx)));
        match polled {
            Ok(Poll::Ready(result)) => {
                self.body = None;
                result.map(Signal::Return)
            }
            Ok(Poll::Pending) => {
                let displaced = std::mem::take(&mut self.exchange.borrow_mut().displaced);
                if !displaced.is_empty() {
                    self.body = None;
                    debug!(task = %self.key, requests = displaced.len(), "concurrent suspension");
                    displaced.into_iter().for_each(Request::close);
                    return Err(TaskError::ConcurrentSuspension(self.key.clone()));
                }
                let request = self.exchange.borrow_mut().request.take();
                match request {
                    Some(Request::Branch(children)) => Ok(Signal::Branch(children)),
                    Some(Request::Await(child)) => Ok(Signal::Await(child)),
                    None => {
                        self.body = None;
                        Err(TaskError::msg(format!(
                            "{} awaited a future that is not driven by the task graph",
                            self.key
                        )))
                    }
                }
            }
            Err(payload) => {
                self.body = None;
                Err(TaskError::Panicked(panic_message(payload.as_ref())))
            }
        }
    }
}

/// Build a task from `func`, keyed by the function's type and `args`.
///
/// Calling `task_fn` twice with the same function item and equal
/// arguments yields tasks the runner deduplicates. Closures and function
/// pointers are rejected: their type names are shared between different
/// bodies. Use [`CoroutineTask::named`] for those.
pub fn task_fn<A, F, Fut, T>(func: F, args: A) -> Result<CoroutineTask, TaskError>
where
    A: Serialize + 'static,
    F: FnOnce(Co, A) -> Fut + 'static,
    Fut: Future<Output = Result<T, TaskError>> + 'static,
    T: Into<Value>,
{
    let origin = type_name::<F>();
    if origin.contains("{{closure}}") || origin.starts_with("fn(") {
        return Err(TaskError::AnonymousFunction {
            origin: origin.to_string(),
        });
    }
    CoroutineTask::named(origin, args, func)
}

impl Task for CoroutineTask {
    fn cache_key(&self) -> Option<CacheKey> {
        Some(self.key.clone())
    }

    fn resume(&mut self, input: Value) -> Result<Signal, TaskError> {
        if self.started {
            self.exchange.borrow_mut().reply = Some(Ok(input));
        }
        self.step()
    }

    fn throw(&mut self, error: TaskError) -> Result<Signal, TaskError> {
        if !self.started {
            self.body = None;
            return Err(error);
        }
        self.exchange.borrow_mut().reply = Some(Err(error));
        self.step()
    }

    fn close(&mut self) -> Result<(), TaskError> {
        let Some(body) = self.body.take() else {
            return Ok(());
        };
        debug!(task = %self.key, started = self.started, "tearing down suspended coroutine");
        // Dropping the future runs the destructors of its suspended locals.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || drop(body))) {
            warn!(
                task = %self.key,
                reason = %panic_message(payload.as_ref()),
                "coroutine did not close cleanly"
            );
        }
        let (request, displaced) = {
            let mut exchange = self.exchange.borrow_mut();
            exchange.reply = None;
            (exchange.request.take(), std::mem::take(&mut exchange.displaced))
        };
        request.into_iter().chain(displaced).for_each(Request::close);
        Ok(())
    }

    fn label(&self) -> String {
        self.key.to_string()
    }
}

impl fmt::Debug for CoroutineTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineTask")
            .field("key", &self.key)
            .field("started", &self.started)
            .field("finished", &self.body.is_none())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::task::testing::{probe, ScriptedTask};

    async fn double(_co: Co, n: i64) -> Result<i64, TaskError> {
        Ok(n * 2)
    }

    async fn sum_children(co: Co, n: i64) -> Result<i64, TaskError> {
        let children = (0..n).map(|i| Box::new(task_fn(double, i).unwrap()) as BoxTask);
        let results = co.branch(children).await?.into_list()?;
        Ok(results.iter().filter_map(Value::as_int).sum())
    }

    #[test]
    fn key_depends_on_function_and_args() {
        let a = task_fn(double, 1).unwrap();
        let b = task_fn(double, 1).unwrap();
        let c = task_fn(double, 2).unwrap();
        let d = task_fn(sum_children, 1).unwrap();
        assert_eq!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), c.cache_key());
        assert_ne!(a.cache_key(), d.cache_key());
    }

    #[test]
    fn closures_need_an_explicit_name() {
        let err = task_fn(|_co: Co, n: i64| async move { Ok::<_, TaskError>(n + 1) }, 1).unwrap_err();
        assert!(matches!(err, TaskError::AnonymousFunction { .. }), "{err}");

        let plus_one =
            CoroutineTask::named("plus_one", 1, |_co: Co, n: i64| async move { Ok::<_, TaskError>(n + 1) })
                .unwrap();
        let times_hundred =
            CoroutineTask::named("times_hundred", 1, |_co: Co, n: i64| async move {
                Ok::<_, TaskError>(n * 100)
            })
            .unwrap();
        assert_ne!(plus_one.cache_key(), times_hundred.cache_key());
    }

    #[test]
    fn function_pointers_need_an_explicit_name() {
        type Doubler = fn(Co, i64) -> std::future::Ready<Result<i64, TaskError>>;
        fn ready_double(_co: Co, n: i64) -> std::future::Ready<Result<i64, TaskError>> {
            std::future::ready(Ok(n * 2))
        }
        let err = task_fn(ready_double as Doubler, 1).unwrap_err();
        assert!(matches!(err, TaskError::AnonymousFunction { .. }), "{err}");
        assert!(task_fn(ready_double, 1).is_ok());
    }

    #[test]
    fn joined_suspensions_fail_and_close_both_children() {
        let (pa, pb) = (probe(), probe());
        let a = ScriptedTask::new(None, &pa).returning(1);
        let b = ScriptedTask::new(None, &pb).returning(2);
        let mut t = CoroutineTask::named("joiner", (), move |co: Co, ()| async move {
            let (x, y) = futures::join!(co.run(a), co.run(b));
            Ok::<_, TaskError>(x?.as_int().unwrap_or(0) + y?.as_int().unwrap_or(0))
        })
        .unwrap();

        match t.resume(Value::None) {
            Err(TaskError::ConcurrentSuspension(key)) => assert_eq!(key.origin(), "joiner"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(pa.borrow().resumes, 0);
        assert_eq!(pb.borrow().resumes, 0);
        assert_eq!(pa.borrow().closes, 1);
        assert_eq!(pb.borrow().closes, 1);
        assert!(t.close().is_ok());
        assert_eq!(pa.borrow().closes, 1);
    }

    #[test]
    fn unawaited_request_closes_its_child() {
        let p = probe();
        let child = ScriptedTask::new(None, &p).returning(1);
        let mut t = CoroutineTask::named("forgetful", (), move |co: Co, ()| async move {
            drop(co.run(child));
            Ok::<_, TaskError>(())
        })
        .unwrap();
        assert!(matches!(t.resume(Value::None), Ok(Signal::Return(Value::None))));
        assert_eq!(p.borrow().closes, 1);
        assert_eq!(p.borrow().resumes, 0);
    }

    #[test]
    fn unhashable_args_fail_at_construction() {
        let mut args = std::collections::HashMap::new();
        args.insert(vec![1u8], 1);
        let err = CoroutineTask::named("f", args, |_co, _a| async { Ok::<_, TaskError>(()) }).unwrap_err();
        assert!(matches!(err, TaskError::UnhashableArguments { .. }));
    }

    #[test]
    fn plain_body_returns_on_first_resume() {
        let mut t = task_fn(double, 21).unwrap();
        match t.resume(Value::None).unwrap() {
            Signal::Return(v) => assert_eq!(v, Value::Int(42)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(t.resume(Value::None).is_err());
    }

    #[test]
    fn unit_body_returns_none() {
        let mut t = CoroutineTask::named("unit", (), |_co, ()| async { Ok::<_, TaskError>(()) }).unwrap();
        assert!(matches!(t.resume(Value::None), Ok(Signal::Return(Value::None))));
    }

    #[test]
    fn branch_request_round_trip() {
        let mut t = task_fn(sum_children, 3).unwrap();
        match t.resume(Value::None).unwrap() {
            Signal::Branch(children) => assert_eq!(children.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
        let reply = Value::List(vec![Value::Int(0), Value::Int(2), Value::Int(4)]);
        match t.resume(reply).unwrap() {
            Signal::Return(v) => assert_eq!(v, Value::Int(6)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn thrown_error_surfaces_at_await() {
        let mut t = CoroutineTask::named("catch", (), |co, ()| async move {
            let p = probe();
            match co.run(ScriptedTask::new(None, &p)).await {
                Ok(_) => Ok::<_, TaskError>("no error".to_string()),
                Err(e) => Ok(format!("caught: {e}")),
            }
        })
        .unwrap();
        assert!(matches!(t.resume(Value::None), Ok(Signal::Await(_))));
        match t.throw(TaskError::msg("child failed")).unwrap() {
            Signal::Return(v) => assert_eq!(v.as_str(), Some("caught: child failed")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn throw_before_start_reraises() {
        let mut t = task_fn(double, 1).unwrap();
        let err = t.throw(TaskError::msg("early")).unwrap_err();
        assert_eq!(err.to_string(), "early");
    }

    #[test]
    fn foreign_future_is_rejected() {
        let mut t = CoroutineTask::named("pending", (), |_co, ()| async {
            futures::future::pending::<()>().await;
            Ok::<_, TaskError>(())
        })
        .unwrap();
        assert!(t.resume(Value::None).is_err());
    }

    #[test]
    fn panic_becomes_error() {
        let mut t = CoroutineTask::named("panics", (), |_co, ()| async {
            if true {
                panic!("body exploded");
            }
            Ok::<_, TaskError>(())
        })
        .unwrap();
        match t.resume(Value::None) {
            Err(TaskError::Panicked(msg)) => assert_eq!(msg, "body exploded"),
            other => panic!("unexpected {other:?}"),
        }
    }

    struct Guard(Rc<Cell<bool>>);

    impl Drop for Guard {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    #[test]
    fn close_runs_pending_cleanup() {
        let dropped = Rc::new(Cell::new(false));
        let flag = Rc::clone(&dropped);
        let mut t = CoroutineTask::named("cleanup", (), move |co, ()| async move {
            let _guard = Guard(flag);
            let p = probe();
            co.run(ScriptedTask::new(None, &p)).await?;
            Ok::<_, TaskError>(())
        })
        .unwrap();
        assert!(matches!(t.resume(Value::None), Ok(Signal::Await(_))));
        assert!(!dropped.get());
        t.close().unwrap();
        assert!(dropped.get());
        assert!(t.close().is_ok());
    }

    struct ExplodingGuard;

    impl Drop for ExplodingGuard {
        fn drop(&mut self) {
            panic!("refusing to close");
        }
    }

    #[test]
    fn close_tolerates_refusal() {
        let mut t = CoroutineTask::named("stubborn", (), |co, ()| async move {
            let _guard = ExplodingGuard;
            let p = probe();
            co.run(ScriptedTask::new(None, &p)).await?;
            Ok::<_, TaskError>(())
        })
        .unwrap();
        assert!(matches!(t.resume(Value::None), Ok(Signal::Await(_))));
        assert!(t.close().is_ok());
    }
}
