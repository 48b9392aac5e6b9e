//! Task execution engine for contest build/test pipelines.
//!
//! Units of work implement [`Task`]. Suspendable bodies are written as
//! `async` functions and wrapped by [`CoroutineTask`]; operating-system
//! processes are wrapped by [`ExternalProcessTask`]. A [`TaskGraph`]
//! runner drives a root task, deduplicates identical units through their
//! [`CacheKey`], and multiplexes blocking processes.

pub mod code;
pub mod config;
pub mod coroutine;
pub mod error;
pub mod graph;
pub mod key;
pub mod process;
pub mod stats;
pub mod task;
pub mod value;
pub mod verdict;

pub use code::{Code, CodeKind};
pub use config::EngineConfig;
pub use coroutine::{task_fn, Co, CoroutineTask, Suspend};
pub use error::{Outcome, TaskError};
pub use graph::{ParallelTaskGraph, SerialTaskGraph, TaskGraph};
pub use key::CacheKey;
pub use process::{ExternalProcessTask, ProcessOutcome, Redirect};
pub use stats::GraphStats;
pub use task::{BoxTask, Signal, Task, TaskIdentity};
pub use value::Value;
pub use verdict::{RunResult, RunStatus};
