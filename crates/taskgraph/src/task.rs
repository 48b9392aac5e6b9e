use std::fmt;

use crate::error::TaskError;
use crate::key::CacheKey;
use crate::value::Value;

/// Owned handle to a unit of work.
pub type BoxTask = Box<dyn Task>;

/// What a unit of work hands back to the runner after each step.
pub enum Signal {
    /// Run every child to completion, then resume with their results as a
    /// [`Value::List`] in submission order.
    Branch(Vec<BoxTask>),
    /// Single-child branch: resume with the child's value itself.
    Await(BoxTask),
    /// Final value of the unit.
    Return(Value),
    /// Cannot progress right now; revisit later without a new input.
    Block,
}

impl Signal {
    pub fn branch<I>(children: I) -> Self
    where
        I: IntoIterator<Item = BoxTask>,
    {
        Signal::Branch(children.into_iter().collect())
    }

    pub fn ret(value: impl Into<Value>) -> Self {
        Signal::Return(value.into())
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Branch(children) => write!(f, "Branch({} tasks)", children.len()),
            Signal::Await(child) => write!(f, "Await({})", child.label()),
            Signal::Return(v) => write!(f, "Return({v})"),
            Signal::Block => write!(f, "Block"),
        }
    }
}

/// A schedulable unit of work.
///
/// The runner calls [`resume`](Task::resume) (or [`throw`](Task::throw)
/// after a failed branch) until the unit returns or fails, then calls
/// [`close`](Task::close) exactly once. `close` is also the only call a
/// unit receives when it is abandoned before finishing.
pub trait Task {
    /// Deduplication identity. `None` means every handle is distinct.
    fn cache_key(&self) -> Option<CacheKey>;

    /// Advance the unit. The first call receives [`Value::None`]; after a
    /// branch, the branch result; after [`Signal::Block`], `Value::None`.
    fn resume(&mut self, input: Value) -> Result<Signal, TaskError>;

    /// Deliver a failure from the last branch. Returning `Err` re-raises.
    fn throw(&mut self, error: TaskError) -> Result<Signal, TaskError>;

    /// Non-blocking readiness check for a blocked unit.
    fn poll(&mut self) -> bool {
        true
    }

    /// Block the calling thread until the unit is ready.
    fn wait(&mut self) {}

    /// Release every resource held by the unit. An error here replaces
    /// the outcome the unit produced.
    fn close(&mut self) -> Result<(), TaskError> {
        Ok(())
    }

    /// Whether stepping this unit blocks the runner thread.
    fn is_exclusive(&self) -> bool {
        false
    }

    fn label(&self) -> String {
        match self.cache_key() {
            Some(key) => key.to_string(),
            None => "<anonymous task>".to_string(),
        }
    }
}

/// Equality used for deduplication: equal keys, or the very same object
/// when neither side has a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskIdentity {
    Keyed(CacheKey),
    Anonymous(usize),
}

impl TaskIdentity {
    pub fn of(task: &dyn Task) -> Self {
        match task.cache_key() {
            Some(key) => TaskIdentity::Keyed(key),
            None => TaskIdentity::Anonymous(std::ptr::from_ref(task).cast::<()>() as usize),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn identity_of_keyed_tasks_compares_keys() {
        let p = probe();
        let a = ScriptedTask::new(Some("same"), &p).boxed();
        let b = ScriptedTask::new(Some("same"), &p).boxed();
        assert_eq!(TaskIdentity::of(a.as_ref()), TaskIdentity::of(b.as_ref()));
    }

    #[test]
    fn identity_of_anonymous_tasks_is_the_object() {
        let p = probe();
        let a = ScriptedTask::new(None, &p).boxed();
        let b = ScriptedTask::new(None, &p).boxed();
        assert_eq!(TaskIdentity::of(a.as_ref()), TaskIdentity::of(a.as_ref()));
        assert_ne!(TaskIdentity::of(a.as_ref()), TaskIdentity::of(b.as_ref()));
    }

    #[test]
    fn default_poll_and_exclusivity() {
        let p = probe();
        let mut t = ScriptedTask::new(None, &p);
        assert!(t.poll());
        assert!(!t.is_exclusive());
        assert_eq!(t.label(), "<anonymous task>");
    }
}
