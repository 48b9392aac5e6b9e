use crate::error::TaskError;
use crate::key::CacheKey;
use crate::task::BoxTask;
use crate::value::Value;

pub(crate) type NodeId = usize;

/// Who receives a node's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Waiter {
    Root,
    Parent { node: NodeId, slot: usize },
}

impl Waiter {
    pub(crate) fn node(self) -> Option<NodeId> {
        match self {
            Waiter::Root => None,
            Waiter::Parent { node, .. } => Some(node),
        }
    }
}

/// Input for a node's next step.
#[derive(Debug)]
pub(crate) enum Delivery {
    Resume(Value),
    Throw(TaskError),
}

/// Outstanding branch of a parent node.
#[derive(Debug)]
pub(crate) struct Join {
    pub(crate) results: Vec<Option<Value>>,
    /// Node computing each slot, while it is still running.
    pub(crate) children: Vec<Option<NodeId>>,
    pub(crate) remaining: usize,
    /// Deliver the lone result instead of a list.
    pub(crate) single: bool,
}

impl Join {
    pub(crate) fn new(len: usize, single: bool) -> Self {
        Self {
            results: vec![None; len],
            children: vec![None; len],
            remaining: len,
            single,
        }
    }

    /// Aggregate value once every slot is filled.
    pub(crate) fn into_value(self) -> Value {
        let mut results: Vec<Value> = self.results.into_iter().map(Option::unwrap_or_default).collect();
        if self.single {
            results.pop().unwrap_or_default()
        } else {
            Value::List(results)
        }
    }
}

pub(crate) struct Node {
    pub(crate) task: BoxTask,
    pub(crate) key: Option<CacheKey>,
    pub(crate) waiters: Vec<Waiter>,
    pub(crate) join: Option<Join>,
    pub(crate) input: Option<Delivery>,
    pub(crate) started: bool,
}

impl Node {
    pub(crate) fn new(task: BoxTask, key: Option<CacheKey>, waiter: Waiter) -> Self {
        Self {
            task,
            key,
            waiters: vec![waiter],
            join: None,
            input: None,
            started: false,
        }
    }
}
