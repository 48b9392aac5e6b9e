use std::collections::HashSet;

use tracing::{debug, warn};

use super::node::{Delivery, Join, Node, NodeId, Waiter};
use super::ParallelTaskGraph;
use crate::error::{Outcome, TaskError};
use crate::graph::cache::Entry;
use crate::task::{BoxTask, Signal};
use crate::value::Value;

impl ParallelTaskGraph {
    /// Resume (or throw into) a node with its pending input.
    pub(super) fn step(&mut self, id: NodeId) {
        let Some(node) = self.arena[id].as_mut() else {
            return;
        };
        if !node.started {
            node.started = true;
            self.stats.tasks_started += 1;
            debug!(node = id, task = %node.task.label(), "task started");
        }
        let result = match node.input.take() {
            Some(Delivery::Throw(error)) => node.task.throw(error),
            Some(Delivery::Resume(value)) => node.task.resume(value),
            None => node.task.resume(Value::None),
        };
        match result {
            Ok(Signal::Return(value)) => self.complete(id, Ok(value)),
            Err(error) => self.complete(id, Err(error)),
            Ok(Signal::Block) => {
                self.blocked.push_back(id);
                self.stats.observe_blocked(self.blocked.len());
            }
            Ok(Signal::Await(child)) => self.fork(id, vec![child], true),
            Ok(Signal::Branch(children)) => self.fork(id, children, false),
        }
    }

    fn fork(&mut self, parent: NodeId, children: Vec<BoxTask>, single: bool) {
        let Some(node) = self.arena[parent].as_mut() else {
            return;
        };
        if children.is_empty() {
            node.input = Some(Delivery::Resume(Value::List(Vec::new())));
            self.ready.push_back(parent);
            return;
        }
        node.join = Some(Join::new(children.len(), single));
        for (slot, child) in children.into_iter().enumerate() {
            // A cached failure may already have settled the join.
            let settled = self.arena[parent].as_ref().map_or(true, |n| n.join.is_none());
            if settled {
                self.stats.cancellations += 1;
                self.discard(child);
                continue;
            }
            self.request(child, Waiter::Parent { node: parent, slot });
        }
    }

    /// Answer `waiter`'s request for `task`: from the cache, by joining the
    /// node already computing it, or by starting a new node.
    pub(super) fn request(&mut self, task: BoxTask, waiter: Waiter) {
        let key = task.cache_key();
        if let Some(key) = &key {
            match self.cache.get(key) {
                Some(Entry::Resolved(outcome)) => {
                    let outcome = outcome.clone();
                    self.stats.cache_hits += 1;
                    self.discard(task);
                    self.deliver(waiter, outcome);
                    return;
                }
                Some(Entry::InProgress(owner)) => {
                    let owner = *owner;
                    self.discard(task);
                    if self.is_ancestor(owner, waiter) {
                        debug!(task = %key, "cyclic request");
                        self.deliver(waiter, Err(TaskError::Cyclic(key.clone())));
                    } else {
                        self.stats.cache_hits += 1;
                        if let Some(node) = self.arena[owner].as_mut() {
                            node.waiters.push(waiter);
                        }
                        self.attach(waiter, owner);
                    }
                    return;
                }
                None => {}
            }
        }

        let id = self.arena.len();
        if let Some(key) = &key {
            self.cache.begin(key.clone(), id);
        }
        self.arena.push(Some(Node::new(task, key, waiter)));
        self.attach(waiter, id);
        self.ready.push_back(id);
    }

    /// Record that `waiter`'s slot is being computed by `child`.
    fn attach(&mut self, waiter: Waiter, child: NodeId) {
        if let Waiter::Parent { node, slot } = waiter {
            if let Some(join) = self.arena[node].as_mut().and_then(|n| n.join.as_mut()) {
                join.children[slot] = Some(child);
            }
        }
    }

    /// Whether `owner` is `waiter` itself or transitively waits on it.
    fn is_ancestor(&self, owner: NodeId, waiter: Waiter) -> bool {
        let mut stack: Vec<NodeId> = waiter.node().into_iter().collect();
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == owner {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.arena[id].as_ref() {
                stack.extend(node.waiters.iter().filter_map(|w| w.node()));
            }
        }
        false
    }

    fn deliver(&mut self, waiter: Waiter, outcome: Outcome) {
        let (parent, slot) = match waiter {
            Waiter::Root => {
                self.root_outcome = Some(outcome);
                return;
            }
            Waiter::Parent { node, slot } => (node, slot),
        };
        let Some(node) = self.arena[parent].as_mut() else {
            return;
        };
        let Some(join) = node.join.as_mut() else {
            return;
        };
        join.children[slot] = None;
        match outcome {
            Ok(value) => {
                join.results[slot] = Some(value);
                join.remaining -= 1;
                if join.remaining == 0 {
                    let value = node.join.take().map(Join::into_value).unwrap_or_default();
                    node.input = Some(Delivery::Resume(value));
                    self.ready.push_back(parent);
                }
            }
            Err(error) => {
                let siblings: Vec<(usize, NodeId)> = join
                    .children
                    .iter()
                    .enumerate()
                    .filter_map(|(s, c)| c.map(|c| (s, c)))
                    .collect();
                node.join = None;
                node.input = Some(match error {
                    TaskError::Abort(value) => Delivery::Resume(value),
                    other => Delivery::Throw(other),
                });
                self.ready.push_back(parent);
                for (s, child) in siblings {
                    self.detach(child, Waiter::Parent { node: parent, slot: s });
                }
            }
        }
    }

    /// Drop one waiter from `child`, cancelling it if nobody is left.
    fn detach(&mut self, child: NodeId, waiter: Waiter) {
        let Some(node) = self.arena[child].as_mut() else {
            return;
        };
        if let Some(pos) = node.waiters.iter().position(|w| *w == waiter) {
            node.waiters.remove(pos);
        }
        if node.waiters.is_empty() {
            self.cancel(child);
        }
    }

    /// Abandon a node and, recursively, the children only it waits on.
    pub(super) fn cancel(&mut self, id: NodeId) {
        let Some(mut node) = self.arena[id].take() else {
            return;
        };
        self.stats.cancellations += 1;
        debug!(node = id, task = %node.task.label(), "task cancelled");
        self.ready.retain(|&n| n != id);
        self.blocked.retain(|&n| n != id);
        if let Some(key) = &node.key {
            self.cache.forget(key, id);
        }
        if let Some(join) = node.join.take() {
            for (slot, child) in join.children.into_iter().enumerate() {
                if let Some(child) = child {
                    self.detach(child, Waiter::Parent { node: id, slot });
                }
            }
        }
        if let Err(e) = node.task.close() {
            warn!(node = id, task = %node.task.label(), error = %e, "closing cancelled task failed");
        }
    }

    /// Close a finished node, cache its outcome and hand it to every waiter.
    fn complete(&mut self, id: NodeId, mut outcome: Outcome) {
        let Some(mut node) = self.arena[id].take() else {
            return;
        };
        if let Err(e) = node.task.close() {
            outcome = Err(e);
        }
        match &outcome {
            Ok(_) => debug!(node = id, task = %node.task.label(), "task finished"),
            Err(e) if e.is_abort() => debug!(node = id, task = %node.task.label(), "task aborted"),
            Err(e) => {
                self.stats.errors += 1;
                debug!(node = id, task = %node.task.label(), error = %e, "task failed");
            }
        }
        if let Some(key) = node.key.take() {
            self.cache.resolve(key, outcome.clone());
        }
        for waiter in node.waiters {
            self.deliver(waiter, outcome.clone());
        }
    }

    /// Close a duplicate or unneeded unit that was never started.
    fn discard(&mut self, mut task: BoxTask) {
        if let Err(e) = task.close() {
            warn!(task = %task.label(), error = %e, "closing unstarted task failed");
        }
    }
}
