//! Worklist graph rewriting to a fixpoint.
//!
//! A `RuleSet` is an ordered list of rules; the first rule that returns a
//! different node wins. `RuleSet::rewrite` walks the graph with an
//! explicit stack (no recursion, so graph depth is unbounded) and records
//! where every visited node ended up.
//!
//! Two traversal orders:
//! - `Order::SourcesFirst` rewrites all sources, rebuilds the node on the
//!   new sources, then applies rules to the rebuilt node. Any node a rule
//!   produces is itself rewritten the same way.
//! - `Order::NodeFirst` applies rules to a node until none fires before
//!   descending into its sources. The rules see the node as the caller
//!   built it, which is what passes that decide top-down (barrier
//!   insertion, kernel cutting) need.
//!
//! Every successful rule application counts as one step; a pass that
//! exceeds its step budget fails with `GraphError::NoFixpoint`.

use std::collections::{HashMap, VecDeque};

use crate::error::GraphError;
use crate::ir::{Graph, NodeId};

/// A rewrite rule. `Ok(None)` means the rule does not apply.
pub type Rule<C> = fn(&mut Graph, &mut C, NodeId) -> Result<Option<NodeId>, GraphError>;

/// Default rewrite step budget.
pub const DEFAULT_MAX_STEPS: usize = 1_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    SourcesFirst,
    NodeFirst,
}

/// An ordered, named list of rules.
pub struct RuleSet<C> {
    name: &'static str,
    rules: Vec<Rule<C>>,
}

impl<C> Clone for RuleSet<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            rules: self.rules.clone(),
        }
    }
}

/// Result of a rewrite: the new root plus old → new for every node
/// reachable from the old root.
#[derive(Clone, Debug)]
pub struct Rewritten {
    pub root: NodeId,
    pub map: HashMap<NodeId, NodeId>,
    pub steps: usize,
}

impl Rewritten {
    /// Where `id` ended up, or `id` itself if it was not visited.
    pub fn get(&self, id: NodeId) -> NodeId {
        self.map.get(&id).copied().unwrap_or(id)
    }

    /// Push every value of an earlier pass's map through this pass.
    pub fn follow(&self, map: &mut HashMap<NodeId, NodeId>) {
        for v in map.values_mut() {
            *v = self.get(*v);
        }
    }
}

enum Stage {
    Enter,
    Rebuild,
    Link,
}

impl<C> RuleSet<C> {
    pub fn new(name: &'static str, rules: Vec<Rule<C>>) -> Self {
        Self { name, rules }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// This set's rules followed by `other`'s, under a new name.
    pub fn then(mut self, name: &'static str, other: RuleSet<C>) -> Self {
        self.name = name;
        self.rules.extend(other.rules);
        self
    }

    /// Apply the first rule that changes `id`.
    pub fn apply(
        &self,
        g: &mut Graph,
        ctx: &mut C,
        id: NodeId,
    ) -> Result<Option<NodeId>, GraphError> {
        for rule in &self.rules {
            if let Some(new) = rule(g, ctx, id)? {
                if new != id {
                    return Ok(Some(new));
                }
            }
        }
        Ok(None)
    }

    /// Rewrite the graph under `root` until no rule fires.
    pub fn rewrite(
        &self,
        g: &mut Graph,
        root: NodeId,
        ctx: &mut C,
        order: Order,
        max_steps: usize,
    ) -> Result<Rewritten, GraphError> {
        let mut replace: HashMap<NodeId, NodeId> = HashMap::new();
        let mut stack: Vec<(NodeId, Stage, NodeId)> = vec![(root, Stage::Enter, root)];
        // Frames waiting on a source; retried once the stack drains.
        let mut deferred: VecDeque<(NodeId, Stage, NodeId)> = VecDeque::new();
        let mut steps = 0usize;
        let mut deferrals = 0usize;

        let step = |steps: &mut usize| -> Result<(), GraphError> {
            *steps += 1;
            if *steps > max_steps {
                return Err(GraphError::NoFixpoint {
                    pass: self.name,
                    steps: max_steps,
                });
            }
            Ok(())
        };

        while let Some((n, stage, new_n)) = stack.pop().or_else(|| deferred.pop_front()) {
            if replace.contains_key(&n) {
                continue;
            }
            match stage {
                Stage::Enter => {
                    let mut cur = new_n;
                    if order == Order::NodeFirst {
                        while let Some(next) = self.apply(g, ctx, cur)? {
                            step(&mut steps)?;
                            cur = next;
                        }
                    }
                    stack.push((n, Stage::Rebuild, cur));
                    for &x in g.src(cur).iter().rev() {
                        stack.push((x, Stage::Enter, x));
                    }
                }
                Stage::Rebuild => {
                    let src = g.src(new_n).to_vec();
                    let mut new_src = Vec::with_capacity(src.len());
                    for x in &src {
                        match replace.get(x) {
                            Some(&r) => new_src.push(r),
                            None => break,
                        }
                    }
                    if new_src.len() != src.len() {
                        // A source is still in flight; retry once everything
                        // else on the stack is done.
                        deferrals += 1;
                        if deferrals > max_steps {
                            return Err(GraphError::NoFixpoint {
                                pass: self.name,
                                steps: max_steps,
                            });
                        }
                        deferred.push_back((n, Stage::Rebuild, new_n));
                        continue;
                    }
                    let next = if new_src == src {
                        let fired = match order {
                            Order::SourcesFirst => self.apply(g, ctx, new_n)?,
                            Order::NodeFirst => None,
                        };
                        match fired {
                            Some(y) => {
                                step(&mut steps)?;
                                y
                            }
                            None => {
                                g.inherit_metadata(n, new_n);
                                replace.insert(n, new_n);
                                continue;
                            }
                        }
                    } else {
                        let rebuilt = g.replace_src(new_n, new_src);
                        g.inherit_metadata(n, rebuilt);
                        rebuilt
                    };
                    stack.push((n, Stage::Link, next));
                    stack.push((next, Stage::Enter, next));
                }
                Stage::Link => match replace.get(&new_n) {
                    Some(&done) => {
                        g.inherit_metadata(n, done);
                        replace.insert(n, done);
                    }
                    None => {
                        deferrals += 1;
                        if deferrals > max_steps {
                            return Err(GraphError::NoFixpoint {
                                pass: self.name,
                                steps: max_steps,
                            });
                        }
                        deferred.push_back((n, Stage::Link, new_n));
                    }
                },
            }
        }

        let new_root = replace.get(&root).copied().unwrap_or(root);
        tracing::debug!(
            pass = self.name,
            steps,
            nodes = replace.len(),
            "rewrite done"
        );
        Ok(Rewritten {
            root: new_root,
            map: replace,
            steps,
        })
    }
}
