// src/tree.rs

//! The execution tree and its two-pass protocol
//!
//! A deployment is a finite rooted tree: group nodes frame and order
//! their children, transform nodes do the work. Both passes thread a
//! "current hash" through the tree in depth-first pre-order, so the hash
//! entering leaf `k+1` is exactly the hash leaf `k` produced.
//!
//! The Calculate pass computes every leaf's fingerprint without side
//! effects and rewrites the tree on the way back up: a leaf whose output
//! equals the resume hash is dropped together with everything before it,
//! and a leaf whose output state is fully cached is replaced by a
//! cache-restore group, again superseding everything before it. The Run
//! pass then executes whatever survived.

use crate::cache::StateCache;
use crate::error::Result;
use crate::hash::StateHash;
use crate::logger::DeployLog;
use crate::resume::ResumeStore;
use crate::sqlrunner::SqlRunner;
use crate::task::{RequirementSink, StateTransform};
use crate::transform::RestoreDatabasesTransform;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// An interior node: framing logs plus ordered children
pub struct GroupNode {
    pub enter: Option<String>,
    pub leave: Option<String>,
    pub children: Vec<ExecutionNode>,
}

impl GroupNode {
    pub fn new(enter: Option<String>, leave: Option<String>) -> Self {
        Self {
            enter,
            leave,
            children: Vec::new(),
        }
    }

    pub fn push(&mut self, child: ExecutionNode) {
        self.children.push(child);
    }
}

/// A node is either a group or a single transform, never both
pub enum ExecutionNode {
    Group(GroupNode),
    Transform(Box<dyn StateTransform>),
}

impl ExecutionNode {
    pub fn group(enter: impl Into<String>) -> GroupNode {
        GroupNode::new(Some(enter.into()), None)
    }

    pub fn transform(t: Box<dyn StateTransform>) -> Self {
        Self::Transform(t)
    }
}

/// Result of the Calculate pass over one node
pub struct Calculated {
    /// The rewritten node; `None` when the node was consumed by a resume
    /// match or elided as an empty group
    pub node: Option<ExecutionNode>,
    /// Hash after this node
    pub hash: StateHash,
    /// A resume match or cache substitution happened in this subtree
    pub changed: bool,
    /// The leaf hit the resume point (distinguishes resume from cache rewrites)
    pub resumed: bool,
    /// Hash of the latest cache substitution in this subtree
    pub cache_hash: Option<StateHash>,
}

/// Shared inputs of the Calculate pass
pub struct CalculateContext<'a> {
    /// Project databases, in declared order
    pub databases: &'a [String],
    pub connection: &'a str,
    pub runner: &'a Arc<dyn SqlRunner>,
}

/// Shared inputs of the Run pass
pub struct RunContext<'a> {
    pub databases: &'a [String],
    pub dry_run: bool,
    /// Leaves faster than this are not worth caching
    pub min_deploy_time: Duration,
    pub resume: &'a ResumeStore,
}

impl ExecutionNode {
    /// Calculate pass: fingerprint the subtree and rewrite it against the
    /// resume point and the cache
    pub fn calculate(
        self,
        ctx: &CalculateContext,
        input: StateHash,
        starting: Option<StateHash>,
        cache: &dyn StateCache,
    ) -> Result<Calculated> {
        match self {
            Self::Transform(t) => Self::calculate_transform(t, ctx, input, starting, cache),
            Self::Group(g) => Self::calculate_group(g, ctx, input, starting, cache),
        }
    }

    fn calculate_transform(
        t: Box<dyn StateTransform>,
        ctx: &CalculateContext,
        input: StateHash,
        starting: Option<StateHash>,
        cache: &dyn StateCache,
    ) -> Result<Calculated> {
        let hash = t.calculate(&input)?;

        // Resume point: this leaf already ran; the group above drops it
        // and everything before it
        if starting == Some(hash) {
            debug!("resume point at {:?}", hash);
            return Ok(Calculated {
                node: None,
                hash,
                changed: true,
                resumed: true,
                cache_hash: None,
            });
        }

        // Cache short-circuit: only when every project database has a
        // backup at this exact state
        let mut backups = Vec::with_capacity(ctx.databases.len());
        for db in ctx.databases {
            match cache.try_get(db, &hash, false)? {
                Some(path) => backups.push((db.clone(), path)),
                None => break,
            }
        }
        if !ctx.databases.is_empty() && backups.len() == ctx.databases.len() {
            debug!("cache hit at {:?}", hash);
            let restore = RestoreDatabasesTransform::with_result_hash(
                ctx.connection,
                backups,
                hash,
                ctx.runner.clone(),
            );
            let mut group = ExecutionNode::group("Restoring state from cache...");
            group.push(ExecutionNode::transform(Box::new(restore)));
            return Ok(Calculated {
                node: Some(ExecutionNode::Group(group)),
                hash,
                changed: true,
                resumed: false,
                cache_hash: Some(hash),
            });
        }

        Ok(Calculated {
            node: Some(Self::Transform(t)),
            hash,
            changed: false,
            resumed: false,
            cache_hash: None,
        })
    }

    fn calculate_group(
        g: GroupNode,
        ctx: &CalculateContext,
        input: StateHash,
        starting: Option<StateHash>,
        cache: &dyn StateCache,
    ) -> Result<Calculated> {
        let mut hash = input;
        let mut kept: Vec<ExecutionNode> = Vec::new();
        let mut changed = false;
        let mut resumed = false;
        let mut cache_hash = None;

        for child in g.children {
            let c = child.calculate(ctx, hash, starting, cache)?;
            hash = c.hash;

            // A resume match or cache substitution supersedes every
            // earlier sibling
            if c.changed {
                kept.clear();
                changed = true;
            }
            resumed |= c.resumed;
            if c.cache_hash.is_some() {
                cache_hash = c.cache_hash;
            }
            if let Some(node) = c.node {
                kept.push(node);
            }
        }

        // An empty group after rewriting is elided
        let node = if kept.is_empty() {
            None
        } else {
            Some(Self::Group(GroupNode {
                enter: g.enter,
                leave: g.leave,
                children: kept,
            }))
        };

        Ok(Calculated {
            node,
            hash,
            changed,
            resumed,
            cache_hash,
        })
    }

    /// Requirements pass: every transform reports its preconditions
    pub fn gather_requirements(&self, sink: &mut RequirementSink) {
        match self {
            Self::Transform(t) => t.requirements(sink),
            Self::Group(g) => {
                for child in &g.children {
                    child.gather_requirements(sink);
                }
            }
        }
    }

    /// Run pass: execute the subtree, threading the hash
    ///
    /// `first`/`last` mark the outermost leaves of the whole run; only
    /// interior leaves feed the cache. Call with `first = last = true`
    /// at the root.
    pub fn run(
        &self,
        ctx: &RunContext,
        cache: &dyn StateCache,
        input: StateHash,
        first: bool,
        last: bool,
        log: &DeployLog,
    ) -> Result<StateHash> {
        match self {
            Self::Group(g) => {
                if let Some(enter) = &g.enter {
                    log.say(enter);
                }
                let mut hash = input;
                {
                    let _indent = log.indented();
                    let end = g.children.len().saturating_sub(1);
                    for (i, child) in g.children.iter().enumerate() {
                        hash = child.run(
                            ctx,
                            cache,
                            hash,
                            first && i == 0,
                            last && i == end,
                            log,
                        )?;
                    }
                }
                if let Some(leave) = &g.leave {
                    log.say(leave);
                }
                Ok(hash)
            }
            Self::Transform(t) => {
                log.say(&t.describe());
                let started = Instant::now();
                let output = t.run(&input, ctx.dry_run, log)?;
                let elapsed = started.elapsed();

                if !ctx.dry_run {
                    ctx.resume.save(&output)?;

                    // Interior leaves only: caching the baseline restore is
                    // pointless and caching the finished state is wasteful
                    if !first && !last && elapsed >= ctx.min_deploy_time {
                        for db in ctx.databases {
                            if let Err(e) = cache.add(db, &output) {
                                warn!("cache add for {} failed: {}", db, e);
                            }
                        }
                    }
                }

                Ok(output)
            }
        }
    }
}
