// src/task.rs

//! Task instantiation: the transform contract, context, and registry
//!
//! A feature recipe entry names a task kind with string parameters. The
//! registry turns each entry into one or more [`StateTransform`] leaves:
//! `copy` and `sql` are builtin; any other kind must match a composite
//! task definition loaded from the project's task files, whose `deploy`
//! command list expands recursively with the instantiation parameters
//! bound as context variables.

use crate::config::{ParamValue, TaskConfig, TaskDef, TaskParams, DEPLOY_COMMAND};
use crate::error::{Error, Result};
use crate::hash::StateHash;
use crate::logger::DeployLog;
use crate::sqlrunner::SqlRunner;
use crate::transform::{CopyTransform, SqlTransform};
use crate::vars::{self, VarScope};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Guard against mutually recursive composite tasks
const MAX_TASK_DEPTH: usize = 16;

// =============================================================================
// Transform contract
// =============================================================================

/// A leaf operation of the execution tree
///
/// `calculate` must be pure and deterministic; `run` performs the side
/// effects and returns the identical hash. In dry-run mode `run` only
/// narrates and must leave the world untouched.
pub trait StateTransform {
    /// One-line description for narration
    fn describe(&self) -> String;

    /// Map the inbound hash to the outbound hash without side effects
    fn calculate(&self, input: &StateHash) -> Result<StateHash>;

    /// Report preconditions into the sink
    fn requirements(&self, sink: &mut RequirementSink);

    /// Perform the side effects; returns the same hash as `calculate`
    fn run(&self, input: &StateHash, dry_run: bool, log: &DeployLog) -> Result<StateHash>;
}

/// Collects unmet preconditions across the whole tree
#[derive(Debug, Default)]
pub struct RequirementSink {
    missing: Vec<String>,
}

impl RequirementSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require an existing directory
    pub fn require_dir(&mut self, path: &Path) {
        if !path.is_dir() {
            self.missing.push(format!("directory not found: {}", path.display()));
        }
    }

    /// Require an existing file
    pub fn require_file(&mut self, path: &Path) {
        if !path.is_file() {
            self.missing.push(format!("file not found: {}", path.display()));
        }
    }

    /// Require any existing path
    pub fn require_path(&mut self, path: &Path) {
        if !path.exists() {
            self.missing.push(format!("path not found: {}", path.display()));
        }
    }

    /// Record an unconditional failure
    pub fn record(&mut self, description: impl Into<String>) {
        self.missing.push(description.into());
    }

    /// Log every recorded failure; true iff any were recorded
    pub fn finish(self) -> bool {
        for miss in &self.missing {
            warn!("unmet requirement: {}", miss);
        }
        !self.missing.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty()
    }
}

// =============================================================================
// Task context
// =============================================================================

/// Everything a task needs to resolve its parameters
#[derive(Clone)]
pub struct TaskContext {
    /// Context and task variables, `$(name)`
    pub vars: HashMap<String, String>,
    /// Feature attributes, `$(f:name)`
    pub feature: HashMap<String, String>,
    /// Feature base directory; relative parameter paths resolve against it
    pub base_dir: PathBuf,
    /// Active environment, used by the SQL script filter
    pub environment: String,
    /// Connection target handed to the SQL runner
    pub connection: String,
    /// Subprocess seam
    pub runner: Arc<dyn SqlRunner>,
}

impl TaskContext {
    /// Expand variable markers in a parameter string
    pub fn expand(&self, input: &str) -> Result<String> {
        vars::expand(
            input,
            &VarScope {
                vars: &self.vars,
                feature: &self.feature,
            },
        )
    }

    /// Fetch and expand a required textual parameter
    pub fn text_param(&self, params: &TaskParams, name: &str) -> Result<String> {
        let value = params
            .get(name)
            .and_then(ParamValue::as_text)
            .ok_or_else(|| Error::Variable(format!("missing task parameter '{}'", name)))?;
        self.expand(&value)
    }

    /// Fetch and expand an optional textual parameter
    pub fn opt_text_param(&self, params: &TaskParams, name: &str) -> Result<Option<String>> {
        match params.get(name).and_then(ParamValue::as_text) {
            Some(value) => Ok(Some(self.expand(&value)?)),
            None => Ok(None),
        }
    }

    /// Resolve a possibly relative path against the feature base directory
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Maps task kinds to transforms
///
/// Builtin kinds are `copy` and `sql`; everything else resolves through
/// the composite definitions loaded from the project's task files.
pub struct TaskRegistry {
    defs: HashMap<String, TaskDef>,
}

impl TaskRegistry {
    pub fn new(defs: HashMap<String, TaskDef>) -> Self {
        Self { defs }
    }

    /// Instantiate one recipe entry into its transform leaves
    pub fn instantiate(
        &self,
        ctx: &TaskContext,
        config: &TaskConfig,
    ) -> Result<Vec<Box<dyn StateTransform>>> {
        self.instantiate_at(ctx, config, 0)
    }

    fn instantiate_at(
        &self,
        ctx: &TaskContext,
        config: &TaskConfig,
        depth: usize,
    ) -> Result<Vec<Box<dyn StateTransform>>> {
        if depth > MAX_TASK_DEPTH {
            return Err(Error::config_parse(
                config.kind.clone(),
                "task definitions nest too deeply (cycle?)",
            ));
        }

        match config.kind.as_str() {
            "copy" => Ok(vec![Box::new(CopyTransform::from_params(ctx, &config.params)?)]),
            "sql" => Ok(vec![Box::new(SqlTransform::from_params(ctx, &config.params)?)]),
            other => {
                let def = self
                    .defs
                    .get(other)
                    .ok_or_else(|| Error::UnknownTask(other.to_string()))?;
                self.expand_composite(ctx, config, def, depth)
            }
        }
    }

    fn expand_composite(
        &self,
        ctx: &TaskContext,
        config: &TaskConfig,
        def: &TaskDef,
        depth: usize,
    ) -> Result<Vec<Box<dyn StateTransform>>> {
        // Sub-context: definition variables first, instantiation parameters
        // on top (parameters win)
        let mut sub = ctx.clone();
        for (name, value) in &def.define {
            let expanded = ctx.expand(value)?;
            sub.vars.insert(name.clone(), expanded);
        }
        for (name, value) in &config.params {
            if let Some(text) = value.as_text() {
                sub.vars.insert(name.clone(), ctx.expand(&text)?);
            }
        }

        let commands = def.commands.get(DEPLOY_COMMAND).ok_or_else(|| {
            Error::config_parse(
                def.name.clone(),
                format!("task has no '{}' command list", DEPLOY_COMMAND),
            )
        })?;

        let mut transforms = Vec::new();
        for entry in commands {
            transforms.extend(self.instantiate_at(&sub, entry, depth + 1)?);
        }

        // The definition's `requires` paths ride along with the first leaf
        // so the requirements pass sees them
        if !def.requires.is_empty() && !transforms.is_empty() {
            let mut paths = Vec::with_capacity(def.requires.len());
            for raw in &def.requires {
                paths.push(sub.resolve_path(&sub.expand(raw)?));
            }
            let first = transforms.remove(0);
            transforms.insert(0, Box::new(WithRequires { inner: first, paths }));
        }

        Ok(transforms)
    }
}

/// Delegating wrapper that adds path preconditions to a transform
struct WithRequires {
    inner: Box<dyn StateTransform>,
    paths: Vec<PathBuf>,
}

impl StateTransform for WithRequires {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn calculate(&self, input: &StateHash) -> Result<StateHash> {
        self.inner.calculate(input)
    }

    fn requirements(&self, sink: &mut RequirementSink) {
        for path in &self.paths {
            sink.require_path(path);
        }
        self.inner.requirements(sink);
    }

    fn run(&self, input: &StateHash, dry_run: bool, log: &DeployLog) -> Result<StateHash> {
        self.inner.run(input, dry_run, log)
    }
}
