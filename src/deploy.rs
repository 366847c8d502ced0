// src/deploy.rs

//! The deploy driver
//!
//! Orchestrates one deployment end to end: resolve the plan, build the
//! execution tree, fingerprint and rewrite it against the resume point
//! and the cache, check requirements, run, clean up. Any failure below
//! is wrapped in a single `Blocking` frame and the resume file is left
//! behind for the next `--resume`.

use crate::beep::Beeper;
use crate::cache::{BackupCache, NullCache, StateCache};
use crate::config::Project;
use crate::error::{Error, Result};
use crate::hash::StateHash;
use crate::logger::DeployLog;
use crate::plan::{ActionPlan, PlanBuilder};
use crate::resume::ResumeStore;
use crate::sqlrunner::SqlRunner;
use crate::task::{RequirementSink, TaskContext, TaskRegistry};
use crate::transform::RestoreDatabasesTransform;
use crate::tree::{CalculateContext, ExecutionNode, GroupNode, RunContext};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Per-invocation switches (the CLI flags)
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Override the project's default release
    pub release: Option<String>,
    /// Override the user's environment
    pub environment: Option<String>,
    /// Narrate without side effects
    pub dry_run: bool,
    /// Require the resume file and start from its hash
    pub resume: bool,
    /// Use a null cache: no hits, no adds, no collection
    pub no_cache: bool,
}

/// Drives a deployment of one project
pub struct Deployer {
    project: Project,
    runner: Arc<dyn SqlRunner>,
    beeper: Box<dyn Beeper>,
}

impl Deployer {
    pub fn new(project: Project, runner: Arc<dyn SqlRunner>, beeper: Box<dyn Beeper>) -> Self {
        Self {
            project,
            runner,
            beeper,
        }
    }

    /// Run a deployment; returns the final state hash
    pub fn deploy(&self, opts: &DeployOptions) -> Result<StateHash> {
        self.beeper.beep("start");
        match self.run_deployment(opts) {
            Ok(hash) => {
                self.beeper.beep("success");
                Ok(hash)
            }
            Err(err) => {
                self.beeper.beep("error");
                Err(err.blocking())
            }
        }
    }

    fn run_deployment(&self, opts: &DeployOptions) -> Result<StateHash> {
        let user = &self.project.user;
        let environment = opts
            .environment
            .as_deref()
            .unwrap_or(&user.environment)
            .to_string();
        let active = opts
            .release
            .as_deref()
            .unwrap_or(&self.project.config.default_release);

        let plan = PlanBuilder::new(&self.project, &environment).build(active)?;
        let cache = self.open_cache(opts);
        let resume_store = ResumeStore::new(&self.project.root);

        let tree = self.build_tree(&plan, &environment)?;

        let starting = if opts.resume {
            Some(resume_store.load()?)
        } else {
            None
        };

        // Calculate pass: fingerprint everything from the empty state and
        // rewrite the tree against the resume point and the cache
        let databases = &self.project.config.databases;
        let calc_ctx = CalculateContext {
            databases,
            connection: &user.connection,
            runner: &self.runner,
        };
        let calced =
            ExecutionNode::Group(tree).calculate(&calc_ctx, StateHash::empty(), starting, cache.as_ref())?;

        // A resume hash that no leaf reproduces means the inputs changed
        // underneath the interrupted run; starting mid-tree would deploy
        // the wrong states
        if opts.resume && !calced.resumed {
            return Err(Error::ResumeInvalid(
                starting.map(|h| h.to_hex()).unwrap_or_default(),
            ));
        }

        // Touch the cache entries the rewrite will restore from so the
        // collector treats them as hot
        if calced.changed {
            if let Some(cache_hash) = calced.cache_hash {
                let keys: Vec<_> = databases.iter().map(|db| (db.clone(), cache_hash)).collect();
                cache.update_hits(&keys)?;
            }
        }

        // Requirements pass: abort before any side effect
        if let Some(node) = &calced.node {
            let mut sink = RequirementSink::new();
            node.gather_requirements(&mut sink);
            if sink.finish() {
                return Err(Error::UnmetRequirements);
            }
        }

        // Run pass
        let log = DeployLog::new();
        let run_ctx = RunContext {
            databases,
            dry_run: opts.dry_run,
            min_deploy_time: Duration::from_secs_f64(user.min_deploy_time.max(0.0)),
            resume: &resume_store,
        };
        let inbound = starting.unwrap_or_else(StateHash::empty);
        let final_hash = match &calced.node {
            Some(node) => node.run(&run_ctx, cache.as_ref(), inbound, true, true, &log)?,
            None => {
                log.say("nothing to do, already at the requested state");
                calced.hash
            }
        };

        if !opts.dry_run {
            resume_store.clear()?;
        }

        info!("deployment complete at {:?}", final_hash);
        Ok(final_hash)
    }

    fn open_cache(&self, opts: &DeployOptions) -> Box<dyn StateCache> {
        if opts.no_cache {
            return Box::new(NullCache);
        }
        let settings = &self.project.user.cache;
        let root = PathBuf::from(&settings.root_path);
        let root = if root.is_absolute() {
            root
        } else {
            self.project.root.join(root)
        };
        Box::new(BackupCache::new(
            root,
            settings.max_cache_size,
            settings.auto_gc,
            self.project.user.connection.clone(),
            true,
            self.runner.clone(),
        ))
    }

    /// Root group: the baseline restore, then one group per release with
    /// one group per feature holding its task leaves
    fn build_tree(&self, plan: &ActionPlan, environment: &str) -> Result<GroupNode> {
        let registry = TaskRegistry::new(self.project.tasks.clone());
        let mut root = GroupNode::new(None, None);

        let mut restore = ExecutionNode::group("Restoring databases...");
        restore.push(ExecutionNode::transform(Box::new(
            RestoreDatabasesTransform::new(
                self.project.user.connection.clone(),
                plan.databases.clone(),
                self.runner.clone(),
            ),
        )));
        root.push(ExecutionNode::Group(restore));

        for release in &plan.releases {
            let mut release_group =
                GroupNode::new(Some(format!("Release {}...", release.name)), None);

            for feature_name in &release.features {
                let feature = self
                    .project
                    .features
                    .get(feature_name)
                    .ok_or_else(|| Error::UnknownFeature(feature_name.clone()))?;

                let ctx = TaskContext {
                    vars: HashMap::from([
                        ("release".to_string(), release.name.clone()),
                        ("feature".to_string(), feature.name.clone()),
                        ("env".to_string(), environment.to_string()),
                    ]),
                    feature: HashMap::from([
                        ("name".to_string(), feature.name.clone()),
                        ("dir".to_string(), feature.base_dir.display().to_string()),
                    ]),
                    base_dir: feature.base_dir.clone(),
                    environment: environment.to_string(),
                    connection: self.project.user.connection.clone(),
                    runner: self.runner.clone(),
                };

                let mut feature_group =
                    GroupNode::new(Some(format!("Feature {}...", feature.name)), None);
                for task in &feature.recipe {
                    for transform in registry.instantiate(&ctx, task)? {
                        feature_group.push(ExecutionNode::transform(transform));
                    }
                }
                release_group.push(ExecutionNode::Group(feature_group));
            }

            root.push(ExecutionNode::Group(release_group));
        }

        Ok(root)
    }
}
