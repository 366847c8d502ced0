// src/transform/sql.rs

//! The `sql` task: render a deployment script from matched files and
//! optionally execute it
//!
//! Script files are enumerated deterministically and filtered by
//! environment: when the file pattern captures an `env` group, the script
//! only applies to that environment. The rendered script is assembled
//! from `templates.pre`, one `templates.item` per included file (with
//! `$(file)` bound to the relative name), and `templates.post`.

use crate::config::{ParamValue, TaskParams};
use crate::error::{Error, Result};
use crate::hash::{HashTransformer, StateHash};
use crate::logger::DeployLog;
use crate::sqlrunner::SqlRunner;
use crate::task::{RequirementSink, StateTransform, TaskContext};
use crate::vars::{self, VarScope};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Renders and executes a SQL script over matched script files
pub struct SqlTransform {
    path: PathBuf,
    pattern: Regex,
    execute: bool,
    output: Option<PathBuf>,
    pre: Option<String>,
    item: Option<String>,
    post: Option<String>,
    environment: String,
    connection: String,
    runner: Arc<dyn SqlRunner>,
}

impl SqlTransform {
    pub fn from_params(ctx: &TaskContext, params: &TaskParams) -> Result<Self> {
        let path = ctx.resolve_path(&ctx.text_param(params, "path")?);
        let pattern = ctx.text_param(params, "regex")?;
        let pattern = Regex::new(&pattern)
            .map_err(|e| Error::config_parse(path.clone(), format!("sql regex: {}", e)))?;

        let execute = params
            .get("execute")
            .and_then(ParamValue::as_flag)
            .unwrap_or(true);
        let output = ctx
            .opt_text_param(params, "output")?
            .map(|p| ctx.resolve_path(&p));

        let templates = params.get("templates").and_then(ParamValue::as_table);
        let template = |name: &str| -> Result<Option<String>> {
            match templates.and_then(|t| t.get(name)).and_then(ParamValue::as_text) {
                Some(text) => Ok(Some(ctx.expand(&text)?)),
                None => Ok(None),
            }
        };

        Ok(Self {
            path,
            pattern,
            execute,
            output,
            pre: template("pre")?,
            item: template("item")?,
            post: template("post")?,
            environment: ctx.environment.clone(),
            connection: ctx.connection.clone(),
            runner: ctx.runner.clone(),
        })
    }

    /// Matched scripts that pass the environment filter, in hash order
    fn included(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut out = Vec::new();
        for (relative, path) in super::matched_files(&self.path, &self.pattern)? {
            let base_name = relative.rsplit('/').next().unwrap_or(&relative);
            if let Some(caps) = self.pattern.captures(base_name) {
                if let Some(env) = caps.name("env") {
                    if env.as_str() != self.environment {
                        continue;
                    }
                }
            }
            out.push((relative, path));
        }
        Ok(out)
    }

    /// Assemble the full script text
    fn render(&self, included: &[(String, PathBuf)]) -> Result<String> {
        let empty = HashMap::new();
        let mut parts: Vec<String> = Vec::new();

        if let Some(pre) = &self.pre {
            parts.push(pre.clone());
        }
        if let Some(item) = &self.item {
            for (relative, _) in included {
                let bindings = HashMap::from([("file".to_string(), relative.clone())]);
                let scope = VarScope {
                    vars: &bindings,
                    feature: &empty,
                };
                parts.push(vars::expand(item, &scope)?);
            }
        }
        if let Some(post) = &self.post {
            parts.push(post.clone());
        }

        Ok(parts.join("\n"))
    }
}

impl StateTransform for SqlTransform {
    fn describe(&self) -> String {
        format!("sql scripts from {}", self.path.display())
    }

    fn calculate(&self, input: &StateHash) -> Result<StateHash> {
        let included = self.included()?;
        let mut t = HashTransformer::new(input);
        for (relative, path) in &included {
            t.update_file(relative, path)?;
        }
        t.update(self.render(&included)?.as_bytes());
        Ok(t.finish())
    }

    fn requirements(&self, sink: &mut RequirementSink) {
        sink.require_dir(&self.path);
    }

    fn run(&self, input: &StateHash, dry_run: bool, log: &DeployLog) -> Result<StateHash> {
        let included = self.included()?;
        let mut t = HashTransformer::new(input);
        for (relative, path) in &included {
            t.update_file(relative, path)?;
        }
        let rendered = self.render(&included)?;
        t.update(rendered.as_bytes());
        let hash = t.finish();

        if dry_run {
            log.say(&format!(
                "would render {} script(s) from {}{}{}",
                included.len(),
                self.path.display(),
                self.output
                    .as_ref()
                    .map(|o| format!(" to {}", o.display()))
                    .unwrap_or_default(),
                if self.execute { " and execute" } else { "" }
            ));
            return Ok(hash);
        }

        if let Some(output) = &self.output {
            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(output, &rendered)?;
            log.say(&format!("wrote {}", output.display()));
        }

        if self.execute {
            if rendered.trim().is_empty() {
                log.say("nothing to execute");
            } else {
                log.say(&format!("executing {} script(s)", included.len()));
                self.runner.exec_script(&self.connection, &rendered)?;
            }
        }

        Ok(hash)
    }
}
