// src/transform/copy.rs

//! The `copy` task: synchronize matched files into a target directory

use crate::config::TaskParams;
use crate::error::{Error, Result};
use crate::hash::{HashTransformer, StateHash};
use crate::logger::DeployLog;
use crate::task::{RequirementSink, StateTransform, TaskContext};
use regex::Regex;
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;
use tracing::debug;

/// Copies files whose base name matches a pattern from one directory to
/// another, skipping files whose destination already carries the source's
/// modification time
pub struct CopyTransform {
    from: PathBuf,
    to: PathBuf,
    pattern: Regex,
}

impl CopyTransform {
    pub fn from_params(ctx: &TaskContext, params: &TaskParams) -> Result<Self> {
        let from = ctx.resolve_path(&ctx.text_param(params, "from")?);
        let to = ctx.resolve_path(&ctx.text_param(params, "to")?);
        let pattern = ctx.text_param(params, "regex")?;
        let pattern = Regex::new(&pattern)
            .map_err(|e| Error::config_parse(from.clone(), format!("copy regex: {}", e)))?;

        Ok(Self { from, to, pattern })
    }

    fn matches(&self) -> Result<Vec<(String, PathBuf)>> {
        super::matched_files(&self.from, &self.pattern)
    }

    fn copy_one(&self, relative: &str, source: &PathBuf) -> Result<bool> {
        let dest = self.to.join(relative);
        let source_mtime = fs::metadata(source)?.modified()?;

        if let Ok(meta) = fs::metadata(&dest) {
            if meta.modified().ok() == Some(source_mtime) {
                return Ok(false);
            }
            let mut perms = meta.permissions();
            if perms.readonly() {
                perms.set_readonly(false);
                fs::set_permissions(&dest, perms)?;
            }
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, &dest)?;
        set_mtime(&dest, source_mtime)?;
        Ok(true)
    }
}

fn set_mtime(path: &PathBuf, mtime: SystemTime) -> Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path)?;
    file.set_times(fs::FileTimes::new().set_modified(mtime))?;
    Ok(())
}

impl StateTransform for CopyTransform {
    fn describe(&self) -> String {
        format!("copy {} -> {}", self.from.display(), self.to.display())
    }

    fn calculate(&self, input: &StateHash) -> Result<StateHash> {
        let mut t = HashTransformer::new(input);
        for (relative, path) in self.matches()? {
            t.update_file(&relative, &path)?;
        }
        Ok(t.finish())
    }

    fn requirements(&self, sink: &mut RequirementSink) {
        sink.require_dir(&self.from);
    }

    fn run(&self, input: &StateHash, dry_run: bool, log: &DeployLog) -> Result<StateHash> {
        let hash = self.calculate(input)?;
        let matches = self.matches()?;

        if dry_run {
            log.say(&format!(
                "would copy {} file(s) from {} to {}",
                matches.len(),
                self.from.display(),
                self.to.display()
            ));
            return Ok(hash);
        }

        fs::create_dir_all(&self.to)?;

        let mut copied = 0usize;
        for (relative, source) in &matches {
            if self.copy_one(relative, source)? {
                copied += 1;
            } else {
                debug!("unchanged, skipping {}", relative);
            }
        }
        log.say(&format!(
            "copied {} of {} file(s) to {}",
            copied,
            matches.len(),
            self.to.display()
        ));

        Ok(hash)
    }
}
