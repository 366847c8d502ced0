// src/transform/restore.rs

//! Database restore leaf
//!
//! Used in two shapes. The baseline shape (no fixed result hash) starts a
//! deployment: it folds each database name plus a `path|size|mtime`
//! descriptor of its backup into the inbound hash, so a swapped or
//! refreshed baseline backup changes every downstream fingerprint. The
//! cache-restore shape carries the exact state hash its backups were
//! taken at and returns it verbatim; the leaves that follow a cache
//! substitution must see the same hash they would have seen in an
//! uninterrupted run.

use crate::error::Result;
use crate::hash::{HashTransformer, StateHash};
use crate::logger::DeployLog;
use crate::sqlrunner::SqlRunner;
use crate::task::{RequirementSink, StateTransform};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

/// Restores a set of databases from backup files, in order
pub struct RestoreDatabasesTransform {
    connection: String,
    databases: Vec<(String, PathBuf)>,
    result_hash: Option<StateHash>,
    runner: Arc<dyn SqlRunner>,
}

impl RestoreDatabasesTransform {
    /// Baseline shape: fingerprint from backup descriptors
    pub fn new(
        connection: impl Into<String>,
        databases: Vec<(String, PathBuf)>,
        runner: Arc<dyn SqlRunner>,
    ) -> Self {
        Self {
            connection: connection.into(),
            databases,
            result_hash: None,
            runner,
        }
    }

    /// Cache-restore shape: the backups were taken at `result_hash`
    pub fn with_result_hash(
        connection: impl Into<String>,
        databases: Vec<(String, PathBuf)>,
        result_hash: StateHash,
        runner: Arc<dyn SqlRunner>,
    ) -> Self {
        Self {
            connection: connection.into(),
            databases,
            result_hash: Some(result_hash),
            runner,
        }
    }

    pub fn databases(&self) -> &[(String, PathBuf)] {
        &self.databases
    }
}

impl StateTransform for RestoreDatabasesTransform {
    fn describe(&self) -> String {
        let names: Vec<&str> = self.databases.iter().map(|(n, _)| n.as_str()).collect();
        format!("restore databases: {}", names.join(", "))
    }

    fn calculate(&self, input: &StateHash) -> Result<StateHash> {
        if let Some(fixed) = self.result_hash {
            return Ok(fixed);
        }

        let mut t = HashTransformer::new(input);
        for (name, backup) in &self.databases {
            let meta = std::fs::metadata(backup)?;
            let mtime = meta
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            let descriptor = format!("{}|{}|{}", backup.display(), meta.len(), mtime);

            t.update(name.as_bytes());
            t.update([0u8].as_slice());
            t.update(descriptor.as_bytes());
            t.update([0u8].as_slice());
        }
        Ok(t.finish())
    }

    fn requirements(&self, sink: &mut RequirementSink) {
        for (_, backup) in &self.databases {
            sink.require_file(backup);
        }
    }

    fn run(&self, input: &StateHash, dry_run: bool, log: &DeployLog) -> Result<StateHash> {
        let hash = self.calculate(input)?;

        for (name, backup) in &self.databases {
            if dry_run {
                log.say(&format!("would restore {} from {}", name, backup.display()));
            } else {
                log.say(&format!("restoring {} from {}", name, backup.display()));
                self.runner.restore_database(&self.connection, name, backup)?;
            }
        }

        Ok(hash)
    }
}
