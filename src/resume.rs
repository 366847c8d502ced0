// src/resume.rs

//! Resume record for interrupted deployments
//!
//! After every executed leaf the engine overwrites `.dbbm.resume` at the
//! project root with the leaf's output hash as a single hex line. A later
//! `--resume` run loads that hash and the Calculate pass skips every leaf
//! up to and including the one that produced it. The file is deleted on
//! full success and left intact on any failure.

use crate::error::{Error, Result};
use crate::hash::StateHash;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the resume record, relative to the project root
pub const RESUME_FILE: &str = ".dbbm.resume";

/// Loads and stores the last-successful state hash
#[derive(Debug, Clone)]
pub struct ResumeStore {
    path: PathBuf,
}

impl ResumeStore {
    /// Resume store for a project root
    pub fn new(project_root: &Path) -> Self {
        Self {
            path: project_root.join(RESUME_FILE),
        }
    }

    /// Path of the resume file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a resume record exists
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the recorded hash
    ///
    /// Fails with `ResumeMissing` when there is no record and
    /// `ResumeInvalid` when the content does not parse as a hex hash.
    pub fn load(&self) -> Result<StateHash> {
        if !self.path.exists() {
            return Err(Error::ResumeMissing(self.path.clone()));
        }
        let text = fs::read_to_string(&self.path)?;
        let line = text.trim();
        StateHash::from_hex(line).map_err(|_| Error::ResumeInvalid(line.to_string()))
    }

    /// Overwrite the record with `hash`
    pub fn save(&self, hash: &StateHash) -> Result<()> {
        fs::write(&self.path, format!("{}\n", hash.to_hex()))?;
        debug!("resume point {:?}", hash);
        Ok(())
    }

    /// Remove the record after a fully successful run
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
