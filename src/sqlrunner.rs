// src/sqlrunner.rs

//! SQL subprocess adapters
//!
//! The engine never talks to SQL Server directly; it drives the narrow
//! [`SqlRunner`] seam. [`SqlCmdRunner`] is the shipped adapter: it spawns
//! `sqlcmd` with stdin nulled and a timeout guard, captures stderr, and
//! maps a non-zero exit to `SqlFailure`. Tests substitute a recording
//! fake.

use crate::error::{Error, Result};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;
use wait_timeout::ChildExt;

/// Default timeout for a single SQL subprocess (30 minutes)
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Subprocess contract the engine consumes
pub trait SqlRunner: Send + Sync {
    /// Stream a native backup of `database` to `out_path`
    fn backup_database(
        &self,
        connection: &str,
        database: &str,
        out_path: &Path,
        compress: bool,
    ) -> Result<()>;

    /// Restore `database` from a backup file, replacing its current state
    fn restore_database(&self, connection: &str, database: &str, backup_path: &Path)
        -> Result<()>;

    /// Execute a SQL script text against the connection
    fn exec_script(&self, connection: &str, script: &str) -> Result<()>;
}

/// `sqlcmd`-based runner
pub struct SqlCmdRunner {
    timeout: Duration,
}

impl SqlCmdRunner {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run `sqlcmd` with `-b` (exit code on error) plus the given args
    fn sqlcmd(&self, connection: &str, args: &[&str]) -> Result<()> {
        let mut child = Command::new("sqlcmd")
            .arg("-S")
            .arg(connection)
            .arg("-b")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let status = match child.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                child.kill()?;
                child.wait()?;
                return Err(Error::SqlFailure {
                    code: -1,
                    stderr: format!("sqlcmd timed out after {:?}", self.timeout),
                });
            }
        };

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }

        if !status.success() {
            return Err(Error::SqlFailure {
                code: status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        debug!("sqlcmd {:?} succeeded", args.first().copied().unwrap_or(""));
        Ok(())
    }

    fn quote_path(path: &Path) -> String {
        path.to_string_lossy().replace('\'', "''")
    }
}

impl Default for SqlCmdRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlRunner for SqlCmdRunner {
    fn backup_database(
        &self,
        connection: &str,
        database: &str,
        out_path: &Path,
        compress: bool,
    ) -> Result<()> {
        let compression = if compress { ", COMPRESSION" } else { "" };
        let query = format!(
            "BACKUP DATABASE [{}] TO DISK = N'{}' WITH INIT, COPY_ONLY{}",
            database,
            Self::quote_path(out_path),
            compression
        );
        self.sqlcmd(connection, &["-Q", &query])
    }

    fn restore_database(
        &self,
        connection: &str,
        database: &str,
        backup_path: &Path,
    ) -> Result<()> {
        let query = format!(
            "RESTORE DATABASE [{}] FROM DISK = N'{}' WITH REPLACE",
            database,
            Self::quote_path(backup_path)
        );
        self.sqlcmd(connection, &["-Q", &query])
    }

    fn exec_script(&self, connection: &str, script: &str) -> Result<()> {
        // sqlcmd reads scripts from a file; stage the text through a temp
        // file so GO separators and long scripts behave
        let mut staged = tempfile::NamedTempFile::new()?;
        staged.write_all(script.as_bytes())?;
        staged.flush()?;

        let input = staged.path().to_string_lossy().to_string();
        self.sqlcmd(connection, &["-i", &input])
    }
}
