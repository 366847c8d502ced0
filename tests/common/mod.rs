// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use dbbm::beep::SilentBeeper;
use dbbm::config::Project;
use dbbm::sqlrunner::SqlRunner;
use dbbm::{Deployer, Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Recording SQL runner
///
/// Backups become real files (the cache depends on that), restores and
/// script executions are recorded. Setting a fail marker makes any
/// script containing it fail, simulating a deployment killed mid-run.
#[derive(Default)]
pub struct FakeSqlRunner {
    pub calls: Mutex<Vec<String>>,
    pub fail_marker: Mutex<Option<String>>,
}

impl FakeSqlRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_marker(&self, marker: Option<&str>) {
        *self.fail_marker.lock().unwrap() = marker.map(str::to_string);
    }

    pub fn take_calls(&self) -> Vec<String> {
        std::mem::take(&mut self.calls.lock().unwrap())
    }
}

impl SqlRunner for FakeSqlRunner {
    fn backup_database(
        &self,
        _connection: &str,
        database: &str,
        out_path: &Path,
        _compress: bool,
    ) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("backup {} -> {}", database, out_path.display()));
        fs::write(out_path, format!("backup of {}", database))?;
        Ok(())
    }

    fn restore_database(&self, _connection: &str, database: &str, backup_path: &Path) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("restore {} <- {}", database, backup_path.display()));
        Ok(())
    }

    fn exec_script(&self, _connection: &str, script: &str) -> Result<()> {
        if let Some(marker) = self.fail_marker.lock().unwrap().as_deref() {
            if script.contains(marker) {
                return Err(Error::SqlFailure {
                    code: 1,
                    stderr: format!("injected failure on '{}'", marker),
                });
            }
        }
        self.calls.lock().unwrap().push(format!("exec {}", script));
        Ok(())
    }
}

/// A scaffolded deployment project in a temp directory
///
/// Keep the struct alive for the lifetime of the test; dropping it
/// removes the directory.
pub struct TestProject {
    pub temp: TempDir,
}

impl TestProject {
    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn resume_path(&self) -> PathBuf {
        self.root().join(".dbbm.resume")
    }

    pub fn hit_table_path(&self) -> PathBuf {
        self.root().join(".dbbm/cache/hit.json")
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.root().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub fn load(&self) -> Project {
        Project::load(self.root()).unwrap()
    }

    pub fn deployer(&self, runner: Arc<FakeSqlRunner>) -> Deployer {
        Deployer::new(self.load(), runner, Box::new(SilentBeeper))
    }
}

/// Standard fixture: releases `r0 <- r1 <- r2` with features `f1` and
/// `f2` (one SQL task each), baseline backups for `r0` at env `dev`,
/// two databases, an instant cache threshold.
pub fn setup_project() -> TestProject {
    let temp = TempDir::new().unwrap();
    let project = TestProject { temp };

    project.write(
        "dbbm.json",
        r#"{
            "databases": ["app", "audit"],
            "releases": "releases.json",
            "features": "features/*.json",
            "defaultRelease": "r2"
        }"#,
    );
    project.write(
        "dbbm.user.json",
        r#"{
            "environment": "dev",
            "connection": "testsrv",
            "minDeployTime": 0.0,
            "cache": {"rootPath": ".dbbm/cache", "maxCacheSize": -1, "autoGC": false}
        }"#,
    );
    project.write(
        "releases.json",
        r#"[
            {"name": "r0"},
            {"name": "r1", "baseline": "r0", "features": ["f1"]},
            {"name": "r2", "baseline": "r1", "features": ["f2"]}
        ]"#,
    );

    for feature in ["f1", "f2"] {
        project.write(
            &format!("features/{}.json", feature),
            &format!(
                r#"{{
                    "name": "{f}",
                    "recipe": [{{
                        "sql": {{
                            "path": "{f}/scripts",
                            "regex": "^\\d+(?:-(?P<env>[a-z]+))?\\..*\\.sql$",
                            "templates": {{
                                "pre": "-- {f}",
                                "item": ":r $$(file)"
                            }}
                        }}
                    }}]
                }}"#,
                f = feature
            ),
        );
    }
    project.write("features/f1/scripts/001.init.sql", "create table one;");
    project.write("features/f2/scripts/001.more.sql", "create table two;");

    project.write("backups/r0-dev-app.bak", "baseline app");
    project.write("backups/r0-dev-audit.bak", "baseline audit");

    project
}
