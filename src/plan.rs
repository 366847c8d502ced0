// src/plan.rs

//! Baseline resolution and the action plan
//!
//! A deployment starts from the newest release whose baseline backups
//! actually exist on disk. The planner indexes the backup directory by
//! `(release, env, database)` using the configured filename pattern,
//! then walks the release chain backwards from the active release until
//! it finds a complete backup set, stacking the releases it passed; the
//! stacked releases are applied on top of the restored baseline, oldest
//! first.

use crate::config::{Project, Release};
use crate::error::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The planner's output: what to restore, then what to apply
#[derive(Debug, Clone)]
pub struct ActionPlan {
    /// `(database, backup file)` per project database, in declared order
    pub databases: Vec<(String, PathBuf)>,
    /// Releases to apply after the restore, baseline-adjacent first
    pub releases: Vec<Release>,
}

/// Backups found for one environment of one release
type EnvBackups = HashMap<String, PathBuf>;

/// Index of the backup directory: release → environments in discovery
/// order → database → file
#[derive(Debug, Default)]
pub struct BackupIndex {
    releases: HashMap<String, Vec<(Option<String>, EnvBackups)>>,
}

impl BackupIndex {
    /// Scan `dir` with a filename pattern carrying named groups
    /// `release`, `dbName` and optionally `env`
    ///
    /// Files are visited in name order so environment discovery order is
    /// stable across runs. A missing directory indexes as empty.
    pub fn scan(dir: &Path, pattern: &Regex) -> Result<Self> {
        let group_names: Vec<_> = pattern.capture_names().flatten().collect();
        for required in ["release", "dbName"] {
            if !group_names.contains(&required) {
                return Err(Error::config_parse(
                    dir,
                    format!("backup pattern is missing the '{}' group", required),
                ));
            }
        }

        let mut index = Self::default();
        if !dir.is_dir() {
            return Ok(index);
        }

        let mut names: Vec<_> = fs::read_dir(dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();

        for name in names {
            let Some(caps) = pattern.captures(&name) else {
                continue;
            };
            let (Some(release), Some(db)) = (caps.name("release"), caps.name("dbName")) else {
                continue;
            };
            let release = release.as_str().to_string();
            let db = db.as_str().to_string();
            let env = caps.name("env").map(|m| m.as_str().to_string());

            let envs = index.releases.entry(release).or_default();
            let pos = match envs.iter().position(|(e, _)| *e == env) {
                Some(pos) => pos,
                None => {
                    envs.push((env, EnvBackups::new()));
                    envs.len() - 1
                }
            };
            envs[pos].1.insert(db, dir.join(&name));
        }

        Ok(index)
    }

    /// Environments discovered for a release, in discovery order
    fn environments(&self, release: &str) -> &[(Option<String>, EnvBackups)] {
        self.releases
            .get(release)
            .map(|envs| envs.as_slice())
            .unwrap_or(&[])
    }
}

/// Resolves the active release into an [`ActionPlan`]
pub struct PlanBuilder<'a> {
    project: &'a Project,
    environment: &'a str,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(project: &'a Project, environment: &'a str) -> Self {
        Self {
            project,
            environment,
        }
    }

    /// Walk baselines from `active` until a complete backup set is found
    pub fn build(&self, active: &str) -> Result<ActionPlan> {
        let pattern = Regex::new(&self.project.user.backup_pattern).map_err(|e| {
            Error::config_parse(
                self.project.root.join(crate::config::USER_FILE),
                format!("backup pattern: {}", e),
            )
        })?;
        let backup_dir = self.project.root.join(&self.project.user.backup_path);
        let index = BackupIndex::scan(&backup_dir, &pattern)?;

        let mut stack: Vec<Release> = Vec::new();
        let mut head = self
            .project
            .release(active)
            .ok_or_else(|| Error::UnknownRelease(active.to_string()))?;

        loop {
            if let Some(databases) = self.complete_set(&index, &head.name) {
                debug!(
                    "baseline resolved at release '{}' ({} stacked)",
                    head.name,
                    stack.len()
                );
                stack.reverse();
                return Ok(ActionPlan {
                    databases,
                    releases: stack,
                });
            }

            stack.push(head.clone());
            match &head.baseline {
                None => return Err(Error::NoBaseline(head.name.clone())),
                Some(baseline) => {
                    head = self
                        .project
                        .release(baseline)
                        .ok_or_else(|| Error::UnknownRelease(baseline.clone()))?;
                }
            }
        }
    }

    /// A complete set has one backup per project database; the preferred
    /// environment wins, then discovery order
    fn complete_set(
        &self,
        index: &BackupIndex,
        release: &str,
    ) -> Option<Vec<(String, PathBuf)>> {
        let envs = index.environments(release);

        let preferred = envs
            .iter()
            .filter(|(env, _)| env.as_deref() == Some(self.environment));
        let fallbacks = envs
            .iter()
            .filter(|(env, _)| env.as_deref() != Some(self.environment));

        for (_, backups) in preferred.chain(fallbacks) {
            if let Some(set) = self.full_set(backups) {
                return Some(set);
            }
        }
        None
    }

    fn full_set(&self, backups: &EnvBackups) -> Option<Vec<(String, PathBuf)>> {
        let mut set = Vec::with_capacity(self.project.config.databases.len());
        for db in &self.project.config.databases {
            set.push((db.clone(), backups.get(db)?.clone()));
        }
        Some(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProjectConfig, UserConfig};
    use std::collections::HashMap as Map;
    use tempfile::TempDir;

    fn release(name: &str, baseline: Option<&str>) -> Release {
        Release {
            name: name.to_string(),
            baseline: baseline.map(str::to_string),
            features: vec![],
        }
    }

    fn project(root: &Path, releases: Vec<Release>) -> Project {
        Project {
            root: root.to_path_buf(),
            config: ProjectConfig {
                databases: vec!["app".to_string(), "audit".to_string()],
                releases: "releases.json".to_string(),
                features: "features/*.json".to_string(),
                tasks: None,
                default_release: releases.last().map(|r| r.name.clone()).unwrap_or_default(),
            },
            user: UserConfig::default(),
            releases,
            features: Map::new(),
            tasks: Map::new(),
        }
    }

    fn touch_backup(root: &Path, name: &str) {
        let dir = root.join("backups");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(name), b"bak").unwrap();
    }

    #[test]
    fn test_index_scan_named_groups() {
        let temp = TempDir::new().unwrap();
        touch_backup(temp.path(), "r1-dev-app.bak");
        touch_backup(temp.path(), "r1-dev-audit.bak");
        touch_backup(temp.path(), "r1-prod-app.bak");
        touch_backup(temp.path(), "unrelated.txt");

        let pattern = Regex::new(&UserConfig::default().backup_pattern).unwrap();
        let index = BackupIndex::scan(&temp.path().join("backups"), &pattern).unwrap();

        let envs = index.environments("r1");
        assert_eq!(envs.len(), 2);
        assert_eq!(envs[0].0.as_deref(), Some("dev"));
        assert_eq!(envs[0].1.len(), 2);
        assert_eq!(envs[1].0.as_deref(), Some("prod"));
    }

    #[test]
    fn test_pattern_without_required_groups_rejected() {
        let temp = TempDir::new().unwrap();
        let pattern = Regex::new(r"^(?P<release>.+)\.bak$").unwrap();
        assert!(matches!(
            BackupIndex::scan(temp.path(), &pattern),
            Err(Error::ConfigParse { .. })
        ));
    }

    #[test]
    fn test_plan_uses_active_release_backups_directly() {
        let temp = TempDir::new().unwrap();
        touch_backup(temp.path(), "r2-dev-app.bak");
        touch_backup(temp.path(), "r2-dev-audit.bak");

        let project = project(temp.path(), vec![release("r1", None), release("r2", Some("r1"))]);
        let plan = PlanBuilder::new(&project, "dev").build("r2").unwrap();

        assert!(plan.releases.is_empty());
        assert_eq!(plan.databases.len(), 2);
        assert_eq!(plan.databases[0].0, "app");
        assert_eq!(plan.databases[1].0, "audit");
    }

    #[test]
    fn test_plan_walks_to_baseline_and_stacks_releases() {
        let temp = TempDir::new().unwrap();
        touch_backup(temp.path(), "r0-dev-app.bak");
        touch_backup(temp.path(), "r0-dev-audit.bak");

        let project = project(
            temp.path(),
            vec![
                release("r0", None),
                release("r1", Some("r0")),
                release("r2", Some("r1")),
            ],
        );
        let plan = PlanBuilder::new(&project, "dev").build("r2").unwrap();

        let names: Vec<_> = plan.releases.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["r1", "r2"]);
    }

    #[test]
    fn test_incomplete_set_keeps_walking() {
        let temp = TempDir::new().unwrap();
        // r1 has only one of two databases; r0 has both
        touch_backup(temp.path(), "r1-dev-app.bak");
        touch_backup(temp.path(), "r0-dev-app.bak");
        touch_backup(temp.path(), "r0-dev-audit.bak");

        let project = project(
            temp.path(),
            vec![release("r0", None), release("r1", Some("r0"))],
        );
        let plan = PlanBuilder::new(&project, "dev").build("r1").unwrap();

        let names: Vec<_> = plan.releases.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["r1"]);
        assert!(plan.databases[0].1.ends_with("r0-dev-app.bak"));
    }

    #[test]
    fn test_preferred_environment_wins_over_discovery_order() {
        let temp = TempDir::new().unwrap();
        // "dev" sorts before "qa", but the user asked for qa
        touch_backup(temp.path(), "r1-dev-app.bak");
        touch_backup(temp.path(), "r1-dev-audit.bak");
        touch_backup(temp.path(), "r1-qa-app.bak");
        touch_backup(temp.path(), "r1-qa-audit.bak");

        let project = project(temp.path(), vec![release("r1", None)]);
        let plan = PlanBuilder::new(&project, "qa").build("r1").unwrap();
        assert!(plan.databases[0].1.ends_with("r1-qa-app.bak"));
    }

    #[test]
    fn test_falls_back_to_other_environment_when_preferred_incomplete() {
        let temp = TempDir::new().unwrap();
        touch_backup(temp.path(), "r1-qa-app.bak");
        // qa lacks audit; dev is complete
        touch_backup(temp.path(), "r1-dev-app.bak");
        touch_backup(temp.path(), "r1-dev-audit.bak");

        let project = project(temp.path(), vec![release("r1", None)]);
        let plan = PlanBuilder::new(&project, "qa").build("r1").unwrap();
        assert!(plan.databases[0].1.ends_with("r1-dev-app.bak"));
    }

    #[test]
    fn test_env_agnostic_backups_accepted() {
        let temp = TempDir::new().unwrap();
        // no env segment at all
        touch_backup(temp.path(), "r1-app.bak");
        touch_backup(temp.path(), "r1-audit.bak");

        let project = project(temp.path(), vec![release("r1", None)]);
        let plan = PlanBuilder::new(&project, "dev").build("r1").unwrap();
        assert_eq!(plan.databases.len(), 2);
    }

    #[test]
    fn test_no_baseline_error() {
        let temp = TempDir::new().unwrap();
        let project = project(temp.path(), vec![release("r0", None), release("r1", Some("r0"))]);

        assert!(matches!(
            PlanBuilder::new(&project, "dev").build("r1"),
            Err(Error::NoBaseline(name)) if name == "r0"
        ));
    }

    #[test]
    fn test_unknown_release_errors() {
        let temp = TempDir::new().unwrap();
        let project = project(temp.path(), vec![release("r1", Some("ghost"))]);

        assert!(matches!(
            PlanBuilder::new(&project, "dev").build("missing"),
            Err(Error::UnknownRelease(name)) if name == "missing"
        ));
        assert!(matches!(
            PlanBuilder::new(&project, "dev").build("r1"),
            Err(Error::UnknownRelease(name)) if name == "ghost"
        ));
    }
}
