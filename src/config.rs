// src/config.rs

//! Project and user configuration
//!
//! A deployment project is a directory tree anchored by `dbbm.json`. The
//! project file declares the databases, the releases file, and the glob
//! patterns for feature and task definition files. A `dbbm.user.json`
//! next to it carries machine-local settings: backup location and naming
//! pattern, connection string, cache limits, beeps.
//!
//! All files are JSON; parse failures surface as `ConfigParse` with the
//! offending path.

use crate::error::{Error, Result};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Project file name, searched for walking upward from the working directory
pub const PROJECT_FILE: &str = "dbbm.json";

/// Machine-local user configuration, next to the project file
pub const USER_FILE: &str = "dbbm.user.json";

/// Command list a task definition must provide to be deployable
pub const DEPLOY_COMMAND: &str = "deploy";

// =============================================================================
// Project configuration
// =============================================================================

/// Contents of `dbbm.json`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    /// Deployed databases, in deployment order
    pub databases: Vec<String>,
    /// Releases file, relative to the project root
    pub releases: String,
    /// Feature file glob, relative to the project root
    pub features: String,
    /// Task definition file glob, relative to the project root
    #[serde(default)]
    pub tasks: Option<String>,
    /// Release deployed when `--release` is not given
    pub default_release: String,
}

/// Contents of `dbbm.user.json`; every field has a default
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfig {
    /// Directory holding baseline backup files
    #[serde(default = "default_backup_path")]
    pub backup_path: String,
    /// Backup filename pattern with named groups `release`, `dbName` and
    /// optionally `env`
    #[serde(default = "default_backup_pattern")]
    pub backup_pattern: String,
    /// Preferred environment for baseline resolution and script filtering
    #[serde(default = "default_environment")]
    pub environment: String,
    /// SQL Server connection target
    #[serde(default)]
    pub connection: String,
    /// Minimum leaf duration (seconds) before its output state is worth caching
    #[serde(default = "default_min_deploy_time")]
    pub min_deploy_time: f64,
    /// Buzzer patterns by event name (`start`, `success`, `error`)
    #[serde(default)]
    pub beeps: HashMap<String, String>,
    #[serde(default)]
    pub cache: CacheSettings,
}

/// Backup cache limits
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSettings {
    /// Cache root, relative to the project root unless absolute
    #[serde(default = "default_cache_root")]
    pub root_path: String,
    /// Live-size bound in bytes; negative means unbounded
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: i64,
    /// Run a silent garbage collection before each cache add
    #[serde(default = "default_true", rename = "autoGC")]
    pub auto_gc: bool,
}

fn default_backup_path() -> String {
    "backups".to_string()
}

fn default_backup_pattern() -> String {
    r"^(?P<release>[^-]+)-(?:(?P<env>[^-]+)-)?(?P<dbName>[^.]+)\.bak$".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_min_deploy_time() -> f64 {
    10.0
}

fn default_cache_root() -> String {
    ".dbbm/cache".to_string()
}

fn default_max_cache_size() -> i64 {
    -1
}

fn default_true() -> bool {
    true
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            backup_path: default_backup_path(),
            backup_pattern: default_backup_pattern(),
            environment: default_environment(),
            connection: String::new(),
            min_deploy_time: default_min_deploy_time(),
            beeps: HashMap::new(),
            cache: CacheSettings::default(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            root_path: default_cache_root(),
            max_cache_size: default_max_cache_size(),
            auto_gc: default_true(),
        }
    }
}

// =============================================================================
// Releases, features, tasks
// =============================================================================

/// One release in the releases file
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub name: String,
    /// Release whose end state this release builds on; `None` only for roots
    #[serde(default)]
    pub baseline: Option<String>,
    /// Feature names applied by this release, in order
    #[serde(default)]
    pub features: Vec<String>,
}

/// A parameter value in a recipe entry
///
/// Strings stay strings; lists of strings join with newlines; nested
/// tables carry structured parameters such as `templates`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Flag(bool),
    Text(String),
    List(Vec<String>),
    Table(HashMap<String, ParamValue>),
}

impl ParamValue {
    /// Flatten to text: lists join with `\n`, flags print as `true`/`false`
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s.clone()),
            Self::List(items) => Some(items.join("\n")),
            Self::Flag(b) => Some(b.to_string()),
            Self::Table(_) => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&HashMap<String, ParamValue>> {
        match self {
            Self::Table(t) => Some(t),
            _ => None,
        }
    }
}

/// Parameters of one recipe entry
pub type TaskParams = HashMap<String, ParamValue>;

/// One entry of a feature recipe: a task kind plus its parameters
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub kind: String,
    pub params: TaskParams,
}

/// A feature: named, anchored at its file's directory, with an ordered recipe
#[derive(Debug, Clone)]
pub struct Feature {
    pub name: String,
    /// Directory containing the feature file; relative task paths resolve here
    pub base_dir: PathBuf,
    pub recipe: Vec<TaskConfig>,
}

/// A composite task definition from a task file
#[derive(Debug, Clone)]
pub struct TaskDef {
    pub name: String,
    /// Extra context variables bound while expanding the command list
    pub define: HashMap<String, String>,
    /// Paths that must exist before this task can run
    pub requires: Vec<String>,
    /// Recipe entries per command; only `deploy` is executed
    pub commands: HashMap<String, Vec<TaskConfig>>,
}

#[derive(Deserialize)]
struct FeatureFile {
    name: String,
    #[serde(default)]
    recipe: Vec<HashMap<String, TaskParams>>,
}

#[derive(Deserialize)]
struct TaskFile {
    name: String,
    #[serde(default)]
    define: HashMap<String, String>,
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    commands: HashMap<String, Vec<HashMap<String, TaskParams>>>,
}

fn into_task_configs(
    path: &Path,
    entries: Vec<HashMap<String, TaskParams>>,
) -> Result<Vec<TaskConfig>> {
    let mut recipe = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.len() != 1 {
            return Err(Error::config_parse(
                path,
                "each recipe entry must contain exactly one task kind",
            ));
        }
        let (kind, params) = entry.into_iter().next().unwrap();
        recipe.push(TaskConfig { kind, params });
    }
    Ok(recipe)
}

// =============================================================================
// Project loading
// =============================================================================

/// A fully loaded project: configuration plus releases, features and tasks
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub config: ProjectConfig,
    pub user: UserConfig,
    pub releases: Vec<Release>,
    pub features: HashMap<String, Feature>,
    pub tasks: HashMap<String, TaskDef>,
}

impl Project {
    /// Find the project root by walking upward from `start`
    pub fn discover(start: &Path) -> Result<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            if dir.join(PROJECT_FILE).is_file() {
                return Ok(dir);
            }
            if !dir.pop() {
                return Err(Error::NoProject {
                    start: start.to_path_buf(),
                });
            }
        }
    }

    /// Load a project rooted at `root`
    pub fn load(root: &Path) -> Result<Self> {
        let config: ProjectConfig = load_json(&root.join(PROJECT_FILE))?;

        let user_path = root.join(USER_FILE);
        let user: UserConfig = if user_path.is_file() {
            load_json(&user_path)?
        } else {
            UserConfig::default()
        };

        let releases: Vec<Release> = load_json(&root.join(&config.releases))?;

        let mut features = HashMap::new();
        for path in glob_files(root, &config.features)? {
            let raw: FeatureFile = load_json(&path)?;
            let base_dir = path.parent().unwrap_or(root).to_path_buf();
            let recipe = into_task_configs(&path, raw.recipe)?;
            let feature = Feature {
                name: raw.name.clone(),
                base_dir,
                recipe,
            };
            if features.insert(raw.name.clone(), feature).is_some() {
                return Err(Error::config_parse(
                    &path,
                    format!("duplicate feature name '{}'", raw.name),
                ));
            }
        }

        let mut tasks = HashMap::new();
        if let Some(pattern) = &config.tasks {
            for path in glob_files(root, pattern)? {
                let raw: TaskFile = load_json(&path)?;
                let mut commands = HashMap::new();
                for (command, entries) in raw.commands {
                    commands.insert(command, into_task_configs(&path, entries)?);
                }
                let def = TaskDef {
                    name: raw.name.clone(),
                    define: raw.define,
                    requires: raw.requires,
                    commands,
                };
                if tasks.insert(raw.name.clone(), def).is_some() {
                    return Err(Error::config_parse(
                        &path,
                        format!("duplicate task name '{}'", raw.name),
                    ));
                }
            }
        }

        debug!(
            "loaded project at {:?}: {} releases, {} features, {} tasks",
            root,
            releases.len(),
            features.len(),
            tasks.len()
        );

        Ok(Self {
            root: root.to_path_buf(),
            config,
            user,
            releases,
            features,
            tasks,
        })
    }

    /// Look up a release by name
    pub fn release(&self, name: &str) -> Option<&Release> {
        self.releases.iter().find(|r| r.name == name)
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::config_parse(path, format!("cannot read: {}", e)))?;
    serde_json::from_str(&text).map_err(|e| Error::config_parse(path, e))
}

// =============================================================================
// Glob matching
// =============================================================================

/// Expand a `dir/*.json`-style pattern under `root`, sorted by path
///
/// `**/` in the directory part recurses; the file part supports `*` and
/// `?` only. This deliberately covers just the shapes project files use.
pub fn glob_files(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let (dir_part, file_part) = match pattern.rfind('/') {
        Some(idx) => (&pattern[..idx], &pattern[idx + 1..]),
        None => ("", pattern),
    };

    let recursive = dir_part.ends_with("**");
    let dir_part = dir_part.trim_end_matches("**").trim_end_matches('/');
    let dir = if dir_part.is_empty() {
        root.to_path_buf()
    } else {
        root.join(dir_part)
    };

    if !dir.is_dir() {
        return Err(Error::config_parse(
            &dir,
            format!("directory for pattern '{}' does not exist", pattern),
        ));
    }

    let file_re = file_pattern_regex(file_part)?;
    let max_depth = if recursive { usize::MAX } else { 1 };

    let mut out = Vec::new();
    for entry in WalkDir::new(&dir).max_depth(max_depth).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::config_parse(&dir, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if file_re.is_match(&name) {
            out.push(entry.path().to_path_buf());
        }
    }
    out.sort();
    Ok(out)
}

fn file_pattern_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| Error::config_parse(pattern, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn scaffold(root: &Path) {
        write(
            root,
            PROJECT_FILE,
            r#"{
                "databases": ["app", "audit"],
                "releases": "releases.json",
                "features": "features/*.json",
                "tasks": "tasks/*.json",
                "defaultRelease": "r2"
            }"#,
        );
        write(
            root,
            "releases.json",
            r#"[
                {"name": "r1", "features": ["core"]},
                {"name": "r2", "baseline": "r1", "features": ["billing"]}
            ]"#,
        );
        write(
            root,
            "features/core.json",
            r#"{"name": "core", "recipe": [{"sql": {"path": "scripts", "regex": ".*\\.sql"}}]}"#,
        );
        write(
            root,
            "features/billing.json",
            r#"{"name": "billing", "recipe": [{"copy": {"from": "files", "to": "out", "regex": ".*"}}]}"#,
        );
        write(
            root,
            "tasks/reindex.json",
            r#"{"name": "reindex", "define": {"mode": "full"}, "commands": {"deploy": []}}"#,
        );
    }

    #[test]
    fn test_discover_walks_upward() {
        let temp = TempDir::new().unwrap();
        scaffold(temp.path());
        let nested = temp.path().join("features");

        let root = Project::discover(&nested).unwrap();
        assert_eq!(root, temp.path());
    }

    #[test]
    fn test_discover_fails_without_project() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            Project::discover(temp.path()),
            Err(Error::NoProject { .. })
        ));
    }

    #[test]
    fn test_load_project() {
        let temp = TempDir::new().unwrap();
        scaffold(temp.path());

        let project = Project::load(temp.path()).unwrap();
        assert_eq!(project.config.databases, vec!["app", "audit"]);
        assert_eq!(project.config.default_release, "r2");
        assert_eq!(project.releases.len(), 2);
        assert_eq!(project.release("r2").unwrap().baseline.as_deref(), Some("r1"));
        assert!(project.release("r9").is_none());

        let core = &project.features["core"];
        assert_eq!(core.recipe.len(), 1);
        assert_eq!(core.recipe[0].kind, "sql");
        assert_eq!(core.base_dir, temp.path().join("features"));

        assert_eq!(project.tasks["reindex"].define["mode"], "full");
    }

    #[test]
    fn test_user_config_defaults_when_absent() {
        let temp = TempDir::new().unwrap();
        scaffold(temp.path());

        let project = Project::load(temp.path()).unwrap();
        assert_eq!(project.user.environment, "dev");
        assert_eq!(project.user.cache.max_cache_size, -1);
        assert!(project.user.cache.auto_gc);
    }

    #[test]
    fn test_user_config_overrides() {
        let temp = TempDir::new().unwrap();
        scaffold(temp.path());
        write(
            temp.path(),
            USER_FILE,
            r#"{
                "environment": "prod",
                "connection": "db-host",
                "minDeployTime": 2.5,
                "cache": {"rootPath": "cachedir", "maxCacheSize": 1024, "autoGC": false}
            }"#,
        );

        let project = Project::load(temp.path()).unwrap();
        assert_eq!(project.user.environment, "prod");
        assert_eq!(project.user.connection, "db-host");
        assert_eq!(project.user.min_deploy_time, 2.5);
        assert_eq!(project.user.cache.max_cache_size, 1024);
        assert!(!project.user.cache.auto_gc);
        // untouched fields keep their defaults
        assert_eq!(project.user.backup_path, "backups");
    }

    #[test]
    fn test_recipe_entry_must_be_single_kind() {
        let temp = TempDir::new().unwrap();
        scaffold(temp.path());
        write(
            temp.path(),
            "features/broken.json",
            r#"{"name": "broken", "recipe": [{"sql": {}, "copy": {}}]}"#,
        );

        assert!(matches!(
            Project::load(temp.path()),
            Err(Error::ConfigParse { .. })
        ));
    }

    #[test]
    fn test_duplicate_feature_name_rejected() {
        let temp = TempDir::new().unwrap();
        scaffold(temp.path());
        write(
            temp.path(),
            "features/core2.json",
            r#"{"name": "core", "recipe": []}"#,
        );

        assert!(matches!(
            Project::load(temp.path()),
            Err(Error::ConfigParse { .. })
        ));
    }

    #[test]
    fn test_glob_files_sorted_non_recursive() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "d/b.json", "{}");
        write(temp.path(), "d/a.json", "{}");
        write(temp.path(), "d/skip.txt", "");
        write(temp.path(), "d/sub/c.json", "{}");

        let found = glob_files(temp.path(), "d/*.json").unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.json", "b.json"]);
    }

    #[test]
    fn test_glob_files_recursive() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "d/a.json", "{}");
        write(temp.path(), "d/sub/c.json", "{}");

        let found = glob_files(temp.path(), "d/**/*.json").unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_param_value_text_forms() {
        let v: ParamValue = serde_json::from_str(r#"["a", "b"]"#).unwrap();
        assert_eq!(v.as_text().unwrap(), "a\nb");

        let v: ParamValue = serde_json::from_str("true").unwrap();
        assert_eq!(v.as_flag(), Some(true));

        let v: ParamValue = serde_json::from_str(r#"{"pre": "x"}"#).unwrap();
        assert!(v.as_table().is_some());
        assert!(v.as_text().is_none());
    }
}
