// src/commands.rs
//! Command handlers for the dbbm CLI

use anyhow::Result;
use dbbm::beep::{Beeper, ConsoleBeeper, SilentBeeper};
use dbbm::cache::{BackupCache, StateCache};
use dbbm::config::Project;
use dbbm::sqlrunner::{SqlCmdRunner, SqlRunner};
use dbbm::{DeployOptions, Deployer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Locate and load the project enclosing the working directory
fn load_project() -> Result<Project> {
    let cwd = std::env::current_dir()?;
    let root = Project::discover(&cwd)?;
    Ok(Project::load(&root)?)
}

fn open_cache(project: &Project, runner: Arc<dyn SqlRunner>) -> BackupCache {
    let settings = &project.user.cache;
    let root = PathBuf::from(&settings.root_path);
    let root = if root.is_absolute() {
        root
    } else {
        project.root.join(root)
    };
    BackupCache::new(
        root,
        settings.max_cache_size,
        settings.auto_gc,
        project.user.connection.clone(),
        true,
        runner,
    )
}

/// Run a deployment
pub fn cmd_deploy(
    release: Option<String>,
    environment: Option<String>,
    dry_run: bool,
    resume: bool,
    no_cache: bool,
    no_beeps: bool,
) -> Result<()> {
    let project = load_project()?;

    let runner: Arc<dyn SqlRunner> = Arc::new(SqlCmdRunner::new());
    let beeper: Box<dyn Beeper> = if no_beeps {
        Box::new(SilentBeeper)
    } else {
        Box::new(ConsoleBeeper::new(project.user.beeps.clone()))
    };

    let deployer = Deployer::new(project, runner, beeper);
    let opts = DeployOptions {
        release,
        environment,
        dry_run,
        resume,
        no_cache,
    };

    let hash = deployer.deploy(&opts)?;
    info!("final state: {}", hash);
    Ok(())
}

/// Collect garbage in the backup cache
pub fn cmd_cache_gc() -> Result<()> {
    let project = load_project()?;
    let runner: Arc<dyn SqlRunner> = Arc::new(SqlCmdRunner::new());
    let cache = open_cache(&project, runner);

    let stats = cache.garbage_collect(false)?;
    println!(
        "removed {} orphan(s), {} forgotten entr(ies), evicted {}; {} live bytes remain",
        stats.orphans_deleted, stats.forgotten_removed, stats.evicted, stats.live_size
    );
    Ok(())
}

/// Report cache usage
pub fn cmd_cache_stats() -> Result<()> {
    let project = load_project()?;
    let runner: Arc<dyn SqlRunner> = Arc::new(SqlCmdRunner::new());
    let cache = open_cache(&project, runner);

    let stats = cache.stats()?;
    println!("entries:   {}", stats.entries);
    println!("live size: {} bytes", stats.live_size);
    if stats.max_size >= 0 {
        println!("capacity:  {} bytes", stats.max_size);
    } else {
        println!("capacity:  unbounded");
    }
    Ok(())
}
