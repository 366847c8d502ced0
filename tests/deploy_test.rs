// tests/deploy_test.rs

//! End-to-end deployment scenarios against the recording fake runner

mod common;

use common::{setup_project, FakeSqlRunner};
use dbbm::{DeployOptions, Error};
use std::collections::BTreeMap;
use std::fs;

fn no_cache_opts() -> DeployOptions {
    DeployOptions {
        no_cache: true,
        ..Default::default()
    }
}

#[test]
fn test_fresh_deploy_restores_baseline_then_applies_features() {
    let project = setup_project();
    let runner = FakeSqlRunner::new();
    let deployer = project.deployer(runner.clone());

    deployer.deploy(&no_cache_opts()).unwrap();

    let calls = runner.take_calls();
    assert_eq!(calls.len(), 4);
    assert!(calls[0].starts_with("restore app <- "));
    assert!(calls[0].ends_with("r0-dev-app.bak"));
    assert!(calls[1].starts_with("restore audit <- "));
    assert_eq!(calls[2], "exec -- f1\n:r 001.init.sql");
    assert_eq!(calls[3], "exec -- f2\n:r 001.more.sql");

    // resume record is deleted after a full success
    assert!(!project.resume_path().exists());
}

#[test]
fn test_deploy_is_deterministic() {
    let project = setup_project();
    let runner = FakeSqlRunner::new();
    let deployer = project.deployer(runner.clone());

    let first = deployer.deploy(&no_cache_opts()).unwrap();
    let second = deployer.deploy(&no_cache_opts()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_interrupted_deploy_resumes_where_it_stopped() {
    let project = setup_project();
    let runner = FakeSqlRunner::new();
    let deployer = project.deployer(runner.clone());

    // First run dies executing f2
    runner.set_fail_marker(Some("-- f2"));
    let err = deployer.deploy(&no_cache_opts()).unwrap_err();
    assert!(matches!(err, Error::Blocking(inner)
        if matches!(*inner, Error::SqlFailure { .. })));

    // The resume record survives the failure and f1 already ran
    assert!(project.resume_path().exists());
    let first_calls = runner.take_calls();
    assert_eq!(first_calls.len(), 3);
    assert_eq!(first_calls[2], "exec -- f1\n:r 001.init.sql");

    // Resumed run executes only what remains
    runner.set_fail_marker(None);
    let opts = DeployOptions {
        resume: true,
        ..no_cache_opts()
    };
    let resumed_hash = deployer.deploy(&opts).unwrap();

    let resumed_calls = runner.take_calls();
    assert_eq!(resumed_calls, vec!["exec -- f2\n:r 001.more.sql"]);
    assert!(!project.resume_path().exists());

    // Same final state as an uninterrupted run
    let full_hash = deployer.deploy(&no_cache_opts()).unwrap();
    assert_eq!(resumed_hash, full_hash);
}

#[test]
fn test_resume_flag_without_record_fails() {
    let project = setup_project();
    let runner = FakeSqlRunner::new();
    let deployer = project.deployer(runner.clone());

    let opts = DeployOptions {
        resume: true,
        ..no_cache_opts()
    };
    let err = deployer.deploy(&opts).unwrap_err();
    assert!(matches!(err, Error::Blocking(inner)
        if matches!(*inner, Error::ResumeMissing(_))));
}

#[test]
fn test_stale_resume_point_is_rejected() {
    let project = setup_project();
    let runner = FakeSqlRunner::new();
    let deployer = project.deployer(runner.clone());

    // A syntactically valid hash no leaf will ever produce
    fs::write(project.resume_path(), format!("{}\n", "ab".repeat(32))).unwrap();

    let opts = DeployOptions {
        resume: true,
        ..no_cache_opts()
    };
    let err = deployer.deploy(&opts).unwrap_err();
    assert!(matches!(err, Error::Blocking(inner)
        if matches!(*inner, Error::ResumeInvalid(_))));
}

#[test]
fn test_cache_short_circuits_second_deploy() {
    let project = setup_project();
    let runner = FakeSqlRunner::new();
    let deployer = project.deployer(runner.clone());

    // Full run; the interior leaf (f1) caches its output state for
    // every database
    let first_hash = deployer.deploy(&DeployOptions::default()).unwrap();

    let first_calls = runner.take_calls();
    assert!(first_calls.iter().any(|c| c.starts_with("backup app -> ")));
    assert!(first_calls.iter().any(|c| c.starts_with("backup audit -> ")));
    // neither the baseline restore nor the terminal leaf is cached
    let backups: Vec<_> = first_calls
        .iter()
        .filter(|c| c.starts_with("backup "))
        .collect();
    assert_eq!(backups.len(), 2);

    let hits: BTreeMap<String, BTreeMap<String, i64>> =
        serde_json::from_str(&fs::read_to_string(project.hit_table_path()).unwrap()).unwrap();
    let cached_hex = hits["app"].keys().next().unwrap().clone();
    let ticks_before = hits["app"][&cached_hex];

    // Second run restores the cached state instead of re-running f1
    let second_hash = deployer.deploy(&DeployOptions::default()).unwrap();
    assert_eq!(first_hash, second_hash);

    let second_calls = runner.take_calls();
    assert_eq!(second_calls.len(), 3);
    assert!(second_calls[0].contains("restore app <- "));
    assert!(second_calls[0].ends_with(&format!("caches/app/{}", cached_hex)));
    assert!(second_calls[1].ends_with(&format!("caches/audit/{}", cached_hex)));
    assert_eq!(second_calls[2], "exec -- f2\n:r 001.more.sql");

    // the rewrite touched the hit entries it restored from
    let hits: BTreeMap<String, BTreeMap<String, i64>> =
        serde_json::from_str(&fs::read_to_string(project.hit_table_path()).unwrap()).unwrap();
    assert!(hits["app"][&cached_hex] > ticks_before);
}

#[test]
fn test_no_cache_flag_disables_the_store() {
    let project = setup_project();
    let runner = FakeSqlRunner::new();
    let deployer = project.deployer(runner.clone());

    deployer.deploy(&no_cache_opts()).unwrap();

    assert!(!project.hit_table_path().exists());
    assert!(!runner
        .take_calls()
        .iter()
        .any(|c| c.starts_with("backup ")));
}

#[test]
fn test_dry_run_is_side_effect_free() {
    let project = setup_project();
    let runner = FakeSqlRunner::new();
    let deployer = project.deployer(runner.clone());

    let opts = DeployOptions {
        dry_run: true,
        ..no_cache_opts()
    };
    let dry_hash = deployer.deploy(&opts).unwrap();

    assert!(runner.take_calls().is_empty());
    assert!(!project.resume_path().exists());

    // the dry-run fingerprint matches the real one
    let real_hash = deployer.deploy(&no_cache_opts()).unwrap();
    assert_eq!(dry_hash, real_hash);
}

#[test]
fn test_environment_filter_selects_scripts() {
    let project = setup_project();
    project.write("features/f2/scripts/002-dev.bar.sql", "create table bar;");
    project.write("features/f2/scripts/003-prod.baz.sql", "create table baz;");

    let runner = FakeSqlRunner::new();
    let deployer = project.deployer(runner.clone());
    deployer.deploy(&no_cache_opts()).unwrap();

    let calls = runner.take_calls();
    let f2_exec = calls.last().unwrap();
    assert_eq!(
        f2_exec,
        "exec -- f2\n:r 001.more.sql\n:r 002-dev.bar.sql"
    );
}

#[test]
fn test_environment_override_changes_selection() {
    let project = setup_project();
    project.write("features/f2/scripts/003-prod.baz.sql", "create table baz;");
    // prod needs its own baseline set
    project.write("backups/r0-prod-app.bak", "baseline app prod");
    project.write("backups/r0-prod-audit.bak", "baseline audit prod");

    let runner = FakeSqlRunner::new();
    let deployer = project.deployer(runner.clone());

    let opts = DeployOptions {
        environment: Some("prod".to_string()),
        ..no_cache_opts()
    };
    deployer.deploy(&opts).unwrap();

    let calls = runner.take_calls();
    assert!(calls[0].ends_with("r0-prod-app.bak"));
    assert_eq!(
        calls.last().unwrap(),
        "exec -- f2\n:r 001.more.sql\n:r 003-prod.baz.sql"
    );
}

#[test]
fn test_release_override_deploys_prefix_of_the_chain() {
    let project = setup_project();
    let runner = FakeSqlRunner::new();
    let deployer = project.deployer(runner.clone());

    let opts = DeployOptions {
        release: Some("r1".to_string()),
        ..no_cache_opts()
    };
    deployer.deploy(&opts).unwrap();

    let calls = runner.take_calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2], "exec -- f1\n:r 001.init.sql");
}

#[test]
fn test_unmet_requirements_abort_before_any_side_effect() {
    let project = setup_project();
    fs::remove_dir_all(project.root().join("features/f2/scripts")).unwrap();

    let runner = FakeSqlRunner::new();
    let deployer = project.deployer(runner.clone());

    let err = deployer.deploy(&no_cache_opts()).unwrap_err();
    assert!(matches!(err, Error::Blocking(inner)
        if matches!(*inner, Error::UnmetRequirements)));

    // nothing ran, nothing was recorded
    assert!(runner.take_calls().is_empty());
    assert!(!project.resume_path().exists());
}
