// src/lib.rs

//! dbbm — database branch deployment engine
//!
//! Drives a declarative, staged deployment of a set of SQL databases:
//! restore a baseline backup set, then apply ordered releases of
//! features, each an ordered recipe of tasks (file copies, SQL script
//! generation and execution).
//!
//! # Architecture
//!
//! - State fingerprints: every input a task consumes folds into a
//!   SHA-256 [`StateHash`]; equal fingerprint means equal database state
//! - Execution tree: groups sequence and frame, transforms do the work;
//!   a Calculate pass fingerprints and rewrites, a Run pass executes
//! - Content-addressed cache: database backups keyed by fingerprint,
//!   with hit tracking and size-bounded garbage collection
//! - Resumable: the last successful leaf's hash persists after every
//!   step; `--resume` skips straight past it

pub mod beep;
pub mod cache;
pub mod config;
pub mod deploy;
mod error;
pub mod hash;
pub mod logger;
pub mod plan;
pub mod resume;
pub mod sqlrunner;
pub mod task;
pub mod transform;
pub mod tree;
pub mod vars;

pub use deploy::{DeployOptions, Deployer};
pub use error::{Error, Result};
pub use hash::{HashTransformer, StateHash};
