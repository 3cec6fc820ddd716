//! Snapshot & Restore Orchestration Core
//!
//! Drives two long-running workflows against a remote OpenStack-like cloud
//! control plane on behalf of a multi-tenant management platform:
//!
//! - policy-driven snapshot orchestration (assignment, creation, retention)
//! - restore plan/execute orchestration (validated multi-step VM rebuild)
//!
//! # Modules
//!
//! - [`cloud`] - typed façade over identity, compute, block storage, network
//! - [`session`] - cross-tenant service-user session provider
//! - [`store`] - durable job store (runs, records, restore jobs/steps, triggers)
//! - [`policy`] - declarative rule evaluation for snapshot assignment
//! - [`snapshot`] - the scheduler loop and per-volume snapshot lifecycle
//! - [`restore`] - the planner and the asynchronous step-machine executor
//! - [`domain`] - ports and events shared across the above
//! - [`http`] - the minimal request/response surface the core exposes
//! - [`error`] - the closed error taxonomy
//! - [`config`] - process configuration

pub mod cloud;
pub mod config;
pub mod domain;
pub mod error;
pub mod http;
pub mod policy;
pub mod restore;
pub mod session;
pub mod snapshot;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
