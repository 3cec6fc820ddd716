//! The Restore Engine (C6): builds and executes VM restore-from-snapshot
//! plans in either `NEW` or `REPLACE` mode, covering rollback, retry-from-
//! failed-step, and manual cleanup (§4.6).

pub mod executor;
pub mod planner;
pub mod steps;
pub mod types;

pub use executor::RestoreEngine;
pub use types::{PlanDocument, PlanPort, PlanRequest, QuotaWarning};
