//! The Snapshot Worker (C5): policy assignment, inventory freshness,
//! snapshot creation, and retention pruning, driven by [`worker::SnapshotWorker`]
//! on the schedule described in §4.5.

pub mod stages;
pub mod worker;

pub use worker::SnapshotWorker;
