//! The Job Store (C3): durable state for snapshot runs, snapshot records,
//! restore jobs/steps, and on-demand triggers. All cross-process signaling
//! in the core passes through here — there is no message broker.

pub mod memory;
pub mod models;
pub mod postgres;
pub mod traits;

pub use memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use traits::JobStoreApi;
