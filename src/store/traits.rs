//! Re-exports the job store port so callers can `use crate::store::traits::JobStoreApi`
//! without reaching into `domain` — the trait is defined there because
//! [`crate::domain::events`] needs to reference the same row types it does.

pub use crate::domain::ports::JobStoreApi;
