//! Domain layer: ports (trait abstractions for every external dependency)
//! and events (an audit-oriented record of what the core does).
//!
//! ```ignore
//! use snapstor_core::domain::ports::{JobStoreApi, CloudApi};
//! use snapstor_core::domain::events::DomainEvent;
//! ```

pub mod events;
pub mod ports;
pub mod publisher;

pub use events::DomainEvent;
pub use ports::{CloudApi, EventPublisher, JobStoreApi, SessionProviderApi};
