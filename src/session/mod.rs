//! The Service-User Session Provider (C2): mints per-project sessions from
//! a single shared service account, granting the admin role on first use
//! and caching both the grant and the resulting session.

pub mod credentials;
pub mod provider;

pub use provider::SessionProvider;
