//! Session and server registry.
//!
//! Sessions live until they expire (checked lazily on validation and by the
//! sweep task) or are revoked. Registered servers live until unregistered or
//! swept for missing heartbeats.

mod error;
mod memory;
mod models;
mod repository;
mod service;
mod store;

pub use error::RegistryError;
pub use memory::MemoryRegistryStore;
pub use models::{
    CompositeKey, EphemeralSession, MAX_TTL_MINUTES, NewSession, RegisteredServer, expiry_after,
};
pub use repository::SqliteRegistryStore;
pub use service::{RegistrySettings, SweepReport, TokenRegistry};
pub use store::RegistryStore;
