//! Data marketplace state and policy consistency engine
//!
//! Users, data products, purchase agreements, per-owner inventories and
//! revoked certificates are created, validated and mutated against a
//! versioned key-value state store. Every mutation is gated by
//! caller-identity checks and domain policy rules; the store, transaction
//! metadata and caller identity come from an injected [`host::Host`].

pub mod agreements;
pub mod catalog;
pub mod codec;
pub mod engine;
pub mod error;
pub mod host;
pub mod identity;
pub mod keys;
pub mod model;
pub mod revocation;
pub mod sled_host;
pub mod users;
pub mod utils;

pub use engine::{
    AnyTransition, Engine, EngineConfig, HistoryRecord, OrderedTransitions, TransitionPolicy,
};
pub use error::{Error, ErrorKind, ValidationError};
pub use host::{CallerCertificate, HistoryEntry, Host, HostError, Role, TxTimestamp};
pub use sled_host::{CallerIdentity, Event, SledHost};
