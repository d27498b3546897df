//! Capability interface the engine consumes from its execution host
//!
//! The engine never talks to a storage backend or an identity provider
//! directly. State access, history, transaction metadata, events and the
//! caller's identity all come through [`Host`], so the engine stays
//! testable without a live ledger.
//!
//! Host failures are opaque to the engine and fatal to the current
//! operation; there is no retry inside an operation.

use chrono::Utc;

use crate::model::TimeStamp;

/// A state-store or identity failure, passed through verbatim.
#[derive(Debug, thiserror::Error)]
#[error("host failure: {0}")]
pub struct HostError(#[from] pub anyhow::Error);

impl HostError {
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self(anyhow::anyhow!("{message}"))
    }
}

/// Organizational-unit roles the host can assert for a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Peer,
    Client,
    Orderer,
}

/// Transaction clock reading, seconds plus nanos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxTimestamp {
    pub seconds: i64,
    pub nanos: u32,
}

/// Metadata of the caller's enrollment certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerCertificate {
    pub serial_number: String,
    pub not_after: TimeStamp<Utc>,
}

/// One historical version of a key.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Record bytes at that point, `None` for a delete.
    pub value: Option<Vec<u8>>,
    pub timestamp: TxTimestamp,
    pub tx_id: String,
    pub is_delete: bool,
}

/// The narrow surface the engine requires from its execution host.
///
/// Reads observe committed state; writes are buffered by the host and made
/// atomic (or fully rejected) by its commit protocol, so the engine never
/// assumes exclusive access to a key between a read and a later write.
pub trait Host {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, HostError>;
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), HostError>;
    fn delete(&self, key: &str) -> Result<(), HostError>;

    /// All committed entries whose key starts with `prefix`, in key order.
    fn iterate_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, HostError>;

    /// Every committed version of `key`, oldest first.
    fn iterate_history(&self, key: &str) -> Result<Vec<HistoryEntry>, HostError>;

    fn current_tx_id(&self) -> String;
    fn current_tx_timestamp(&self) -> TxTimestamp;

    /// Queues a named event; the host publishes it when the operation
    /// commits.
    fn emit_event(&self, name: &str, payload: Vec<u8>);

    fn caller_identity_id(&self) -> Result<String, HostError>;
    fn caller_msp_id(&self) -> Result<String, HostError>;
    fn caller_certificate(&self) -> Result<CallerCertificate, HostError>;
    fn caller_has_role(&self, role: Role) -> Result<bool, HostError>;
}
