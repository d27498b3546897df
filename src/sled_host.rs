//! Reference [`Host`] backed by sled
//!
//! Models the host side of the contract the engine relies on: reads observe
//! committed state only, writes and events accumulate in a per-operation
//! buffer and land atomically on `commit_operation` (a single sled batch),
//! or not at all on `abort_operation`. Every committed write also appends
//! to a history tree so `iterate_history` can replay a key's past versions.
//!
//! The caller identity is plain data and swappable between operations,
//! which is all the tests and the demo gateway need.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;

use chrono::{Duration, Utc};
use uuid7::uuid7;

use crate::host::{CallerCertificate, HistoryEntry, Host, HostError, Role, TxTimestamp};
use crate::model::TimeStamp;
use crate::utils;

/// Identity material the host asserts for the current caller.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub identity_id: String,
    pub msp_id: String,
    pub certificate: CallerCertificate,
    pub roles: Vec<Role>,
}

impl CallerIdentity {
    /// Enrolls a fresh identity under the given MSP: bech32 identity
    /// address, hex certificate serial, one year of validity, client role.
    pub fn generate(msp_id: &str) -> anyhow::Result<Self> {
        let identity_id = utils::new_address("id_")?;
        let certificate = CallerCertificate {
            serial_number: utils::new_serial_number(),
            not_after: TimeStamp::from(Utc::now() + Duration::days(365)),
        };

        Ok(Self {
            identity_id,
            msp_id: msp_id.to_string(),
            certificate,
            roles: vec![Role::Client],
        })
    }

    pub fn with_roles(mut self, roles: Vec<Role>) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_not_after(mut self, not_after: TimeStamp<Utc>) -> Self {
        self.certificate.not_after = not_after;
        self
    }
}

/// An event published at commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    pub tx_id: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct TxMeta {
    id: String,
    timestamp: TxTimestamp,
}

#[derive(Debug, minicbor::Encode, minicbor::Decode)]
struct StoredHistory {
    #[cbor(n(0), with = "minicbor::bytes")]
    value: Vec<u8>,
    #[n(1)]
    seconds: i64,
    #[n(2)]
    nanos: u32,
    #[n(3)]
    tx_id: String,
    #[n(4)]
    is_delete: bool,
}

pub struct SledHost {
    db: sled::Db,
    state: sled::Tree,
    history: sled::Tree,
    caller: RefCell<CallerIdentity>,
    tx: RefCell<TxMeta>,
    pending: RefCell<BTreeMap<String, Option<Vec<u8>>>>,
    pending_events: RefCell<Vec<Event>>,
    events: RefCell<Vec<Event>>,
}

impl SledHost {
    pub fn open(path: impl AsRef<Path>, caller: CallerIdentity) -> Result<Self, HostError> {
        let db = sled::open(path).map_err(storage_err)?;
        let state = db.open_tree("state").map_err(storage_err)?;
        let history = db.open_tree("history").map_err(storage_err)?;

        Ok(Self {
            db,
            state,
            history,
            caller: RefCell::new(caller),
            tx: RefCell::new(fresh_tx()),
            pending: RefCell::new(BTreeMap::new()),
            pending_events: RefCell::new(Vec::new()),
            events: RefCell::new(Vec::new()),
        })
    }

    /// Swap the asserted caller for subsequent operations.
    pub fn set_caller(&self, caller: CallerIdentity) {
        *self.caller.borrow_mut() = caller;
    }

    pub fn caller(&self) -> CallerIdentity {
        self.caller.borrow().clone()
    }

    /// Starts a new operation: fresh transaction id and clock reading,
    /// empty write and event buffers.
    pub fn begin_operation(&self) {
        *self.tx.borrow_mut() = fresh_tx();
        self.pending.borrow_mut().clear();
        self.pending_events.borrow_mut().clear();
    }

    /// Applies the buffered write set as one sled batch, appends history
    /// entries and publishes buffered events.
    pub fn commit_operation(&self) -> Result<(), HostError> {
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        let tx = self.tx.borrow().clone();

        let mut batch = sled::Batch::default();
        for (key, value) in &pending {
            match value {
                Some(bytes) => batch.insert(key.as_bytes(), bytes.clone()),
                None => batch.remove(key.as_bytes()),
            }
        }
        self.state.apply_batch(batch).map_err(storage_err)?;

        for (key, value) in pending {
            let seq = self.db.generate_id().map_err(storage_err)?;
            let history_key = format!("{key}\u{0}{seq:020}");
            let stored = StoredHistory {
                is_delete: value.is_none(),
                value: value.unwrap_or_default(),
                seconds: tx.timestamp.seconds,
                nanos: tx.timestamp.nanos,
                tx_id: tx.id.clone(),
            };
            let bytes = minicbor::to_vec(&stored)
                .map_err(|e| HostError::msg(format!("history encoding: {e}")))?;
            self.history
                .insert(history_key.as_bytes(), bytes)
                .map_err(storage_err)?;
        }

        let published = std::mem::take(&mut *self.pending_events.borrow_mut());
        self.events.borrow_mut().extend(published);

        Ok(())
    }

    /// Drops the buffered write set and events of the current operation.
    pub fn abort_operation(&self) {
        self.pending.borrow_mut().clear();
        self.pending_events.borrow_mut().clear();
    }

    /// Runs one operation to completion: begin, invoke, then commit on
    /// success or abort on failure.
    pub fn transact<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: From<HostError>,
    {
        self.begin_operation();
        match f() {
            Ok(value) => {
                self.commit_operation()?;
                Ok(value)
            }
            Err(err) => {
                self.abort_operation();
                Err(err)
            }
        }
    }

    /// Events published by committed operations since the last call.
    pub fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.borrow_mut())
    }
}

impl Host for SledHost {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, HostError> {
        let value = self.state.get(key.as_bytes()).map_err(storage_err)?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), HostError> {
        self.pending
            .borrow_mut()
            .insert(key.to_string(), Some(value));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), HostError> {
        self.pending.borrow_mut().insert(key.to_string(), None);
        Ok(())
    }

    fn iterate_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, HostError> {
        let mut entries = Vec::new();
        for item in self.state.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item.map_err(storage_err)?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|_| HostError::msg("state key is not valid UTF-8"))?;
            entries.push((key, value.to_vec()));
        }
        Ok(entries)
    }

    fn iterate_history(&self, key: &str) -> Result<Vec<HistoryEntry>, HostError> {
        let prefix = format!("{key}\u{0}");
        let mut entries = Vec::new();

        for item in self.history.scan_prefix(prefix.as_bytes()) {
            let (_, value) = item.map_err(storage_err)?;
            let stored: StoredHistory = minicbor::decode(&value)
                .map_err(|e| HostError::msg(format!("history decoding: {e}")))?;

            entries.push(HistoryEntry {
                value: (!stored.is_delete).then_some(stored.value),
                timestamp: TxTimestamp {
                    seconds: stored.seconds,
                    nanos: stored.nanos,
                },
                tx_id: stored.tx_id,
                is_delete: stored.is_delete,
            });
        }

        Ok(entries)
    }

    fn current_tx_id(&self) -> String {
        self.tx.borrow().id.clone()
    }

    fn current_tx_timestamp(&self) -> TxTimestamp {
        self.tx.borrow().timestamp
    }

    fn emit_event(&self, name: &str, payload: Vec<u8>) {
        let event = Event {
            name: name.to_string(),
            tx_id: self.current_tx_id(),
            payload,
        };
        self.pending_events.borrow_mut().push(event);
    }

    fn caller_identity_id(&self) -> Result<String, HostError> {
        Ok(self.caller.borrow().identity_id.clone())
    }

    fn caller_msp_id(&self) -> Result<String, HostError> {
        Ok(self.caller.borrow().msp_id.clone())
    }

    fn caller_certificate(&self) -> Result<CallerCertificate, HostError> {
        Ok(self.caller.borrow().certificate.clone())
    }

    fn caller_has_role(&self, role: Role) -> Result<bool, HostError> {
        Ok(self.caller.borrow().roles.contains(&role))
    }
}

fn fresh_tx() -> TxMeta {
    let now = Utc::now();
    TxMeta {
        id: uuid7().to_string(),
        timestamp: TxTimestamp {
            seconds: now.timestamp(),
            nanos: now.timestamp_subsec_nanos(),
        },
    }
}

fn storage_err(err: sled::Error) -> HostError {
    HostError(err.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_host() -> (tempfile::TempDir, SledHost) {
        let dir = tempdir().unwrap();
        let caller = CallerIdentity::generate("LynkeusMSP").unwrap();
        let host = SledHost::open(dir.path().join("host.db"), caller).unwrap();
        (dir, host)
    }

    #[test]
    fn writes_are_invisible_until_commit() {
        let (_dir, host) = open_host();

        host.begin_operation();
        host.put("k", b"v".to_vec()).unwrap();
        assert_eq!(host.get("k").unwrap(), None);

        host.commit_operation().unwrap();
        assert_eq!(host.get("k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn aborted_operations_leave_no_trace() {
        let (_dir, host) = open_host();

        host.begin_operation();
        host.put("k", b"v".to_vec()).unwrap();
        host.emit_event("Ev", vec![]);
        host.abort_operation();
        host.begin_operation();
        host.commit_operation().unwrap();

        assert_eq!(host.get("k").unwrap(), None);
        assert!(host.take_events().is_empty());
        assert!(host.iterate_history("k").unwrap().is_empty());
    }

    #[test]
    fn history_replays_writes_and_deletes_in_order() {
        let (_dir, host) = open_host();

        host.begin_operation();
        host.put("k", b"v1".to_vec()).unwrap();
        host.commit_operation().unwrap();

        host.begin_operation();
        host.put("k", b"v2".to_vec()).unwrap();
        host.commit_operation().unwrap();

        host.begin_operation();
        host.delete("k").unwrap();
        host.commit_operation().unwrap();

        let history = host.iterate_history("k").unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].value.as_deref(), Some(b"v1".as_slice()));
        assert_eq!(history[1].value.as_deref(), Some(b"v2".as_slice()));
        assert!(history[2].is_delete);
        assert!(history[2].value.is_none());
    }

    #[test]
    fn events_publish_only_on_commit() {
        let (_dir, host) = open_host();

        host.begin_operation();
        host.emit_event("CreateUser", b"payload".to_vec());
        assert!(host.take_events().is_empty());

        host.commit_operation().unwrap();
        let events = host.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "CreateUser");
        assert_eq!(events[0].tx_id, host.current_tx_id());
    }

    #[test]
    fn transaction_ids_rotate_per_operation() {
        let (_dir, host) = open_host();

        host.begin_operation();
        let first = host.current_tx_id();
        host.commit_operation().unwrap();

        host.begin_operation();
        assert_ne!(first, host.current_tx_id());
    }
}
