//! The marketplace engine
//!
//! One [`Engine`] instance serves every contract domain (users, catalog,
//! agreements, revocation); the operation implementations live in their own
//! modules and share the host handle, the configuration and the write
//! helpers defined here.

use std::sync::Arc;

use crate::codec::{self, Versioned};
use crate::error::{Error, OpResult};
use crate::host::Host;
use crate::identity::Caller;
use crate::keys::{self, EntityType};
use crate::model::{AgreementStatus, DEFAULT_AUTHORIZED_MSPS, User, UserInventory};

/// Decides whether an agreement may move between two statuses.
///
/// The historical contract accepted any vocabulary value in any order;
/// routing the check through this trait lets a deployment switch on strict
/// ordering without changing the call contract.
pub trait TransitionPolicy: Send + Sync {
    fn allows(&self, current: AgreementStatus, requested: AgreementStatus) -> bool;
}

/// Accepts every transition within the status vocabulary.
pub struct AnyTransition;

impl TransitionPolicy for AnyTransition {
    fn allows(&self, _current: AgreementStatus, _requested: AgreementStatus) -> bool {
        true
    }
}

/// Strict ordering: Eligible → Paid → Access, with Withdrawn reachable from
/// any non-terminal status.
pub struct OrderedTransitions;

impl TransitionPolicy for OrderedTransitions {
    fn allows(&self, current: AgreementStatus, requested: AgreementStatus) -> bool {
        use AgreementStatus::*;

        matches!(
            (current, requested),
            (Eligible, Paid) | (Paid, Access) | (Eligible | Paid, Withdrawn)
        )
    }
}

pub struct EngineConfig {
    /// MSPs allowed to move agreement statuses.
    pub authorized_msps: Vec<String>,
    pub transitions: Box<dyn TransitionPolicy>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            authorized_msps: DEFAULT_AUTHORIZED_MSPS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            transitions: Box::new(AnyTransition),
        }
    }
}

/// A decoded historical version of a keyed record.
#[derive(Debug, Clone)]
pub struct HistoryRecord<T> {
    /// The record at that point in time, `None` for a delete.
    pub record: Option<T>,
    pub tx_id: String,
    pub timestamp_seconds: i64,
    pub is_delete: bool,
}

pub struct Engine<H> {
    pub(crate) host: Arc<H>,
    pub(crate) config: EngineConfig,
}

impl<H: Host> Engine<H> {
    pub fn new(host: Arc<H>) -> Self {
        Self::with_config(host, EngineConfig::default())
    }

    pub fn with_config(host: Arc<H>, config: EngineConfig) -> Self {
        Self { host, config }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Takes the caller snapshot for an operation.
    pub(crate) fn caller(&self, op: &'static str) -> Result<Caller, Error> {
        Caller::resolve(&*self.host).op(op)
    }

    /// Stores a user record and optionally fires an event carrying it.
    pub(crate) fn put_user_record(
        &self,
        op: &'static str,
        user: &User,
        event: Option<&'static str>,
    ) -> Result<(), Error> {
        let key = keys::state_key(EntityType::User, &[&user.username]);
        let bytes = codec::encode_record(user).op(op)?;
        self.host.put(&key, bytes.clone()).op(op)?;

        if let Some(name) = event {
            self.host.emit_event(name, bytes);
        }

        Ok(())
    }

    pub(crate) fn read_inventory_record(
        &self,
        op: &'static str,
        username: &str,
    ) -> Result<Option<UserInventory>, Error> {
        let key = keys::state_key(EntityType::Inventory, &[username]);
        match self.host.get(&key).op(op)? {
            Some(bytes) => Ok(Some(codec::decode_record(&bytes).op(op)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn write_inventory(
        &self,
        op: &'static str,
        username: &str,
        inventory: UserInventory,
    ) -> Result<(), Error> {
        let key = keys::state_key(EntityType::Inventory, &[username]);
        let bytes = codec::encode_record(&inventory).op(op)?;
        self.host.put(&key, bytes).op(op)
    }

    /// Reads the committed inventory, applies `update` and writes it back.
    pub(crate) fn update_inventory(
        &self,
        op: &'static str,
        username: &str,
        update: impl FnOnce(&mut UserInventory),
    ) -> Result<UserInventory, Error> {
        let mut inventory = self
            .read_inventory_record(op, username)?
            .ok_or_else(|| Error::consistency(op, format!("missing inventory for {username}")))?;

        update(&mut inventory);
        self.write_inventory(op, username, inventory)?;
        Ok(inventory)
    }

    /// Replays every committed version of a key, decoding records through
    /// the versioned codec.
    pub(crate) fn key_history<T>(
        &self,
        op: &'static str,
        key: &str,
    ) -> Result<Vec<HistoryRecord<T>>, Error>
    where
        T: Versioned + for<'b> minicbor::Decode<'b, ()>,
    {
        let entries = self.host.iterate_history(key).op(op)?;

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            let record = match &entry.value {
                Some(bytes) => Some(codec::decode_record::<T>(bytes).op(op)?),
                None => None,
            };
            records.push(HistoryRecord {
                record,
                tx_id: entry.tx_id,
                timestamp_seconds: entry.timestamp.seconds,
                is_delete: entry.is_delete,
            });
        }

        Ok(records)
    }
}
