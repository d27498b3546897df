//! Identity context
//!
//! Before any operation body runs, the caller's bound username is resolved
//! from the identity index and the full user record is loaded. That
//! snapshot is the sole source of "who is calling" for the rest of the
//! operation; it is never re-fetched, so every ownership check within one
//! operation sees the same user.

use chrono::Utc;

use crate::codec;
use crate::error::{ErrorKind, ValidationError};
use crate::host::Host;
use crate::keys::{self, EntityType};
use crate::model::{TimeStamp, User};

/// The caller snapshot taken at the start of an operation.
#[derive(Debug, Clone)]
pub struct Caller {
    user: Option<User>,
}

impl Caller {
    /// Resolves identity id → username → user record. An unbound identity
    /// yields an empty snapshot, not an error.
    pub fn resolve<H: Host>(host: &H) -> Result<Self, ErrorKind> {
        let identity_id = host.caller_identity_id()?;

        let index_key = keys::state_key(EntityType::UserId, &[&identity_id]);
        let Some(bytes) = host.get(&index_key)? else {
            return Ok(Self { user: None });
        };

        let username = String::from_utf8(bytes)
            .map_err(|_| ErrorKind::Consistency("identity index entry is not UTF-8".to_string()))?;

        let user_key = keys::state_key(EntityType::User, &[&username]);
        let user = match host.get(&user_key)? {
            Some(record) => Some(codec::decode_record::<User>(&record)?),
            None => None,
        };

        Ok(Self { user })
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn username(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.username.as_str())
    }

    /// The resolved user, or the validation failure operations raise when
    /// the caller has no registered account.
    pub fn require(&self) -> Result<&User, ValidationError> {
        self.user.as_ref().ok_or(ValidationError::CallerUnregistered)
    }
}

/// Certificate validity and content-addressed certificate key for the
/// current caller, re-derived on every create/update.
pub fn certificate_metadata<H: Host>(host: &H) -> Result<(TimeStamp<Utc>, String), ErrorKind> {
    let certificate = host.caller_certificate()?;
    let msp_id = host.caller_msp_id()?;
    let cert_key = keys::certificate_key(&msp_id, &certificate.serial_number);

    Ok((certificate.not_after, cert_key))
}
