//! Deterministic key space
//!
//! Key construction is a pure function of the entity type and its natural
//! key parts, independent of the storage backend. Parts are joined with a
//! NUL separator so keys of one entity type form a contiguous,
//! prefix-scannable range.

use std::fmt;

const SEPARATOR: char = '\u{0}';

/// Namespaces of the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    User,
    /// Secondary index from host identity id to username.
    UserId,
    Product,
    Agreement,
    Inventory,
    RevokedCert,
}

impl EntityType {
    pub fn tag(self) -> &'static str {
        match self {
            EntityType::User => "user",
            EntityType::UserId => "userID",
            EntityType::Product => "product",
            EntityType::Agreement => "agreement",
            EntityType::Inventory => "inventory",
            EntityType::RevokedCert => "revoked",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Builds the state-store address for an entity.
pub fn state_key(entity: EntityType, parts: &[&str]) -> String {
    let mut key = String::new();
    key.push(SEPARATOR);
    key.push_str(entity.tag());

    for part in parts {
        key.push(SEPARATOR);
        key.push_str(part);
    }

    key
}

/// Prefix covering every key of the given entity type.
pub fn prefix(entity: EntityType) -> String {
    let mut p = state_key(entity, &[]);
    p.push(SEPARATOR);
    p
}

/// Content-addressed product id: hex(sha256(owner + salt)).
///
/// The salt comes from the owner's inventory and only ever increases, so an
/// id is never reused even after the product is deleted.
pub fn product_id(owner: &str, salt: u64) -> String {
    sha256::digest(format!("{owner}{salt}"))
}

/// Content-addressed key for a certificate: hex(sha256(msp id + serial)).
pub fn certificate_key(msp_id: &str, serial_number: &str) -> String {
    sha256::digest(format!("{msp_id}{serial_number}"))
}
