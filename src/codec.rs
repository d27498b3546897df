//! Versioned record codec
//!
//! Every persisted record is a CBOR envelope `{version, payload}`. Readers
//! inspect the version tag before touching the payload: current-version
//! payloads decode directly, older versions run through an explicit upgrade
//! chain, and a missing or unknown tag fails the read. The envelope is what
//! lets already-shipped records survive schema changes.

use chrono::Utc;

use crate::model::{
    Agreement, Org, Policy, Product, ProductType, RevokedCertificate, Sector, TimeStamp, User,
    UserInventory,
};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encoding failed: {0}")]
    Encode(String),
    #[error("decoding failed: {0}")]
    Decode(String),
    #[error("unsupported {kind} record version: {version}")]
    UnknownVersion { kind: &'static str, version: u16 },
}

#[derive(Debug, minicbor::Encode, minicbor::Decode)]
struct Envelope {
    #[n(0)]
    version: u16,
    #[cbor(n(1), with = "minicbor::bytes")]
    payload: Vec<u8>,
}

/// A record type with a schema version and an upgrade path from every
/// previously shipped version.
pub trait Versioned: Sized {
    const KIND: &'static str;
    const VERSION: u16;

    /// Decodes a payload written at an older `version`. The default refuses
    /// everything; types with legacy shapes override it.
    fn upgrade(version: u16, _payload: &[u8]) -> Result<Self, CodecError> {
        Err(CodecError::UnknownVersion {
            kind: Self::KIND,
            version,
        })
    }
}

/// Wraps a payload in an envelope at an explicit version. Exposed so tests
/// and migration tooling can produce records of older shapes.
pub fn encode_versioned<T>(version: u16, value: &T) -> Result<Vec<u8>, CodecError>
where
    T: minicbor::Encode<()>,
{
    let payload = minicbor::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))?;
    let envelope = Envelope { version, payload };
    minicbor::to_vec(&envelope).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Serializes a record at its current schema version.
pub fn encode_record<T>(value: &T) -> Result<Vec<u8>, CodecError>
where
    T: Versioned + minicbor::Encode<()>,
{
    encode_versioned(T::VERSION, value)
}

/// Deserializes a stored record, upgrading older versions on the way.
pub fn decode_record<T>(bytes: &[u8]) -> Result<T, CodecError>
where
    T: Versioned + for<'b> minicbor::Decode<'b, ()>,
{
    let envelope: Envelope =
        minicbor::decode(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;

    if envelope.version == T::VERSION {
        return minicbor::decode(&envelope.payload).map_err(|e| CodecError::Decode(e.to_string()));
    }

    T::upgrade(envelope.version, &envelope.payload)
}

impl Versioned for User {
    const KIND: &'static str = "user";
    const VERSION: u16 = 2;

    fn upgrade(version: u16, payload: &[u8]) -> Result<Self, CodecError> {
        match version {
            1 => {
                let v1: UserRecordV1 =
                    minicbor::decode(payload).map_err(|e| CodecError::Decode(e.to_string()))?;
                Ok(v1.into())
            }
            other => Err(CodecError::UnknownVersion {
                kind: Self::KIND,
                version: other,
            }),
        }
    }
}

impl Versioned for Product {
    const KIND: &'static str = "product";
    const VERSION: u16 = 2;

    fn upgrade(version: u16, payload: &[u8]) -> Result<Self, CodecError> {
        match version {
            1 => {
                let v1: ProductRecordV1 =
                    minicbor::decode(payload).map_err(|e| CodecError::Decode(e.to_string()))?;
                Ok(v1.into())
            }
            other => Err(CodecError::UnknownVersion {
                kind: Self::KIND,
                version: other,
            }),
        }
    }
}

impl Versioned for UserInventory {
    const KIND: &'static str = "inventory";
    const VERSION: u16 = 1;
}

impl Versioned for Agreement {
    const KIND: &'static str = "agreement";
    const VERSION: u16 = 1;
}

impl Versioned for RevokedCertificate {
    const KIND: &'static str = "revoked";
    const VERSION: u16 = 1;
}

/// User record shape before certificate tracking landed. Decoded records
/// default to an empty certificate key and stay active.
#[derive(Debug, minicbor::Encode, minicbor::Decode)]
pub struct UserRecordV1 {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub username: String,
    #[n(2)]
    pub msp_id: String,
    #[n(3)]
    pub is_org: bool,
    #[n(4)]
    pub is_member_of: Option<String>,
    #[n(5)]
    pub org: Org,
    #[n(6)]
    pub is_buyer: bool,
    #[n(7)]
    pub purposes: Vec<String>,
    #[n(8)]
    pub valid_to: TimeStamp<Utc>,
}

impl From<UserRecordV1> for User {
    fn from(v1: UserRecordV1) -> Self {
        User {
            id: v1.id,
            username: v1.username,
            msp_id: v1.msp_id,
            is_org: v1.is_org,
            is_member_of: v1.is_member_of,
            org: v1.org,
            is_buyer: v1.is_buyer,
            purposes: v1.purposes,
            valid_to: v1.valid_to,
            cert_key: String::new(),
            active: true,
        }
    }
}

/// Product record shape before curation chains and access levels.
#[derive(Debug, minicbor::Encode, minicbor::Decode)]
pub struct ProductRecordV1 {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub owner: String,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub desc: String,
    #[n(4)]
    pub price: f64,
    #[n(5)]
    pub sector: Sector,
    #[n(6)]
    pub product_type: ProductType,
    #[n(7)]
    pub policy: Policy,
    #[n(8)]
    pub timestamp: i64,
}

impl From<ProductRecordV1> for Product {
    fn from(v1: ProductRecordV1) -> Self {
        Product {
            id: v1.id,
            owner: v1.owner,
            name: v1.name,
            desc: v1.desc,
            price: v1.price,
            sector: v1.sector,
            product_type: v1.product_type,
            policy: v1.policy,
            timestamp: v1.timestamp,
            curations: Vec::new(),
            data_access_levels: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgreementStatus, ProtectionType};

    fn sample_user() -> User {
        User {
            id: "id_alice".to_string(),
            username: "alice".to_string(),
            msp_id: "LynkeusMSP".to_string(),
            is_org: false,
            is_member_of: Some("general".to_string()),
            org: Org::default(),
            is_buyer: true,
            purposes: vec!["marketing".to_string()],
            valid_to: TimeStamp::new_with(2030, 1, 1, 0, 0, 0),
            cert_key: "abc".to_string(),
            active: true,
        }
    }

    #[test]
    fn user_round_trips_at_current_version() {
        let user = sample_user();
        let bytes = encode_record(&user).unwrap();
        let decoded: User = decode_record(&bytes).unwrap();
        assert_eq!(user, decoded);
    }

    #[test]
    fn agreement_round_trips_at_current_version() {
        let agreement = Agreement {
            transaction_id: "tx-1".to_string(),
            product_id: "p-1".to_string(),
            product_type: ProductType::Batch,
            seller: "alice".to_string(),
            buyer: "bob".to_string(),
            price: 10.0,
            status: AgreementStatus::Eligible,
            timestamp: 1_700_000_000,
        };

        let bytes = encode_record(&agreement).unwrap();
        let decoded: Agreement = decode_record(&bytes).unwrap();
        assert_eq!(agreement, decoded);
    }

    #[test]
    fn v1_user_records_upgrade_with_defaults() {
        let v1 = UserRecordV1 {
            id: "id_old".to_string(),
            username: "olduser".to_string(),
            msp_id: "TexMSP".to_string(),
            is_org: false,
            is_member_of: None,
            org: Org::default(),
            is_buyer: false,
            purposes: vec![],
            valid_to: TimeStamp::new_with(2027, 1, 1, 0, 0, 0),
        };

        let bytes = encode_versioned(1, &v1).unwrap();
        let user: User = decode_record(&bytes).unwrap();

        assert_eq!(user.username, "olduser");
        assert_eq!(user.cert_key, "");
        assert!(user.active);
    }

    #[test]
    fn v1_product_records_upgrade_with_defaults() {
        let v1 = ProductRecordV1 {
            id: "deadbeef".to_string(),
            owner: "alice".to_string(),
            name: "scans".to_string(),
            desc: String::new(),
            price: 5.0,
            sector: Sector::Education,
            product_type: ProductType::Analytics,
            policy: Policy {
                protection_type: ProtectionType::Encryption,
                recipient_type: vec!["public_institutions".to_string()],
                ..Policy::default()
            },
            timestamp: 1_600_000_000,
        };

        let bytes = encode_versioned(1, &v1).unwrap();
        let product: Product = decode_record(&bytes).unwrap();

        assert_eq!(product.id, "deadbeef");
        assert!(product.curations.is_empty());
        assert!(product.data_access_levels.is_empty());
    }

    #[test]
    fn unknown_versions_fail_the_read() {
        let user = sample_user();
        let bytes = encode_versioned(9, &user).unwrap();
        let err = decode_record::<User>(&bytes).unwrap_err();
        assert!(matches!(
            err,
            CodecError::UnknownVersion { version: 9, .. }
        ));
    }

    #[test]
    fn garbage_bytes_fail_the_read() {
        let err = decode_record::<User>(&[0xff, 0xff, 0x00]).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }
}
