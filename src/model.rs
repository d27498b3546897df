//! Core marketplace entities, policy objects and fixed vocabularies

use chrono::{DateTime, TimeZone, Utc};
use std::fmt;

use crate::error::ValidationError;

/// Purpose label that triggers the automated-decision-making consequence
/// requirement on non-analytics products.
pub const AUTOMATED_DECISION_MAKING: &str = "automated";

/// Fixed vocabulary of purposes of buying/selling.
pub const PURPOSES: &[&str] = &[
    "marketing",
    "publicly_funded_research",
    "private_research",
    "managment",
    "automated",
    "study_recommendations",
    "job_offers",
    "statistical_research",
];

pub const EDUCATIONAL_INSTITUTION_TYPES: &[&str] = &[
    "hr_agencies",
    "private_companies",
    "public_institutions",
    "public_research_centers",
    "public_research_institutions",
];

pub const HEALTH_INSTITUTION_TYPES: &[&str] = &[
    "publicHospitals",
    "privateHospitals",
    "privateResearch",
    "publicResearch",
    "governments",
    "privateCompanies",
    "other",
];

pub const AUTOMATED_DECISION_MAKING_CONSEQUENCES: &[&str] = &[
    "automated_placing",
    "hiring_assessments",
    "clinical_risks_assessment",
    "diagnostic_or_treatment",
];

/// MSPs allowed to move agreement statuses, unless overridden in
/// [`EngineConfig`](crate::engine::EngineConfig).
pub const DEFAULT_AUTHORIZED_MSPS: &[&str] = &["LynkeusMSP", "TexMSP"];

/// UTC timestamp persisted with seconds resolution.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }

    pub fn from_seconds(secs: i64) -> Option<Self> {
        DateTime::from_timestamp(secs, 0).map(Self)
    }

    pub fn seconds(&self) -> i64 {
        self.0.timestamp()
    }

    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.i64(self.0.timestamp())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let secs = d.i64()?;

        DateTime::from_timestamp(secs, 0)
            .map(TimeStamp)
            .ok_or(minicbor::decode::Error::message(
                "failed to convert timestamp to utc",
            ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Sector {
    #[n(0)]
    Health,
    #[n(1)]
    Education,
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sector::Health => write!(f, "Health and wellness"),
            Sector::Education => write!(f, "Education"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum ProductType {
    #[n(0)]
    Batch,
    #[n(1)]
    Streams,
    #[n(2)]
    Analytics,
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProductType::Batch => write!(f, "BATCH"),
            ProductType::Streams => write!(f, "STREAMS"),
            ProductType::Analytics => write!(f, "ANALYTICS"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum ProtectionType {
    #[n(0)]
    Anonymization,
    #[n(1)]
    Encryption,
    #[n(2)]
    Smpc,
}

impl fmt::Display for ProtectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtectionType::Anonymization => write!(f, "Anonymization"),
            ProtectionType::Encryption => write!(f, "Encryption"),
            ProtectionType::Smpc => write!(f, "SMPC"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum AgreementStatus {
    #[n(0)]
    Eligible,
    #[n(1)]
    Paid,
    #[n(2)]
    Access,
    #[n(3)]
    Withdrawn,
}

impl fmt::Display for AgreementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgreementStatus::Eligible => write!(f, "Eligible"),
            AgreementStatus::Paid => write!(f, "Paid"),
            AgreementStatus::Access => write!(f, "Access"),
            AgreementStatus::Withdrawn => write!(f, "Withdrawn"),
        }
    }
}

/// A registered marketplace participant, keyed by username.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct User {
    // Identity id assigned by the host, distinct from the chosen username
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub username: String,
    #[n(2)]
    pub msp_id: String,

    // Sharing/looking for data on behalf of an organization
    #[n(3)]
    pub is_org: bool,

    // Username of the organization this user transacts on behalf of
    #[n(4)]
    pub is_member_of: Option<String>,
    #[n(5)]
    pub org: Org,

    #[n(6)]
    pub is_buyer: bool,

    // As a buyer, purpose preferences to filter the marketplace
    #[n(7)]
    pub purposes: Vec<String>,

    // Certificate validity; expired sellers cannot transact
    #[n(8)]
    pub valid_to: TimeStamp<Utc>,

    // hash(msp id + certificate serial), see keys::certificate_key
    #[n(9)]
    pub cert_key: String,

    #[n(10)]
    pub active: bool,
}

/// Organization profile embedded in a [`User`] record.
#[derive(Debug, Clone, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Org {
    #[n(0)]
    pub inst_type: String,
    #[n(1)]
    pub org_name: String,
    #[n(2)]
    pub active: bool,

    // Identity ids of users transacting on behalf of the organization
    #[n(3)]
    pub members: Vec<String>,
}

impl Org {
    /// Argument checks applied when the owning user declares `is_org`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let known = HEALTH_INSTITUTION_TYPES
            .iter()
            .chain(EDUCATIONAL_INSTITUTION_TYPES)
            .any(|t| *t == self.inst_type);
        if !known {
            return Err(ValidationError::UndefinedInstitutionType(
                self.inst_type.clone(),
            ));
        }

        if self.org_name.is_empty() {
            return Err(ValidationError::MissingOrgName);
        }

        Ok(())
    }

    /// Clears the profile for users that are not organizations.
    pub fn reset(&mut self) {
        self.inst_type = String::new();
        self.org_name = String::new();
        self.active = false;
        self.members = Vec::new();
    }
}

/// Caller-supplied input to `CreateUser`/`UpdateUser`. The `id` field is
/// ignored on create (the host assigns it) and checked for ownership on
/// update.
#[derive(Debug, Clone, Default, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct UserInput {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub username: String,
    #[n(2)]
    pub is_org: bool,
    #[n(3)]
    pub is_member_of: Option<String>,
    #[n(4)]
    pub org: Org,
    #[n(5)]
    pub is_buyer: bool,
    #[n(6)]
    pub purposes: Vec<String>,
}

/// Per-owner product counters. `salt` only ever grows and feeds product id
/// derivation; `count` tracks live products.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct UserInventory {
    #[n(0)]
    pub count: u64,
    #[n(1)]
    pub salt: u64,
}

/// A named access tier a product may expose to buyers.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct DataAccessLevel {
    #[n(0)]
    pub level: String,
}

/// A data product offered on the marketplace.
///
/// The id is content-addressed: hash of the owner's username and the
/// inventory salt at creation time, so ids are never reused even after a
/// delete.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct Product {
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

    // Tx-clock seconds, assigned at creation
    #[n(8)]
    pub timestamp: i64,

    // In case of a curated data product, ids of the source products
    #[n(9)]
    pub curations: Vec<String>,

    #[n(10)]
    pub data_access_levels: Vec<DataAccessLevel>,
}

/// Usage-restriction object embedded in a [`Product`].
#[derive(Debug, Clone, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Policy {
    // Includes personal info of a third party
    #[n(0)]
    pub incl_personal_info: bool,
    // Third party has granted consent to include personal info
    #[n(1)]
    pub has_consent: bool,

    #[n(2)]
    pub purposes: Vec<String>,

    #[n(3)]
    pub protection_type: ProtectionType,

    #[n(4)]
    pub sec_use_consent: bool,
    #[n(5)]
    pub recipient_type: Vec<String>,

    // Third country transfers, if any
    #[n(6)]
    pub transfer_to_country: String,

    // Time period the product stays available
    #[n(7)]
    pub storage_period: i64,

    // Org usernames allowed to transact regardless of institution checks
    #[n(8)]
    pub approved_orgs: Vec<String>,

    // Usernames on input; rewritten to identity ids during validation
    #[n(9)]
    pub approved_users: Vec<String>,

    #[n(10)]
    pub automated_decision_making: Vec<String>,
}

impl Default for ProtectionType {
    fn default() -> Self {
        ProtectionType::Anonymization
    }
}

/// The buyer's declared parameters, matched against a product policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct BuyerParams {
    #[n(0)]
    pub purposes: Vec<String>,
    #[n(1)]
    pub data_access_level: Option<String>,
}

/// A recorded buyer/seller/product transaction, keyed by the transaction id
/// of the operation that created it. Never deleted.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct Agreement {
    #[n(0)]
    pub transaction_id: String,
    #[n(1)]
    pub product_id: String,
    #[n(2)]
    pub product_type: ProductType,
    #[n(3)]
    pub seller: String,
    #[n(4)]
    pub buyer: String,
    #[n(5)]
    pub price: f64,
    #[n(6)]
    pub status: AgreementStatus,
    #[n(7)]
    pub timestamp: i64,
}

/// A certificate serial revoked by an organization, keyed by
/// hash(msp id + serial).
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct RevokedCertificate {
    #[n(0)]
    pub msp_id: String,
    #[n(1)]
    pub serial_number: String,
    #[n(2)]
    pub revocation_time: TimeStamp<Utc>,
    #[n(3)]
    pub key: String,
}

/// A pre-parsed revocation-list entry; X.509/PEM mechanics live in the
/// gateway, the engine only keys and stores the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrlEntry {
    pub serial_number: String,
    pub revocation_time: TimeStamp<Utc>,
}

/// Checks every input value against a fixed vocabulary. Empty input is
/// rejected, callers that allow empty lists must guard first.
pub fn validate_values(
    input: &[String],
    allowed: &[&str],
    what: &'static str,
) -> Result<(), ValidationError> {
    if input.is_empty() {
        return Err(ValidationError::EmptyValues { what });
    }

    for value in input {
        if !allowed.iter().any(|a| a == value) {
            return Err(ValidationError::UndefinedValue {
                what,
                value: value.clone(),
            });
        }
    }

    Ok(())
}
