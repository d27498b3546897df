//! Failure types for engine operations
//!
//! Every failure carries the stable name of the operation that produced it
//! plus a category: not-found, authorization, validation, consistency or a
//! pass-through host/codec failure. Checks always run before the first
//! write of an operation, so a returned error means no state was touched.

use crate::codec::CodecError;
use crate::host::HostError;
use crate::model::AgreementStatus;

/// A failed engine operation.
#[derive(Debug, thiserror::Error)]
#[error("{op}: {kind}")]
pub struct Error {
    op: &'static str,
    #[source]
    kind: ErrorKind,
}

impl Error {
    pub fn new(op: &'static str, kind: impl Into<ErrorKind>) -> Self {
        Self {
            op,
            kind: kind.into(),
        }
    }

    pub fn not_found(op: &'static str, what: impl Into<String>) -> Self {
        Self::new(op, ErrorKind::NotFound(what.into()))
    }

    pub fn unauthorized(op: &'static str, why: impl Into<String>) -> Self {
        Self::new(op, ErrorKind::Unauthorized(why.into()))
    }

    pub fn consistency(op: &'static str, why: impl Into<String>) -> Self {
        Self::new(op, ErrorKind::Consistency(why.into()))
    }

    /// Name of the operation that failed, e.g. `"CreateProduct"`.
    pub fn op(&self) -> &'static str {
        self.op
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl From<HostError> for Error {
    fn from(err: HostError) -> Self {
        Self::new("CommitOperation", ErrorKind::Host(err))
    }
}

/// Failure category of an [`Error`].
#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("authorization: {0}")]
    Unauthorized(String),
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),
    #[error("consistency: {0}")]
    Consistency(String),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl ErrorKind {
    pub fn is_validation(&self) -> bool {
        matches!(self, ErrorKind::Validation(_))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("username length must be at least 4")]
    UsernameTooShort,
    #[error("identity {0} is already registered")]
    IdentityAlreadyRegistered(String),
    #[error("username {0} already exists")]
    UsernameExists(String),
    #[error("user does not have a registered account")]
    CallerUnregistered,
    #[error("empty {what} input")]
    EmptyValues { what: &'static str },
    #[error("undefined {what} value: {value}")]
    UndefinedValue { what: &'static str, value: String },
    #[error("undefined institution value: {0}")]
    UndefinedInstitutionType(String),
    #[error("missing organization name")]
    MissingOrgName,
    #[error("negative value for price")]
    NegativePrice,
    #[error("no consent to sell personal data")]
    MissingConsent,
    #[error("no purpose of buying stated")]
    MissingPurposes,
    #[error("cannot pre approve orgs on sector: {0}")]
    PreApprovedOrgsNotAllowed(String),
    #[error("missing pre approved orgs for product of type: {0}")]
    MissingPreApprovedOrgs(String),
    #[error("no institution types selected")]
    MissingRecipientTypes,
    #[error("no automated decision making consequences selected")]
    MissingAdmConsequences,
    #[error("curation base product {0} does not exist")]
    CurationBaseMissing(String),
    #[error("user is not a registered buyer")]
    NotABuyer,
    #[error("seller {0} has an expired certificate")]
    SellerCertificateExpired(String),
    #[error("seller {0} is inactive")]
    SellerInactive(String),
    #[error("data access level {0:?} does not exist in the product")]
    UnknownDataAccessLevel(Option<String>),
    #[error("caller does not belong to an organization")]
    NoOrganization,
    #[error("organization {0} does not exist")]
    OrganizationMissing(String),
    #[error("user {0} is not an organization")]
    NotAnOrganization(String),
    #[error("organization {0} is not active")]
    OrganizationInactive(String),
    #[error("buyer's org is not pre approved on this data product")]
    OrgNotPreApproved,
    #[error("buyer's org institution type is not compatible with data policy")]
    InstitutionTypeMismatch,
    #[error("purposes of buying not compatible with policy")]
    PurposesMismatch,
    #[error("too many purposes of buying, not compatible with policy")]
    TooManyPurposes,
    #[error("agreement status transition {from} -> {to} is not allowed")]
    TransitionNotAllowed {
        from: AgreementStatus,
        to: AgreementStatus,
    },
}

/// Attaches the operation name to lower-level failures, so `?` can be used
/// on host/codec/validation results inside operation bodies.
pub(crate) trait OpResult<T> {
    fn op(self, op: &'static str) -> Result<T, Error>;
}

impl<T, E: Into<ErrorKind>> OpResult<T> for Result<T, E> {
    fn op(self, op: &'static str) -> Result<T, Error> {
        self.map_err(|err| Error::new(op, err))
    }
}
