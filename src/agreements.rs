//! Agreement ledger and eligibility matching
//!
//! Eligibility matches a buyer's declared parameters against a product's
//! policy: access level first, then the pre-approved-user short-circuit,
//! then organization and sector rules. A successful purchase records an
//! agreement keyed by the operation's transaction id; agreements are never
//! deleted, only their status moves.

use tracing::debug;

use crate::codec;
use crate::engine::{Engine, HistoryRecord};
use crate::error::{Error, OpResult, ValidationError};
use crate::host::{Host, Role};
use crate::identity::Caller;
use crate::keys::{self, EntityType};
use crate::model::{
    Agreement, AgreementStatus, BuyerParams, Product, ProductType, Sector, User,
};

impl<H: Host> Engine<H> {
    /// Whether the resolved caller may transact this product. Policy
    /// violations come back as `Ok(false)`; host and codec failures
    /// propagate.
    pub fn is_eligible(&self, product: &Product, params: &BuyerParams) -> Result<bool, Error> {
        const OP: &str = "IsEligible";

        let caller = self.caller(OP)?;
        match self.validate_policy(OP, &caller, product, params) {
            Ok(()) => Ok(true),
            Err(err) if err.kind().is_validation() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Moves an agreement to a new status. Restricted to the configured MSP
    /// allow-list and the client organizational-unit role; the transition
    /// itself is judged by the configured policy.
    pub fn update_agreement(
        &self,
        transaction_id: &str,
        status: AgreementStatus,
    ) -> Result<Agreement, Error> {
        const OP: &str = "UpdateAgreement";

        let msp_id = self.host.caller_msp_id().op(OP)?;
        if !self.config.authorized_msps.iter().any(|m| *m == msp_id) {
            return Err(Error::unauthorized(
                OP,
                "not authorized to change agreement state",
            ));
        }

        if !self.host.caller_has_role(Role::Client).op(OP)? {
            return Err(Error::unauthorized(OP, "caller does not hold the client role"));
        }

        let mut agreement = self.get_agreement_record(OP, transaction_id)?;

        if !self.config.transitions.allows(agreement.status, status) {
            return Err(Error::new(
                OP,
                ValidationError::TransitionNotAllowed {
                    from: agreement.status,
                    to: status,
                },
            ));
        }

        agreement.status = status;
        debug!(tx = %transaction_id, %status, "updating agreement");

        let key = keys::state_key(EntityType::Agreement, &[transaction_id]);
        let bytes = codec::encode_record(&agreement).op(OP)?;
        self.host.put(&key, bytes.clone()).op(OP)?;
        self.host.emit_event("UpdateAgreement", bytes);

        Ok(agreement)
    }

    /// Fetches an agreement by transaction id; absence is a not-found
    /// failure.
    pub fn get_agreement(&self, transaction_id: &str) -> Result<Agreement, Error> {
        self.get_agreement_record("GetAgreement", transaction_id)
    }

    pub fn get_agreements(&self) -> Result<Vec<Agreement>, Error> {
        const OP: &str = "GetAgreements";

        let entries = self
            .host
            .iterate_prefix(&keys::prefix(EntityType::Agreement))
            .op(OP)?;

        entries
            .iter()
            .map(|(_, bytes)| codec::decode_record(bytes).op(OP))
            .collect()
    }

    /// Every committed version of an agreement, oldest first: the status
    /// trail of the transaction.
    pub fn agreement_history(
        &self,
        transaction_id: &str,
    ) -> Result<Vec<HistoryRecord<Agreement>>, Error> {
        const OP: &str = "GetAgreementHistory";
        let key = keys::state_key(EntityType::Agreement, &[transaction_id]);
        self.key_history(OP, &key)
    }

    /// Records a fresh agreement for a successful purchase and fires the
    /// product-type-specific event.
    pub(crate) fn new_agreement(
        &self,
        op: &'static str,
        buyer: &User,
        product: &Product,
    ) -> Result<String, Error> {
        let transaction_id = self.host.current_tx_id();

        let agreement = Agreement {
            transaction_id: transaction_id.clone(),
            product_id: product.id.clone(),
            product_type: product.product_type,
            seller: product.owner.clone(),
            buyer: buyer.username.clone(),
            price: product.price,
            status: AgreementStatus::Eligible,
            timestamp: self.host.current_tx_timestamp().seconds,
        };

        let key = keys::state_key(EntityType::Agreement, &[&transaction_id]);
        let bytes = codec::encode_record(&agreement).op(op)?;
        self.host.put(&key, bytes.clone()).op(op)?;

        let event = if product.product_type == ProductType::Analytics {
            "NewAgreementAnalytics"
        } else {
            "NewAgreement"
        };
        self.host.emit_event(event, bytes);

        Ok(transaction_id)
    }

    /// Policy matching behind eligibility; callers decide whether a
    /// violation fails the operation or just answers "no".
    pub(crate) fn validate_policy(
        &self,
        op: &'static str,
        caller: &Caller,
        product: &Product,
        params: &BuyerParams,
    ) -> Result<(), Error> {
        let buyer = caller.require().op(op)?;
        debug!(
            buyer = %buyer.username,
            product = %product.id,
            "matching buyer parameters against policy"
        );

        // Access levels gate everyone, pre-approved or not.
        if !product.data_access_levels.is_empty() {
            let requested = params.data_access_level.as_deref();
            let known = requested
                .map(|level| product.data_access_levels.iter().any(|d| d.level == level))
                .unwrap_or(false);
            if !known {
                return Err(Error::new(
                    op,
                    ValidationError::UnknownDataAccessLevel(params.data_access_level.clone()),
                ));
            }
        }

        // A pre-approved user skips every remaining check.
        if product.policy.approved_users.iter().any(|id| *id == buyer.id) {
            return Ok(());
        }

        let org_user = self.caller_org(op, buyer)?;
        if !org_user.org.active {
            return Err(Error::new(
                op,
                ValidationError::OrganizationInactive(org_user.username),
            ));
        }

        match product.sector {
            Sector::Health => {
                if product.product_type == ProductType::Analytics {
                    check_institution_type(&org_user.org.inst_type, &product.policy.recipient_type)
                        .op(op)?;
                } else {
                    let member_of = buyer.is_member_of.as_deref().unwrap_or_default();
                    if !product.policy.approved_orgs.iter().any(|o| o == member_of) {
                        return Err(Error::new(op, ValidationError::OrgNotPreApproved));
                    }
                    check_purposes(&params.purposes, &product.policy.purposes).op(op)?;
                }
            }
            Sector::Education => {
                check_institution_type(&org_user.org.inst_type, &product.policy.recipient_type)
                    .op(op)?;

                if product.product_type != ProductType::Analytics {
                    check_purposes(&params.purposes, &product.policy.purposes).op(op)?;
                }
            }
        }

        Ok(())
    }

    /// The verified organization the buyer transacts on behalf of.
    fn caller_org(&self, op: &'static str, buyer: &User) -> Result<User, Error> {
        let Some(member_of) = buyer.is_member_of.as_deref().filter(|m| !m.is_empty()) else {
            return Err(Error::new(op, ValidationError::NoOrganization));
        };

        let org_user = self.get_user(op, member_of)?.ok_or_else(|| {
            Error::new(op, ValidationError::OrganizationMissing(member_of.to_string()))
        })?;

        if !org_user.is_org {
            return Err(Error::new(
                op,
                ValidationError::NotAnOrganization(member_of.to_string()),
            ));
        }

        Ok(org_user)
    }

    fn get_agreement_record(
        &self,
        op: &'static str,
        transaction_id: &str,
    ) -> Result<Agreement, Error> {
        let key = keys::state_key(EntityType::Agreement, &[transaction_id]);
        let bytes = self.host.get(&key).op(op)?.ok_or_else(|| {
            Error::not_found(op, format!("agreement {transaction_id} does not exist"))
        })?;

        codec::decode_record(&bytes).op(op)
    }
}

/// The buyer's org institution type must appear in the policy's recipient
/// list.
fn check_institution_type(
    buyer_inst: &str,
    policy_inst: &[String],
) -> Result<(), ValidationError> {
    if !policy_inst.iter().any(|i| i == buyer_inst) {
        return Err(ValidationError::InstitutionTypeMismatch);
    }

    Ok(())
}

/// The buyer's purposes must be a non-strict subset of the policy's: every
/// element present, and no more distinct purposes than the policy declares.
fn check_purposes(buyer: &[String], policy: &[String]) -> Result<(), ValidationError> {
    if buyer.is_empty() {
        return Err(ValidationError::MissingPurposes);
    }

    for purpose in buyer {
        if !policy.contains(purpose) {
            return Err(ValidationError::PurposesMismatch);
        }
    }

    if buyer.len() > policy.len() {
        return Err(ValidationError::TooManyPurposes);
    }

    Ok(())
}
