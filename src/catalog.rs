//! Product catalog operations
//!
//! Create and update share one validation routine; every policy-shape rule
//! runs before the first write. Product ids come out of the owner's
//! inventory salt, so they are deterministic and never reused.

use tracing::debug;

use crate::codec;
use crate::engine::{Engine, HistoryRecord};
use crate::error::{Error, OpResult, ValidationError};
use crate::host::Host;
use crate::identity::Caller;
use crate::keys::{self, EntityType};
use crate::model::{
    AUTOMATED_DECISION_MAKING, AUTOMATED_DECISION_MAKING_CONSEQUENCES, BuyerParams,
    EDUCATIONAL_INSTITUTION_TYPES, HEALTH_INSTITUTION_TYPES, PURPOSES, Product, ProductType,
    Sector, validate_values,
};

impl<H: Host> Engine<H> {
    /// Validates and stores a new product owned by the caller, returning
    /// the assigned product id.
    pub fn create_product(&self, mut product: Product) -> Result<String, Error> {
        const OP: &str = "CreateProduct";

        let caller = self.caller(OP)?;
        self.validate_product(OP, &caller, &mut product, false)?;

        let owner = caller.require().op(OP)?.username.clone();
        let inventory = self
            .read_inventory_record(OP, &owner)?
            .ok_or_else(|| Error::consistency(OP, format!("missing inventory for {owner}")))?;

        product.owner = owner.clone();
        product.id = keys::product_id(&owner, inventory.salt);
        product.timestamp = self.host.current_tx_timestamp().seconds;
        debug!(product = %product.id, %owner, "creating product");

        let bytes = codec::encode_record(&product).op(OP)?;
        let key = keys::state_key(EntityType::Product, &[&product.id]);
        self.host.put(&key, bytes.clone()).op(OP)?;

        self.update_inventory(OP, &owner, |inv| {
            inv.count += 1;
            inv.salt += 1;
        })?;

        self.host.emit_event("CreateProduct", bytes);
        Ok(product.id)
    }

    /// Overwrites an existing product in place. Owner only.
    pub fn update_product(&self, mut product: Product) -> Result<Product, Error> {
        const OP: &str = "UpdateProduct";

        let caller = self.caller(OP)?;
        self.validate_product(OP, &caller, &mut product, true)?;

        product.owner = caller.require().op(OP)?.username.clone();
        debug!(product = %product.id, "updating product");

        let bytes = codec::encode_record(&product).op(OP)?;
        let key = keys::state_key(EntityType::Product, &[&product.id]);
        self.host.put(&key, bytes.clone()).op(OP)?;

        self.host.emit_event("UpdateProduct", bytes);
        Ok(product)
    }

    /// Deletes a product and decrements the owner's inventory count. The
    /// event carries the pre-deletion record.
    pub fn delete_product(&self, product_id: &str) -> Result<Product, Error> {
        const OP: &str = "DeleteProduct";

        let caller = self.caller(OP)?;
        let user = caller.require().op(OP)?;

        let product = self.get_product(OP, product_id)?;
        if product.owner != user.username {
            return Err(Error::unauthorized(
                OP,
                format!(
                    "user {} is not the owner of product {product_id}",
                    user.username
                ),
            ));
        }

        let key = keys::state_key(EntityType::Product, &[product_id]);
        self.host.delete(&key).op(OP)?;

        self.update_inventory(OP, &user.username, |inv| {
            inv.count = inv.count.saturating_sub(1);
        })?;

        let payload = codec::encode_record(&product).op(OP)?;
        self.host.emit_event("DeleteProduct", payload);

        debug!(product = %product_id, "deleted product");
        Ok(product)
    }

    /// Validates buyer, seller and policy, then records the agreement and
    /// returns its transaction id.
    pub fn buy_product(&self, product_id: &str, params: &BuyerParams) -> Result<String, Error> {
        const OP: &str = "BuyProduct";

        let caller = self.caller(OP)?;
        let product = self.get_product(OP, product_id)?;

        let buyer = caller.require().op(OP)?;
        if !buyer.is_buyer {
            return Err(Error::new(OP, ValidationError::NotABuyer));
        }

        let seller = self.get_user(OP, &product.owner)?.ok_or_else(|| {
            Error::not_found(OP, format!("user {} does not exist", product.owner))
        })?;

        // The tx clock, not wall time, decides expiry: the check has to be
        // deterministic under the host's commit protocol.
        let now = self.host.current_tx_timestamp().seconds;
        if seller.valid_to.seconds() < now {
            return Err(Error::new(
                OP,
                ValidationError::SellerCertificateExpired(seller.username),
            ));
        }

        if !seller.active {
            return Err(Error::new(OP, ValidationError::SellerInactive(seller.username)));
        }

        self.validate_policy(OP, &caller, &product, params)?;

        let transaction_id = self.new_agreement(OP, buyer, &product)?;
        debug!(product = %product_id, tx = %transaction_id, "purchase recorded");
        Ok(transaction_id)
    }

    /// Fetches a product by id; a missing product is a not-found failure.
    pub fn read_product(&self, product_id: &str) -> Result<Product, Error> {
        self.get_product("ReadProduct", product_id)
    }

    pub fn get_all_products(&self) -> Result<Vec<Product>, Error> {
        const OP: &str = "GetAllProducts";

        let entries = self
            .host
            .iterate_prefix(&keys::prefix(EntityType::Product))
            .op(OP)?;

        entries
            .iter()
            .map(|(_, bytes)| codec::decode_record(bytes).op(OP))
            .collect()
    }

    pub fn product_exists(&self, product_id: &str) -> Result<bool, Error> {
        const OP: &str = "ProductExists";
        let key = keys::state_key(EntityType::Product, &[product_id]);
        Ok(self.host.get(&key).op(OP)?.is_some())
    }

    /// Whether the resolved caller owns the product.
    pub fn is_owner(&self, product_id: &str) -> Result<bool, Error> {
        const OP: &str = "IsOwner";

        let caller = self.caller(OP)?;
        let user = caller.require().op(OP)?;
        let product = self.get_product(OP, product_id)?;

        Ok(product.owner == user.username)
    }

    /// Every committed version of the product record, oldest first.
    pub fn product_history(&self, product_id: &str) -> Result<Vec<HistoryRecord<Product>>, Error> {
        const OP: &str = "GetProductHistory";
        let key = keys::state_key(EntityType::Product, &[product_id]);
        self.key_history(OP, &key)
    }

    pub(crate) fn get_product(&self, op: &'static str, product_id: &str) -> Result<Product, Error> {
        let key = keys::state_key(EntityType::Product, &[product_id]);
        let bytes = self
            .host
            .get(&key)
            .op(op)?
            .ok_or_else(|| Error::not_found(op, format!("product {product_id} does not exist")))?;

        codec::decode_record(&bytes).op(op)
    }

    /// The shared create/update validation routine. Mutates the product:
    /// pre-approved usernames are rewritten to identity ids.
    fn validate_product(
        &self,
        op: &'static str,
        caller: &Caller,
        product: &mut Product,
        update: bool,
    ) -> Result<(), Error> {
        let user = caller.require().op(op)?;

        if update {
            let current = self.get_product(op, &product.id)?;
            if current.owner != user.username {
                return Err(Error::unauthorized(
                    op,
                    "caller is not the owner of this product",
                ));
            }
        }

        let policy = &product.policy;

        if product.price < 0.0 {
            return Err(Error::new(op, ValidationError::NegativePrice));
        }

        if policy.incl_personal_info && !policy.has_consent {
            return Err(Error::new(op, ValidationError::MissingConsent));
        }

        if product.product_type != ProductType::Analytics {
            if policy.purposes.is_empty() {
                return Err(Error::new(op, ValidationError::MissingPurposes));
            }
            validate_values(&policy.purposes, PURPOSES, "purpose").op(op)?;
        }

        // Education sells through institution matching, never through org
        // pre-approval; Health batch/stream products require it.
        if product.sector == Sector::Education && !policy.approved_orgs.is_empty() {
            return Err(Error::new(
                op,
                ValidationError::PreApprovedOrgsNotAllowed(product.sector.to_string()),
            ));
        }

        if product.sector == Sector::Health
            && policy.approved_orgs.is_empty()
            && product.product_type != ProductType::Analytics
        {
            return Err(Error::new(
                op,
                ValidationError::MissingPreApprovedOrgs(product.product_type.to_string()),
            ));
        }

        if (product.sector == Sector::Education || product.product_type == ProductType::Analytics)
            && policy.recipient_type.is_empty()
        {
            return Err(Error::new(op, ValidationError::MissingRecipientTypes));
        }

        if product.sector == Sector::Health && product.product_type == ProductType::Analytics {
            validate_values(
                &policy.recipient_type,
                HEALTH_INSTITUTION_TYPES,
                "institution type",
            )
            .op(op)?;
        } else if product.sector == Sector::Education {
            validate_values(
                &policy.recipient_type,
                EDUCATIONAL_INSTITUTION_TYPES,
                "institution type",
            )
            .op(op)?;
        }

        if product.product_type != ProductType::Analytics
            && policy.purposes.iter().any(|p| p == AUTOMATED_DECISION_MAKING)
        {
            if policy.automated_decision_making.is_empty() {
                return Err(Error::new(op, ValidationError::MissingAdmConsequences));
            }
            validate_values(
                &policy.automated_decision_making,
                AUTOMATED_DECISION_MAKING_CONSEQUENCES,
                "consequence",
            )
            .op(op)?;
        }

        // Curated products chain onto an existing base product.
        if let Some(base) = product.curations.last() {
            let key = keys::state_key(EntityType::Product, &[base]);
            if self.host.get(&key).op(op)?.is_none() {
                return Err(Error::new(
                    op,
                    ValidationError::CurationBaseMissing(base.clone()),
                ));
            }
        }

        // Pre-approved usernames become identity ids; unknown usernames are
        // skipped rather than fatal.
        let mut resolved = Vec::with_capacity(product.policy.approved_users.len());
        for username in &product.policy.approved_users {
            if let Some(approved) = self.get_user(op, username)? {
                resolved.push(approved.id);
            }
        }
        product.policy.approved_users = resolved;

        Ok(())
    }
}
