//! User registry operations
//!
//! A user is created at most once per host identity and per username; both
//! bindings are checked before anything is written. Deleting a user also
//! deletes every product its inventory salt range could have produced, and
//! aborts if the count of removed products disagrees with the inventory.

use tracing::debug;

use crate::codec;
use crate::engine::Engine;
use crate::error::{Error, OpResult, ValidationError};
use crate::host::{Host, Role};
use crate::identity::{self, Caller};
use crate::keys::{self, EntityType};
use crate::model::{PURPOSES, User, UserInput, UserInventory, validate_values};

impl<H: Host> Engine<H> {
    /// Registers the caller under the chosen username.
    pub fn create_user(&self, input: UserInput) -> Result<User, Error> {
        const OP: &str = "CreateUser";
        debug!(username = %input.username, "creating user");

        if input.username.chars().count() < 4 {
            return Err(Error::new(OP, ValidationError::UsernameTooShort));
        }

        let identity_id = self.host.caller_identity_id().op(OP)?;

        // Both bindings are checked before the first write, so losing either
        // race surfaces as a clean validation failure.
        let index_key = keys::state_key(EntityType::UserId, &[&identity_id]);
        if self.host.get(&index_key).op(OP)?.is_some() {
            return Err(Error::new(
                OP,
                ValidationError::IdentityAlreadyRegistered(identity_id),
            ));
        }

        let user_key = keys::state_key(EntityType::User, &[&input.username]);
        if self.host.get(&user_key).op(OP)?.is_some() {
            return Err(Error::new(
                OP,
                ValidationError::UsernameExists(input.username),
            ));
        }

        let msp_id = self.host.caller_msp_id().op(OP)?;
        let (valid_to, cert_key) = identity::certificate_metadata(&*self.host).op(OP)?;

        let mut user = User {
            id: identity_id,
            username: input.username,
            msp_id,
            is_org: input.is_org,
            is_member_of: input.is_member_of,
            org: input.org,
            is_buyer: input.is_buyer,
            purposes: input.purposes,
            valid_to,
            cert_key,
            active: true,
        };
        validate_user_args(&mut user).op(OP)?;

        self.put_user_record(OP, &user, Some("CreateUser"))?;
        self.write_inventory(OP, &user.username, UserInventory::default())?;
        self.host
            .put(&index_key, user.username.clone().into_bytes())
            .op(OP)?;

        Ok(user)
    }

    /// Overwrites the caller's own record; certificate fields are re-derived
    /// from the current certificate on every update.
    pub fn update_user(&self, input: UserInput) -> Result<User, Error> {
        const OP: &str = "UpdateUser";
        debug!(username = %input.username, "updating user");

        let caller = self.caller(OP)?;
        let current = caller.require().op(OP)?;

        if input.username != current.username {
            return Err(Error::unauthorized(
                OP,
                "username mismatch, caller is not the owner of this account",
            ));
        }
        if input.id != current.id {
            return Err(Error::unauthorized(
                OP,
                "id mismatch, caller is not the owner of this account",
            ));
        }

        let msp_id = self.host.caller_msp_id().op(OP)?;
        let (valid_to, cert_key) = identity::certificate_metadata(&*self.host).op(OP)?;

        let mut user = User {
            id: current.id.clone(),
            username: current.username.clone(),
            msp_id,
            is_org: input.is_org,
            is_member_of: input.is_member_of,
            org: input.org,
            is_buyer: input.is_buyer,
            purposes: input.purposes,
            valid_to,
            cert_key,
            active: true,
        };
        validate_user_args(&mut user).op(OP)?;

        self.put_user_record(OP, &user, Some("UpdateUser"))?;
        Ok(user)
    }

    /// Marks a user of the caller's own MSP inactive. Requires the client
    /// organizational-unit role.
    pub fn inactivate_user(&self, username: &str) -> Result<(), Error> {
        const OP: &str = "InactivateUser";

        let Some(mut user) = self.get_user(OP, username)? else {
            return Err(Error::not_found(OP, format!("user {username} does not exist")));
        };

        if !self.host.caller_has_role(Role::Client).op(OP)? {
            return Err(Error::unauthorized(OP, "caller does not hold the client role"));
        }

        let caller_msp = self.host.caller_msp_id().op(OP)?;
        if user.msp_id != caller_msp {
            return Err(Error::unauthorized(
                OP,
                format!("user {username} belongs to another MSP"),
            ));
        }

        user.active = false;
        self.put_user_record(OP, &user, Some("UpdateUser"))
    }

    /// Removes the caller's account: the user record, every product its
    /// inventory salt range produced, the identity index entry and the
    /// inventory itself.
    pub fn delete_user(&self) -> Result<User, Error> {
        const OP: &str = "DeleteUser";

        let caller = self.caller(OP)?;
        let user = caller.require().op(OP)?.clone();
        debug!(username = %user.username, "deleting user");

        let user_key = keys::state_key(EntityType::User, &[&user.username]);
        self.host.delete(&user_key).op(OP)?;

        let inventory = self
            .read_inventory_record(OP, &user.username)?
            .ok_or_else(|| {
                Error::consistency(OP, format!("missing inventory for {}", user.username))
            })?;

        let mut deleted = 0u64;
        for salt in 0..inventory.salt {
            let product_id = keys::product_id(&user.username, salt);
            let product_key = keys::state_key(EntityType::Product, &[&product_id]);

            if self.host.get(&product_key).op(OP)?.is_some() {
                self.host.delete(&product_key).op(OP)?;
                deleted += 1;
                debug!(product = %product_id, "deleted product");
            }
        }

        // A mismatch means the inventory and the product set drifted apart;
        // abort and leave it visible instead of finishing the delete.
        if deleted != inventory.count {
            return Err(Error::consistency(
                OP,
                format!(
                    "deleted {deleted} products but inventory records {}",
                    inventory.count
                ),
            ));
        }

        let index_key = keys::state_key(EntityType::UserId, &[&user.id]);
        self.host.delete(&index_key).op(OP)?;

        let inventory_key = keys::state_key(EntityType::Inventory, &[&user.username]);
        self.host.delete(&inventory_key).op(OP)?;

        let payload = codec::encode_record(&user).op(OP)?;
        self.host.emit_event("DeleteUser", payload);

        Ok(user)
    }

    /// Fetches a user by username; absence is an empty result, not an error.
    pub fn read_user(&self, username: &str) -> Result<Option<User>, Error> {
        self.get_user("ReadUser", username)
    }

    pub fn get_all_users(&self) -> Result<Vec<User>, Error> {
        const OP: &str = "GetAllUsers";

        let entries = self
            .host
            .iterate_prefix(&keys::prefix(EntityType::User))
            .op(OP)?;

        entries
            .iter()
            .map(|(_, bytes)| codec::decode_record(bytes).op(OP))
            .collect()
    }

    pub fn get_user_inventories(&self) -> Result<Vec<UserInventory>, Error> {
        const OP: &str = "GetUserInventories";

        let entries = self
            .host
            .iterate_prefix(&keys::prefix(EntityType::Inventory))
            .op(OP)?;

        entries
            .iter()
            .map(|(_, bytes)| codec::decode_record(bytes).op(OP))
            .collect()
    }

    /// Fetches a single user's inventory counters.
    pub fn read_inventory(&self, username: &str) -> Result<Option<UserInventory>, Error> {
        self.read_inventory_record("ReadInventory", username)
    }

    pub(crate) fn get_user(
        &self,
        op: &'static str,
        username: &str,
    ) -> Result<Option<User>, Error> {
        let key = keys::state_key(EntityType::User, &[username]);
        match self.host.get(&key).op(op)? {
            Some(bytes) => Ok(Some(codec::decode_record(&bytes).op(op)?)),
            None => Ok(None),
        }
    }

    /// Resolves the caller snapshot and exposes it for flows that gate on
    /// the resolved user outside the engine.
    pub fn resolved_caller(&self) -> Result<Caller, Error> {
        self.caller("ResolveCaller")
    }
}

/// Shared create/update argument validation: buyer purposes against the
/// fixed vocabulary, organization profile only when `is_org` is declared.
fn validate_user_args(user: &mut User) -> Result<(), ValidationError> {
    if user.is_buyer && !user.purposes.is_empty() {
        validate_values(&user.purposes, PURPOSES, "purpose")?;
    }

    if user.is_org {
        user.org.validate()?;
    } else {
        user.org.reset();
    }

    Ok(())
}
