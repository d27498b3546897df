//! End-to-end flows against the sled-backed host: registration, product
//! lifecycle, purchases, deletion consistency and record migration.

use std::sync::Arc;

use anyhow::Context;
use tempfile::tempdir;

use marketplace_ledger::codec::{self, UserRecordV1};
use marketplace_ledger::keys::{self, EntityType};
use marketplace_ledger::model::{
    AgreementStatus, BuyerParams, Org, Policy, Product, ProductType, ProtectionType, Sector,
    TimeStamp, UserInput,
};
use marketplace_ledger::{CallerIdentity, Engine, ErrorKind, Host, SledHost};

// Sled uses file-based locking, so every test opens its own database under
// a temp dir and drives operations through the host's begin/commit cycle
// via `transact`.
fn setup(name: &str) -> anyhow::Result<(tempfile::TempDir, Arc<SledHost>, Engine<SledHost>)> {
    let dir = tempdir()?;
    let caller = CallerIdentity::generate("LynkeusMSP")?;
    let host = Arc::new(SledHost::open(dir.path().join(name), caller)?);
    let engine = Engine::new(Arc::clone(&host));
    Ok((dir, host, engine))
}

fn register(
    host: &SledHost,
    engine: &Engine<SledHost>,
    msp: &str,
    input: UserInput,
) -> anyhow::Result<CallerIdentity> {
    let identity = CallerIdentity::generate(msp)?;
    host.set_caller(identity.clone());
    host.transact(|| engine.create_user(input))?;
    Ok(identity)
}

fn education_product() -> Product {
    Product {
        id: String::new(),
        owner: String::new(),
        name: "graduate outcomes".into(),
        desc: String::new(),
        price: 25.0,
        sector: Sector::Education,
        product_type: ProductType::Batch,
        policy: Policy {
            purposes: vec!["marketing".into()],
            protection_type: ProtectionType::Anonymization,
            recipient_type: vec!["public_institutions".into()],
            ..Policy::default()
        },
        timestamp: 0,
        curations: vec![],
        data_access_levels: vec![],
    }
}

fn org_input(username: &str, inst_type: &str) -> UserInput {
    UserInput {
        username: username.into(),
        is_org: true,
        org: Org {
            inst_type: inst_type.into(),
            org_name: "General Research".into(),
            active: true,
            members: vec![],
        },
        ..UserInput::default()
    }
}

#[test]
fn create_user_starts_active_with_empty_inventory() -> anyhow::Result<()> {
    let (_dir, host, engine) = setup("create_user.db")?;

    register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "alice".into(),
            ..UserInput::default()
        },
    )?;

    let user = engine.read_user("alice")?.context("alice should exist")?;
    assert!(user.active);
    assert_eq!(user.msp_id, "LynkeusMSP");
    assert!(!user.cert_key.is_empty());

    let inventory = engine.read_inventory("alice")?.context("inventory")?;
    assert_eq!((inventory.count, inventory.salt), (0, 0));

    let events = host.take_events();
    assert!(events.iter().any(|e| e.name == "CreateUser"));

    Ok(())
}

#[test]
fn create_user_rejects_short_and_duplicate_bindings() -> anyhow::Result<()> {
    let (_dir, host, engine) = setup("create_user_rejects.db")?;

    let short = host.transact(|| {
        engine.create_user(UserInput {
            username: "bob".into(),
            ..UserInput::default()
        })
    });
    assert!(matches!(
        short.unwrap_err().kind(),
        ErrorKind::Validation(_)
    ));

    register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "alice".into(),
            ..UserInput::default()
        },
    )?;

    // Same identity, different username.
    let rebind = host.transact(|| {
        engine.create_user(UserInput {
            username: "alice2".into(),
            ..UserInput::default()
        })
    });
    assert!(matches!(
        rebind.unwrap_err().kind(),
        ErrorKind::Validation(_)
    ));

    // Fresh identity, taken username.
    host.set_caller(CallerIdentity::generate("LynkeusMSP")?);
    let taken = host.transact(|| {
        engine.create_user(UserInput {
            username: "alice".into(),
            ..UserInput::default()
        })
    });
    assert!(matches!(
        taken.unwrap_err().kind(),
        ErrorKind::Validation(_)
    ));

    // A failed create leaves nothing behind.
    assert!(engine.read_user("alice2")?.is_none());

    Ok(())
}

#[test]
fn product_ids_are_deterministic_and_salt_increments() -> anyhow::Result<()> {
    let (_dir, host, engine) = setup("product_ids.db")?;

    register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "alice".into(),
            ..UserInput::default()
        },
    )?;

    let first = host.transact(|| engine.create_product(education_product()))?;
    assert_eq!(first, keys::product_id("alice", 0));

    let second = host.transact(|| engine.create_product(education_product()))?;
    assert_eq!(second, keys::product_id("alice", 1));
    assert_ne!(first, second);

    let inventory = engine.read_inventory("alice")?.context("inventory")?;
    assert_eq!((inventory.count, inventory.salt), (2, 2));

    let stored = engine.read_product(&first)?;
    assert_eq!(stored.owner, "alice");
    assert_eq!(stored.name, "graduate outcomes");

    Ok(())
}

#[test]
fn buying_creates_an_eligible_agreement() -> anyhow::Result<()> {
    let (_dir, host, engine) = setup("buy.db")?;

    register(
        &host,
        &engine,
        "LynkeusMSP",
        org_input("general", "public_institutions"),
    )?;

    register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "alice".into(),
            ..UserInput::default()
        },
    )?;
    let product_id = host.transact(|| engine.create_product(education_product()))?;

    register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "bobby".into(),
            is_member_of: Some("general".into()),
            is_buyer: true,
            purposes: vec!["marketing".into()],
            ..UserInput::default()
        },
    )?;

    let params = BuyerParams {
        purposes: vec!["marketing".into()],
        data_access_level: None,
    };
    let tx_id = host.transact(|| engine.buy_product(&product_id, &params))?;

    let agreement = engine.get_agreement(&tx_id)?;
    assert_eq!(agreement.status, AgreementStatus::Eligible);
    assert_eq!(agreement.buyer, "bobby");
    assert_eq!(agreement.seller, "alice");
    assert_eq!(agreement.product_id, product_id);
    assert_eq!(agreement.price, 25.0);

    let events = host.take_events();
    assert!(events.iter().any(|e| e.name == "NewAgreement"));

    Ok(())
}

#[test]
fn superset_purposes_fail_eligibility() -> anyhow::Result<()> {
    let (_dir, host, engine) = setup("superset.db")?;

    register(
        &host,
        &engine,
        "LynkeusMSP",
        org_input("general", "public_institutions"),
    )?;
    register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "alice".into(),
            ..UserInput::default()
        },
    )?;
    let product_id = host.transact(|| engine.create_product(education_product()))?;

    register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "bobby".into(),
            is_member_of: Some("general".into()),
            is_buyer: true,
            purposes: vec!["marketing".into(), "job_offers".into()],
            ..UserInput::default()
        },
    )?;

    let params = BuyerParams {
        purposes: vec!["marketing".into(), "job_offers".into()],
        data_access_level: None,
    };
    let err = host
        .transact(|| engine.buy_product(&product_id, &params))
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Validation(_)));

    // No agreement was recorded.
    assert!(engine.get_agreements()?.is_empty());

    Ok(())
}

#[test]
fn non_buyers_cannot_purchase() -> anyhow::Result<()> {
    let (_dir, host, engine) = setup("non_buyer.db")?;

    register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "alice".into(),
            ..UserInput::default()
        },
    )?;
    let product_id = host.transact(|| engine.create_product(education_product()))?;

    register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "carol".into(),
            is_buyer: false,
            ..UserInput::default()
        },
    )?;

    let err = host
        .transact(|| engine.buy_product(&product_id, &BuyerParams::default()))
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Validation(_)));

    Ok(())
}

#[test]
fn expired_seller_certificates_block_purchases() -> anyhow::Result<()> {
    let (_dir, host, engine) = setup("expired.db")?;

    register(
        &host,
        &engine,
        "LynkeusMSP",
        org_input("general", "public_institutions"),
    )?;

    // Seller registers with an already-expired certificate.
    let expired = CallerIdentity::generate("LynkeusMSP")?
        .with_not_after(TimeStamp::new_with(2020, 1, 1, 0, 0, 0));
    host.set_caller(expired);
    host.transact(|| {
        engine.create_user(UserInput {
            username: "alice".into(),
            ..UserInput::default()
        })
    })?;
    let product_id = host.transact(|| engine.create_product(education_product()))?;

    register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "bobby".into(),
            is_member_of: Some("general".into()),
            is_buyer: true,
            ..UserInput::default()
        },
    )?;

    let params = BuyerParams {
        purposes: vec!["marketing".into()],
        data_access_level: None,
    };
    let err = host
        .transact(|| engine.buy_product(&product_id, &params))
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Validation(_)));

    Ok(())
}

#[test]
fn owners_update_and_delete_their_products() -> anyhow::Result<()> {
    let (_dir, host, engine) = setup("product_lifecycle.db")?;

    let alice = register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "alice".into(),
            ..UserInput::default()
        },
    )?;
    let product_id = host.transact(|| engine.create_product(education_product()))?;

    let mut update = engine.read_product(&product_id)?;
    update.name = "graduate outcomes v2".into();
    host.transact(|| engine.update_product(update.clone()))?;
    assert_eq!(engine.read_product(&product_id)?.name, "graduate outcomes v2");

    // A stranger can neither update nor delete.
    register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "mallory".into(),
            ..UserInput::default()
        },
    )?;
    let mut foreign = engine.read_product(&product_id)?;
    foreign.name = "hijacked".into();
    let err = host
        .transact(|| engine.update_product(foreign.clone()))
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Unauthorized(_)));

    let err = host
        .transact(|| engine.delete_product(&product_id))
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Unauthorized(_)));

    // The owner can.
    host.set_caller(alice);
    host.transact(|| engine.delete_product(&product_id))?;
    let inventory = engine.read_inventory("alice")?.context("inventory")?;
    assert_eq!((inventory.count, inventory.salt), (0, 1));

    // The salt never rewinds, so the next product gets a fresh id.
    let next = host.transact(|| engine.create_product(education_product()))?;
    assert_eq!(next, keys::product_id("alice", 1));
    assert_ne!(next, product_id);

    let missing = host.transact(|| engine.delete_product(&product_id));
    assert!(matches!(
        missing.unwrap_err().kind(),
        ErrorKind::NotFound(_)
    ));

    Ok(())
}

#[test]
fn deleting_a_user_removes_exactly_the_recorded_products() -> anyhow::Result<()> {
    let (_dir, host, engine) = setup("delete_user.db")?;

    register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "alice".into(),
            ..UserInput::default()
        },
    )?;
    let first = host.transact(|| engine.create_product(education_product()))?;
    let second = host.transact(|| engine.create_product(education_product()))?;
    host.transact(|| engine.delete_product(&first))?;

    let deleted = host.transact(|| engine.delete_user())?;
    assert_eq!(deleted.username, "alice");

    assert!(engine.read_user("alice")?.is_none());
    assert!(engine.read_inventory("alice")?.is_none());
    assert!(engine.read_product(&second).is_err());

    let events = host.take_events();
    assert!(events.iter().any(|e| e.name == "DeleteUser"));

    Ok(())
}

#[test]
fn inventory_drift_aborts_user_deletion() -> anyhow::Result<()> {
    let (_dir, host, engine) = setup("drift.db")?;

    register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "alice".into(),
            ..UserInput::default()
        },
    )?;
    let product_id = host.transact(|| engine.create_product(education_product()))?;

    // Break the invariant behind the engine's back: remove the product
    // without touching the inventory counter.
    host.begin_operation();
    host.delete(&keys::state_key(EntityType::Product, &[&product_id]))?;
    host.commit_operation()?;

    let err = host.transact(|| engine.delete_user()).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Consistency(_)));

    // The abort kept the user, index and inventory records intact.
    assert!(engine.read_user("alice")?.is_some());
    assert!(engine.read_inventory("alice")?.is_some());
    host.transact(|| engine.update_user(engine.read_user("alice")?.map(user_to_input).unwrap()))?;

    Ok(())
}

fn user_to_input(user: marketplace_ledger::model::User) -> UserInput {
    UserInput {
        id: user.id,
        username: user.username,
        is_org: user.is_org,
        is_member_of: user.is_member_of,
        org: user.org,
        is_buyer: user.is_buyer,
        purposes: user.purposes,
    }
}

#[test]
fn inactivation_requires_role_and_same_msp() -> anyhow::Result<()> {
    let (_dir, host, engine) = setup("inactivate.db")?;

    register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "alice".into(),
            ..UserInput::default()
        },
    )?;

    // Wrong MSP.
    host.set_caller(CallerIdentity::generate("TexMSP")?);
    let err = host
        .transact(|| engine.inactivate_user("alice"))
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Unauthorized(_)));

    // Right MSP, missing client role.
    host.set_caller(CallerIdentity::generate("LynkeusMSP")?.with_roles(vec![]));
    let err = host
        .transact(|| engine.inactivate_user("alice"))
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Unauthorized(_)));

    // Right MSP, client role.
    host.set_caller(CallerIdentity::generate("LynkeusMSP")?);
    host.transact(|| engine.inactivate_user("alice"))?;
    assert!(!engine.read_user("alice")?.context("alice")?.active);

    Ok(())
}

#[test]
fn inactive_sellers_cannot_be_bought_from() -> anyhow::Result<()> {
    let (_dir, host, engine) = setup("inactive_seller.db")?;

    register(
        &host,
        &engine,
        "LynkeusMSP",
        org_input("general", "public_institutions"),
    )?;
    register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "alice".into(),
            ..UserInput::default()
        },
    )?;
    let product_id = host.transact(|| engine.create_product(education_product()))?;

    host.set_caller(CallerIdentity::generate("LynkeusMSP")?);
    host.transact(|| engine.inactivate_user("alice"))?;

    register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "bobby".into(),
            is_member_of: Some("general".into()),
            is_buyer: true,
            ..UserInput::default()
        },
    )?;

    let params = BuyerParams {
        purposes: vec!["marketing".into()],
        data_access_level: None,
    };
    let err = host
        .transact(|| engine.buy_product(&product_id, &params))
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Validation(_)));

    Ok(())
}

#[test]
fn update_user_is_owner_only_and_rederives_certificate() -> anyhow::Result<()> {
    let (_dir, host, engine) = setup("update_user.db")?;

    let alice = register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "alice".into(),
            ..UserInput::default()
        },
    )?;
    let created = engine.read_user("alice")?.context("alice")?;

    // Unregistered caller.
    host.set_caller(CallerIdentity::generate("LynkeusMSP")?);
    let err = host
        .transact(|| engine.update_user(user_to_input(created.clone())))
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Validation(_)));

    // Owner, but the input names someone else.
    host.set_caller(alice.clone());
    let mut wrong = user_to_input(created.clone());
    wrong.username = "malice".into();
    let err = host
        .transact(|| engine.update_user(wrong))
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Unauthorized(_)));

    // Owner updating their own record under a renewed certificate.
    let renewed = alice.with_not_after(TimeStamp::new_with(2033, 1, 1, 0, 0, 0));
    host.set_caller(renewed);
    let mut input = user_to_input(created.clone());
    input.is_buyer = true;
    input.purposes = vec!["marketing".into()];
    let updated = host.transact(|| engine.update_user(input))?;

    assert!(updated.is_buyer);
    assert_eq!(updated.valid_to, TimeStamp::new_with(2033, 1, 1, 0, 0, 0));
    assert_eq!(updated.cert_key, created.cert_key);

    Ok(())
}

#[test]
fn agreement_status_moves_under_the_configured_policy() -> anyhow::Result<()> {
    let (_dir, host, engine) = setup("agreement_status.db")?;

    register(
        &host,
        &engine,
        "LynkeusMSP",
        org_input("general", "public_institutions"),
    )?;
    register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "alice".into(),
            ..UserInput::default()
        },
    )?;
    let product_id = host.transact(|| engine.create_product(education_product()))?;

    register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "bobby".into(),
            is_member_of: Some("general".into()),
            is_buyer: true,
            ..UserInput::default()
        },
    )?;
    let params = BuyerParams {
        purposes: vec!["marketing".into()],
        data_access_level: None,
    };
    let tx_id = host.transact(|| engine.buy_product(&product_id, &params))?;

    // An MSP outside the allow-list cannot move the status.
    host.set_caller(CallerIdentity::generate("Org9MSP")?);
    let err = host
        .transact(|| engine.update_agreement(&tx_id, AgreementStatus::Paid))
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Unauthorized(_)));

    // An authorized MSP without the client role cannot either.
    host.set_caller(CallerIdentity::generate("TexMSP")?.with_roles(vec![]));
    let err = host
        .transact(|| engine.update_agreement(&tx_id, AgreementStatus::Paid))
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Unauthorized(_)));

    host.set_caller(CallerIdentity::generate("TexMSP")?);
    host.transact(|| engine.update_agreement(&tx_id, AgreementStatus::Paid))?;
    host.transact(|| engine.update_agreement(&tx_id, AgreementStatus::Access))?;
    assert_eq!(engine.get_agreement(&tx_id)?.status, AgreementStatus::Access);

    let history = engine.agreement_history(&tx_id)?;
    let statuses: Vec<_> = history
        .iter()
        .filter_map(|h| h.record.as_ref().map(|a| a.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            AgreementStatus::Eligible,
            AgreementStatus::Paid,
            AgreementStatus::Access
        ]
    );

    Ok(())
}

#[test]
fn product_history_replays_updates_and_deletes() -> anyhow::Result<()> {
    let (_dir, host, engine) = setup("product_history.db")?;

    register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "alice".into(),
            ..UserInput::default()
        },
    )?;
    let product_id = host.transact(|| engine.create_product(education_product()))?;

    let mut update = engine.read_product(&product_id)?;
    update.price = 30.0;
    host.transact(|| engine.update_product(update))?;
    host.transact(|| engine.delete_product(&product_id))?;

    let history = engine.product_history(&product_id)?;
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].record.as_ref().map(|p| p.price), Some(25.0));
    assert_eq!(history[1].record.as_ref().map(|p| p.price), Some(30.0));
    assert!(history[2].is_delete);

    Ok(())
}

#[test]
fn legacy_records_migrate_on_read() -> anyhow::Result<()> {
    let (_dir, host, engine) = setup("migration.db")?;

    let v1 = UserRecordV1 {
        id: "id_old".into(),
        username: "olduser".into(),
        msp_id: "TexMSP".into(),
        is_org: false,
        is_member_of: None,
        org: Org::default(),
        is_buyer: false,
        purposes: vec![],
        valid_to: TimeStamp::new_with(2027, 1, 1, 0, 0, 0),
    };
    let bytes = codec::encode_versioned(1, &v1)?;

    host.begin_operation();
    host.put(&keys::state_key(EntityType::User, &["olduser"]), bytes)?;
    host.commit_operation()?;

    let user = engine.read_user("olduser")?.context("olduser")?;
    assert_eq!(user.id, "id_old");
    assert_eq!(user.cert_key, "");
    assert!(user.active);

    Ok(())
}

#[test]
fn curated_products_require_an_existing_base() -> anyhow::Result<()> {
    let (_dir, host, engine) = setup("curations.db")?;

    register(
        &host,
        &engine,
        "LynkeusMSP",
        UserInput {
            username: "alice".into(),
            ..UserInput::default()
        },
    )?;
    let base = host.transact(|| engine.create_product(education_product()))?;

    let mut dangling = education_product();
    dangling.curations = vec!["0000000000000000".into()];
    let err = host
        .transact(|| engine.create_product(dangling))
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Validation(_)));

    let mut curated = education_product();
    curated.curations = vec![base.clone()];
    let curated_id = host.transact(|| engine.create_product(curated))?;
    assert_eq!(engine.read_product(&curated_id)?.curations, vec![base]);

    Ok(())
}
