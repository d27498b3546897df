//! Register → publish → buy walkthrough against the sled-backed host.
//!
//! Run with `cargo run --example marketplace`.

use std::sync::Arc;

use marketplace_ledger::model::{
    BuyerParams, Org, Policy, Product, ProductType, ProtectionType, Sector, UserInput,
};
use marketplace_ledger::{CallerIdentity, Engine, SledHost};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let dir = tempfile::tempdir()?;
    let org_identity = CallerIdentity::generate("LynkeusMSP")?;
    let host = Arc::new(SledHost::open(dir.path().join("marketplace.db"), org_identity)?);
    let engine = Engine::new(Arc::clone(&host));

    // The organization both users transact through.
    let org = host.transact(|| {
        engine.create_user(UserInput {
            username: "general".into(),
            is_org: true,
            org: Org {
                inst_type: "public_institutions".into(),
                org_name: "General Research".into(),
                active: true,
                members: vec![],
            },
            ..UserInput::default()
        })
    })?;
    println!("registered org {}", org.username);

    // The seller.
    host.set_caller(CallerIdentity::generate("LynkeusMSP")?);
    let seller = host.transact(|| {
        engine.create_user(UserInput {
            username: "alice".into(),
            ..UserInput::default()
        })
    })?;
    println!("registered seller {}", seller.username);

    let product_id = host.transact(|| {
        engine.create_product(Product {
            id: String::new(),
            owner: String::new(),
            name: "graduate outcomes".into(),
            desc: "anonymized graduate outcome batches".into(),
            price: 25.0,
            sector: Sector::Education,
            product_type: ProductType::Batch,
            policy: Policy {
                purposes: vec!["marketing".into(), "job_offers".into()],
                protection_type: ProtectionType::Anonymization,
                recipient_type: vec!["public_institutions".into()],
                ..Policy::default()
            },
            timestamp: 0,
            curations: vec![],
            data_access_levels: vec![],
        })
    })?;
    println!("published product {product_id}");

    // The buyer, a member of the organization.
    host.set_caller(CallerIdentity::generate("LynkeusMSP")?);
    let buyer = host.transact(|| {
        engine.create_user(UserInput {
            username: "bobby".into(),
            is_member_of: Some("general".into()),
            is_buyer: true,
            purposes: vec!["marketing".into()],
            ..UserInput::default()
        })
    })?;
    println!("registered buyer {}", buyer.username);

    let tx_id = host.transact(|| {
        engine.buy_product(
            &product_id,
            &BuyerParams {
                purposes: vec!["marketing".into()],
                data_access_level: None,
            },
        )
    })?;

    let agreement = engine.get_agreement(&tx_id)?;
    println!(
        "agreement {}: {} buys {} from {} at {} ({})",
        agreement.transaction_id,
        agreement.buyer,
        agreement.product_id,
        agreement.seller,
        agreement.price,
        agreement.status
    );

    for event in host.take_events() {
        println!("event: {} ({} bytes)", event.name, event.payload.len());
    }

    Ok(())
}
