//! Demo data seeding.
//!
//! Creates one business with an enabled storefront, a card payment method and
//! a few variants. Works against any store, so the daemon's in-memory mode and
//! tests share it with `stockroomd db seed`.

use rust_decimal_macros::dec;
use stockroom_domain::{Business, BusinessId, PaymentMethodFee, Variant, VariantId};
use stockroom_store::{BusinessRepository, InventoryRepository, TxOptions};
use tracing::info;

use super::Result;

/// Storefront public id used when none is given
pub const DEMO_STOREFRONT_ID: &str = "demo-shop";

/// Payment method descriptor created by the seed
pub const DEMO_PAYMENT_METHOD: &str = "card";

/// What `seed_demo` created (or found)
#[derive(Debug, Clone)]
pub struct DemoSeed {
    pub business_id: BusinessId,
    pub storefront_public_id: String,
    pub variant_ids: Vec<VariantId>,
    /// False when the storefront already existed and nothing was written
    pub created: bool,
}

/// Seed a demo business.
///
/// Idempotent on the storefront public id: an existing business is returned
/// untouched (its variants are not reported).
pub async fn seed_demo<S>(store: &S, storefront_public_id: Option<&str>) -> Result<DemoSeed>
where
    S: BusinessRepository + InventoryRepository,
{
    let public_id = storefront_public_id.unwrap_or(DEMO_STOREFRONT_ID);
    let mut tx = store.begin(TxOptions::default()).await?;

    if let Some(existing) = store.find_by_storefront_id(&mut tx, public_id).await? {
        info!(business_id = %existing.id, storefront = public_id, "Demo business already exists");
        store.rollback(tx).await?;
        return Ok(DemoSeed {
            business_id: existing.id,
            storefront_public_id: existing.storefront_public_id,
            variant_ids: Vec::new(),
            created: false,
        });
    }

    let business = Business::new("Demo Shop", public_id, "USD");
    store.save_business(&mut tx, &business).await?;

    let card = PaymentMethodFee {
        business_id: business.id,
        descriptor: DEMO_PAYMENT_METHOD.to_string(),
        enabled: true,
        fee_percent: dec!(0.029),
        fee_fixed: dec!(0.30),
    };
    store.save_payment_method(&mut tx, &card).await?;

    let variants = [
        Variant::new(business.id, "Ceramic Mug", "MUG-001", dec!(12.50), "USD"),
        Variant::new(business.id, "Canvas Tote", "TOTE-001", dec!(18.00), "USD"),
        Variant::new(business.id, "Sticker Pack", "STK-001", dec!(4.25), "USD"),
    ];
    for variant in &variants {
        store.save_variant(&mut tx, variant).await?;
    }

    store.commit(tx).await?;

    info!(
        business_id = %business.id,
        storefront = public_id,
        variants = variants.len(),
        "Seeded demo business"
    );

    Ok(DemoSeed {
        business_id: business.id,
        storefront_public_id: business.storefront_public_id,
        variant_ids: variants.iter().map(|v| v.id).collect(),
        created: true,
    })
}
