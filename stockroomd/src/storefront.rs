//! Storefront order intake.
//!
//! Public, unauthenticated order creation keyed by the client's
//! `Idempotency-Key`. A retried or raced request creates at most one order;
//! replays get the original order back, and a key reused with a different
//! body is rejected.
//!
//! # Flow
//!
//! ```text
//! key check → resolve storefront → validate body → fingerprint
//!     → fast-path lookup (replays skip the rate limit)
//!     → rate limit → coordinator (serializable, retried)
//!     → load order (read-only)
//! ```

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use stockroom_domain::{
    Business, CustomerAddress, CustomerUpsert, Email, Fingerprint, IdempotencyKey, Order, OrderId,
    VariantId,
};
use stockroom_exec::{
    AtomicOptions, ExecError, ExecResult, FingerprintBuilder, IdempotencyCoordinator,
    MutationDescriptor, UnitOfWork,
};
use stockroom_store::{Store, TxOptions};

use crate::config::StorefrontConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::throttle::{storefront_order_key, RateLimiter};

/// Most lines accepted in one order
pub const MAX_ITEMS: usize = 50;

/// Longest special request accepted per line
pub const MAX_SPECIAL_REQUEST_LEN: usize = 500;

/// Fingerprint domain tag of storefront orders
const FINGERPRINT_TAG: &str = "storefront_order:v1";

// =============================================================================
// Request / response
// =============================================================================

/// Order request as posted by the storefront.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub customer: OrderCustomer,
    pub shipping_address: ShippingAddress,
    pub items: Vec<OrderLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCustomer {
    pub email: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instagram_username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingAddress {
    pub country_code: String,
    pub state: String,
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip_code: Option<String>,
    pub phone_code: String,
    pub phone_number: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub variant_id: String,
    pub quantity: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_request: Option<String>,
}

/// Order summary returned for both fresh and replayed requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    pub order_id: OrderId,
    pub order_number: String,
    pub status: String,
    pub payment_status: String,
    pub total: Decimal,
    pub currency: String,
}

impl From<&Order> for CreateOrderResponse {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id,
            order_number: order.order_number.clone(),
            status: order.status.to_string(),
            payment_status: order.payment_status.to_string(),
            total: order.total,
            currency: order.currency.clone(),
        }
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Order input after validation, ready for the unit of work.
#[derive(Debug, Clone)]
struct ValidatedOrder {
    customer: CustomerUpsert,
    address: AddressInput,
    quantities: BTreeMap<VariantId, i32>,
    note: Option<String>,
}

#[derive(Debug, Clone)]
struct AddressInput {
    country_code: String,
    state: String,
    city: String,
    street: Option<String>,
    zip_code: Option<String>,
    phone_code: String,
    phone_number: String,
}

fn required(field: &str, value: &str) -> ServiceResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ServiceError::invalid(field, "is required"));
    }
    Ok(value.to_string())
}

fn optional(value: &Option<String>) -> Option<String> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

fn validate(request: &CreateOrderRequest) -> ServiceResult<ValidatedOrder> {
    if request.items.is_empty() {
        return Err(ServiceError::invalid("items", "at least one item is required"));
    }
    if request.items.len() > MAX_ITEMS {
        return Err(ServiceError::invalid(
            "items",
            format!("at most {} items are allowed", MAX_ITEMS),
        ));
    }

    let email = Email::parse(&request.customer.email)
        .map_err(|_| ServiceError::invalid("customer.email", "invalid email"))?;
    let name = required("customer.name", &request.customer.name)?;

    let addr = &request.shipping_address;
    let country_code = required("shippingAddress.countryCode", &addr.country_code)?;
    if country_code.chars().count() != 2 || !country_code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ServiceError::invalid(
            "shippingAddress.countryCode",
            "must be a 2-letter country code",
        ));
    }
    let address = AddressInput {
        country_code: country_code.to_uppercase(),
        state: required("shippingAddress.state", &addr.state)?,
        city: required("shippingAddress.city", &addr.city)?,
        street: optional(&addr.street),
        zip_code: optional(&addr.zip_code),
        phone_code: required("shippingAddress.phoneCode", &addr.phone_code)?,
        phone_number: required("shippingAddress.phoneNumber", &addr.phone_number)?,
    };

    let mut quantities: BTreeMap<VariantId, i32> = BTreeMap::new();
    let mut notes = Vec::new();
    for line in &request.items {
        let raw_id = required("items.variantId", &line.variant_id)?;
        let variant_id: VariantId = raw_id
            .parse()
            .map_err(|_| ServiceError::invalid("items.variantId", format!("invalid id: {}", raw_id)))?;
        if line.quantity <= 0 {
            return Err(ServiceError::invalid("items.quantity", "must be greater than 0"));
        }
        let merged = quantities.entry(variant_id).or_insert(0);
        *merged = merged
            .checked_add(line.quantity)
            .ok_or_else(|| ServiceError::invalid("items.quantity", "is too large"))?;

        if let Some(special) = optional(&line.special_request) {
            if special.chars().count() > MAX_SPECIAL_REQUEST_LEN {
                return Err(ServiceError::invalid(
                    "items.specialRequest",
                    format!("at most {} characters", MAX_SPECIAL_REQUEST_LEN),
                ));
            }
            notes.push(format!("- {}: {}", variant_id, special));
        }
    }

    let note = if notes.is_empty() {
        None
    } else {
        Some(format!("Special requests:\n{}", notes.join("\n")))
    };

    let customer = CustomerUpsert {
        email,
        name,
        phone_code: Some(address.phone_code.clone()),
        phone_number: optional(&request.customer.phone_number),
        instagram_username: optional(&request.customer.instagram_username),
    };

    Ok(ValidatedOrder { customer, address, quantities, note })
}

/// Fingerprint of a request body.
///
/// Key order and whitespace do not matter; any other difference does.
pub fn request_fingerprint(body: &Value) -> Fingerprint {
    FingerprintBuilder::new().field(FINGERPRINT_TAG).json(body).finish()
}

// =============================================================================
// Units of work
// =============================================================================

/// Creates customer, address and pending order; yields the order id
struct PlaceOrder<'a, S> {
    store: &'a S,
    business: &'a Business,
    order: &'a ValidatedOrder,
}

#[async_trait]
impl<'a, S: Store> UnitOfWork<S::Tx> for PlaceOrder<'a, S> {
    type Output = Uuid;

    async fn run(&self, tx: &mut S::Tx) -> ExecResult<Uuid> {
        let business_id = self.business.id;
        let customer = self.store.upsert_by_email(tx, business_id, &self.order.customer).await?;

        let input = &self.order.address;
        let address = CustomerAddress {
            id: Uuid::now_v7(),
            business_id,
            customer_id: customer.id,
            country_code: input.country_code.clone(),
            state: input.state.clone(),
            city: input.city.clone(),
            street: input.street.clone(),
            zip_code: input.zip_code.clone(),
            phone_code: input.phone_code.clone(),
            phone_number: input.phone_number.clone(),
            created_at: chrono::Utc::now(),
        };
        self.store.create_address(tx, &address).await?;

        let variant_ids: Vec<VariantId> = self.order.quantities.keys().copied().collect();
        let variants = self.store.find_variants(tx, business_id, &variant_ids).await?;
        let sequence = self.store.next_order_sequence(tx, business_id).await?;

        let order = Order::new_pending(
            business_id,
            sequence,
            customer.id,
            address.id,
            &self.order.quantities,
            &variants,
            &self.business.currency,
            self.order.note.clone(),
        )?;
        self.store.insert_order(tx, &order).await?;

        debug!(order_id = %order.id, order_number = %order.order_number, "Pending order created");
        Ok(order.id)
    }
}

/// Read-only load of an order referenced by the ledger
struct LoadOrder<'a, S> {
    store: &'a S,
    business_id: Uuid,
    order_id: OrderId,
}

#[async_trait]
impl<'a, S: Store> UnitOfWork<S::Tx> for LoadOrder<'a, S> {
    type Output = Order;

    async fn run(&self, tx: &mut S::Tx) -> ExecResult<Order> {
        self.store.find_order(tx, self.business_id, self.order_id).await?.ok_or_else(|| {
            ExecError::Invariant(format!("ledger references missing order {}", self.order_id))
        })
    }
}

// =============================================================================
// Service
// =============================================================================

/// Storefront order intake service.
pub struct StorefrontService<S> {
    coordinator: IdempotencyCoordinator<S>,
    limiter: Arc<dyn RateLimiter>,
    config: StorefrontConfig,
}

impl<S> Clone for StorefrontService<S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            limiter: Arc::clone(&self.limiter),
            config: self.config.clone(),
        }
    }
}

impl<S: Store> StorefrontService<S> {
    pub fn new(store: Arc<S>, limiter: Arc<dyn RateLimiter>, config: StorefrontConfig) -> Self {
        Self { coordinator: IdempotencyCoordinator::new(store), limiter, config }
    }

    /// Create a pending order from a raw JSON body.
    ///
    /// The fingerprint covers the whole body as sent, including fields this
    /// service ignores.
    pub async fn create_pending_order_json(
        &self,
        storefront_public_id: &str,
        idempotency_key: Option<&str>,
        client_ip: &str,
        body: &[u8],
    ) -> ServiceResult<CreateOrderResponse> {
        let key = IdempotencyKey::parse(idempotency_key)?;
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ServiceError::invalid("body", format!("malformed JSON: {}", e)))?;
        let request: CreateOrderRequest = serde_json::from_value(value.clone())
            .map_err(|e| ServiceError::invalid("body", e.to_string()))?;

        self.create(storefront_public_id, key, client_ip, &request, request_fingerprint(&value))
            .await
    }

    /// Create a pending order.
    ///
    /// # Errors
    ///
    /// - `KeyRequired` / `KeyTooLong` before any other check
    /// - `StorefrontNotFound` / `StorefrontDisabled`
    /// - `InvalidRequest` for a malformed body
    /// - `RateLimited` (never for a replay of a completed request)
    /// - `Exec(ConflictingPayload)` when the key was used with another body
    /// - `Exec(InProgress)` while another request holds the key
    pub async fn create_pending_order(
        &self,
        storefront_public_id: &str,
        idempotency_key: Option<&str>,
        client_ip: &str,
        request: &CreateOrderRequest,
    ) -> ServiceResult<CreateOrderResponse> {
        let key = IdempotencyKey::parse(idempotency_key)?;
        let value = serde_json::to_value(request)
            .map_err(|e| ServiceError::invalid("body", e.to_string()))?;

        self.create(storefront_public_id, key, client_ip, request, request_fingerprint(&value))
            .await
    }

    async fn create(
        &self,
        storefront_public_id: &str,
        key: IdempotencyKey,
        client_ip: &str,
        request: &CreateOrderRequest,
        fingerprint: Fingerprint,
    ) -> ServiceResult<CreateOrderResponse> {
        let business = self.resolve_business(storefront_public_id).await?;
        let order = validate(request)?;
        let descriptor = MutationDescriptor::for_key(business.id, &key, fingerprint);

        // Replays are answered before the rate limit
        if let Some(outcome) = self.coordinator.lookup(&descriptor).await? {
            debug!(business_id = %business.id, key = %key.as_str(), ?outcome, "Fast-path ledger hit");
            let order_id = outcome.into_result(&descriptor)?;
            return self.load_response(business.id, order_id).await;
        }

        let throttle_key = storefront_order_key(business.id, client_ip);
        if !self.limiter.allow(&throttle_key).await {
            warn!(business_id = %business.id, client_ip, "Storefront order rate limited");
            return Err(ServiceError::RateLimited);
        }

        let work = PlaceOrder { store: self.coordinator.store().as_ref(), business: &business, order: &order };
        let options = AtomicOptions::serializable(self.config.max_retries)
            .with_backoff(self.config.retry_backoff);
        let outcome = self.coordinator.run_idempotent(&descriptor, options, &work).await?;

        let order_id = outcome.into_result(&descriptor)?;
        self.load_response(business.id, order_id).await
    }

    async fn resolve_business(&self, storefront_public_id: &str) -> ServiceResult<Business> {
        let store = self.coordinator.store();
        let mut tx = store.begin(TxOptions { read_only: true, ..Default::default() }).await?;
        let found = store.find_by_storefront_id(&mut tx, storefront_public_id.trim()).await;
        store.rollback(tx).await?;

        let business = found?
            .ok_or_else(|| ServiceError::StorefrontNotFound(storefront_public_id.to_string()))?;
        if !business.storefront_enabled {
            return Err(ServiceError::StorefrontDisabled(storefront_public_id.to_string()));
        }
        Ok(business)
    }

    async fn load_response(
        &self,
        business_id: Uuid,
        order_id: OrderId,
    ) -> ServiceResult<CreateOrderResponse> {
        let load = LoadOrder { store: self.coordinator.store().as_ref(), business_id, order_id };
        let order = self.coordinator.executor().execute(AtomicOptions::read_only(), &load).await?;
        Ok(CreateOrderResponse::from(&order))
    }
}
