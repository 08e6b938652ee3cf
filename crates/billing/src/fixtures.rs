//! Stripe wire-format builders for tests
//!
//! Objects carry every field `async-stripe` requires to deserialize them.

use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::webhooks::compute_signature;

const CREATED: i64 = 1_700_000_000;

/// A checkout session in `mode` (`subscription` or `payment`)
pub fn checkout_session(id: &str, mode: &str, payment_status: &str, metadata: Value) -> Value {
    let status = if payment_status == "unpaid" {
        "open"
    } else {
        "complete"
    };

    json!({
        "id": id,
        "object": "checkout.session",
        "automatic_tax": { "enabled": false, "liability": null, "status": null },
        "created": CREATED,
        "currency": "usd",
        "custom_fields": [],
        "custom_text": {
            "after_submit": null,
            "shipping_address": null,
            "submit": null,
            "terms_of_service_acceptance": null
        },
        "customer": null,
        "expires_at": CREATED + 86_400,
        "livemode": false,
        "metadata": metadata,
        "mode": mode,
        "payment_method_types": ["card"],
        "payment_status": payment_status,
        "shipping_options": [],
        "status": status,
        "subscription": null,
        "url": format!("https://checkout.stripe.com/c/pay/{}", id)
    })
}

/// Attach the customer and subscription a completed subscription checkout creates
pub fn with_subscription(mut session: Value, customer: &str, subscription: &str) -> Value {
    session["customer"] = json!(customer);
    session["subscription"] = json!(subscription);
    session
}

pub fn subscription(id: &str, customer: &str, status: &str, metadata: Value) -> Value {
    json!({
        "id": id,
        "object": "subscription",
        "automatic_tax": { "enabled": false, "liability": null },
        "billing_cycle_anchor": CREATED,
        "cancel_at_period_end": false,
        "canceled_at": CREATED + 3_600,
        "collection_method": "charge_automatically",
        "created": CREATED,
        "currency": "usd",
        "current_period_end": CREATED + 2_592_000,
        "current_period_start": CREATED,
        "customer": customer,
        "default_tax_rates": [],
        "discounts": [],
        "ended_at": CREATED + 3_600,
        "items": {
            "object": "list",
            "data": [],
            "has_more": false,
            "total_count": 0,
            "url": format!("/v1/subscription_items?subscription={}", id)
        },
        "livemode": false,
        "metadata": metadata,
        "start_date": CREATED,
        "status": status
    })
}

/// Event envelope around a Stripe object
pub fn event(id: &str, event_type: &str, object: Value) -> Value {
    json!({
        "id": id,
        "object": "event",
        "api_version": "2024-06-20",
        "created": CREATED,
        "data": { "object": object },
        "livemode": false,
        "pending_webhooks": 1,
        "request": { "id": null, "idempotency_key": null },
        "type": event_type
    })
}

pub fn error_body(error_type: &str, message: &str) -> String {
    json!({ "error": { "type": error_type, "message": message } }).to_string()
}

/// `Stripe-Signature` header for `payload`, signed now
pub fn signature_header(secret: &str, payload: &str) -> BillingResult<String> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let signature = compute_signature(secret, now, payload)?;
    Ok(format!("t={},v1={}", now, signature))
}
