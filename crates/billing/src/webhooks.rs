//! Payment provider webhook handling
//!
//! Verifies Stripe-signed event payloads and reconciles checkout and
//! cancellation events into ledger and entitlement state. Each event id is
//! claimed inside the same transaction that applies its effects, so a
//! redelivered event is a no-op and a failed one leaves no claim behind.

use std::fmt::Display;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{
    CheckoutSession, CheckoutSessionPaymentStatus, Event, EventObject, EventType, Expandable,
    Object,
};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{
    CreditPurchase, EventClaim, LedgerStore, ReconcileOutcome, SubscriptionActivation,
};
use crate::plans::{BillingCycle, CreditPack, Plan};
use crate::retry::retry_on_conflict;

type HmacSha256 = Hmac<Sha256>;

/// Default allowed clock skew between the provider's signature timestamp and now
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Checkout session metadata keys
pub mod metadata_keys {
    pub const ACCOUNT_ID: &str = "account_id";
    pub const CHECKOUT_TYPE: &str = "checkout_type";
    pub const PLAN: &str = "plan";
    pub const BILLING_CYCLE: &str = "billing_cycle";
    pub const CREDIT_PACK: &str = "credit_pack";

    pub const TYPE_SUBSCRIPTION: &str = "subscription";
    pub const TYPE_CREDITS: &str = "credits";
}

/// A provider event reduced to what the ledger needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEvent {
    CheckoutCompleted(SubscriptionActivation),
    CreditsPurchased(CreditPurchase),
    SubscriptionDeleted { provider_subscription_id: String },
}

/// Wire name of an event type, e.g. `checkout.session.completed`
pub fn event_type_name(event_type: EventType) -> String {
    // Display renders the JSON string, quotes included
    event_type.to_string().trim_matches('"').to_string()
}

fn expandable_id<T>(value: &Expandable<T>) -> String
where
    T: Object,
    T::Id: Display,
{
    match value {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(object) => object.id().to_string(),
    }
}

fn unexpected_object(event: &Event, expected: &str) -> BillingError {
    BillingError::InvalidInput(format!(
        "Event {} ({}) does not carry a {}",
        event.id,
        event_type_name(event.type_),
        expected
    ))
}

/// Hex HMAC-SHA256 over `"{timestamp}.{payload}"`
pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Parse `t=<unix>,v1=<hex>[,v1=<hex>...]`
fn parse_signature_header(header: &str) -> Option<(i64, Vec<String>)> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => signatures.push(value.to_string()),
            _ => {}
        }
    }

    match (timestamp, signatures.is_empty()) {
        (Some(t), false) => Some((t, signatures)),
        _ => None,
    }
}

pub struct WebhookHandler {
    store: Arc<dyn LedgerStore>,
    webhook_secret: String,
    tolerance_secs: i64,
}

impl WebhookHandler {
    pub fn new(store: Arc<dyn LedgerStore>, webhook_secret: impl Into<String>) -> Self {
        Self {
            store,
            webhook_secret: webhook_secret.into(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    pub fn with_tolerance(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    /// Verify and parse a signed provider event
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        self.verify_event_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    pub(crate) fn verify_event_at(
        &self,
        payload: &str,
        signature: &str,
        now: i64,
    ) -> BillingResult<Event> {
        if self.webhook_secret.is_empty() {
            tracing::error!("Webhook secret not configured, rejecting event");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let (timestamp, candidates) = parse_signature_header(signature).ok_or_else(|| {
            tracing::warn!("Malformed webhook signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        if now.abs_diff(timestamp) > self.tolerance_secs.unsigned_abs() {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                tolerance_secs = self.tolerance_secs,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let expected = compute_signature(&self.webhook_secret, timestamp, payload)
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;

        let matched = candidates
            .iter()
            .any(|candidate| bool::from(candidate.as_bytes().ct_eq(expected.as_bytes())));

        if !matched {
            tracing::warn!(payload_len = payload.len(), "Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        serde_json::from_str(payload).map_err(|e| {
            tracing::warn!(error = %e, "Signed webhook payload is not a valid event");
            BillingError::InvalidInput(format!("Malformed event payload: {}", e))
        })
    }

    /// Reduce a provider event to a ledger change. `None` means the event
    /// carries nothing for us and should be acknowledged as-is.
    pub fn parse_event(event: &Event) -> BillingResult<Option<ReconcileEvent>> {
        match event.type_ {
            EventType::CheckoutSessionCompleted
            | EventType::CheckoutSessionAsyncPaymentSucceeded => match &event.data.object {
                EventObject::CheckoutSession(session) => Self::parse_checkout(event, session),
                _ => Err(unexpected_object(event, "checkout session")),
            },
            EventType::CustomerSubscriptionDeleted => match &event.data.object {
                EventObject::Subscription(subscription) => {
                    Ok(Some(ReconcileEvent::SubscriptionDeleted {
                        provider_subscription_id: subscription.id.to_string(),
                    }))
                }
                _ => Err(unexpected_object(event, "subscription")),
            },
            _ => Ok(None),
        }
    }

    fn parse_checkout(
        event: &Event,
        session: &CheckoutSession,
    ) -> BillingResult<Option<ReconcileEvent>> {
        use self::metadata_keys::*;

        // Delayed payment methods settle later via async_payment_succeeded
        if session.payment_status == CheckoutSessionPaymentStatus::Unpaid {
            tracing::info!(
                event_id = %event.id,
                session_id = %session.id,
                "Checkout completed without payment yet, nothing to grant"
            );
            return Ok(None);
        }

        let metadata = session.metadata.clone().unwrap_or_default();

        let Some(account_id) = metadata.get(ACCOUNT_ID) else {
            tracing::warn!(
                event_id = %event.id,
                session_id = %session.id,
                "Checkout session has no account_id metadata"
            );
            return Ok(None);
        };
        let account_id = Uuid::parse_str(account_id)
            .map_err(|e| BillingError::InvalidInput(format!("Invalid account_id: {}", e)))?;

        let metadata_value = |key: &str| -> BillingResult<&str> {
            metadata
                .get(key)
                .map(String::as_str)
                .ok_or_else(|| BillingError::InvalidInput(format!("Missing {} metadata", key)))
        };

        match metadata.get(CHECKOUT_TYPE).map(String::as_str) {
            Some(TYPE_CREDITS) => {
                let pack: CreditPack = metadata_value(CREDIT_PACK)?.parse()?;
                Ok(Some(ReconcileEvent::CreditsPurchased(CreditPurchase {
                    account_id,
                    pack,
                })))
            }
            Some(TYPE_SUBSCRIPTION) | None => {
                let plan: Plan = metadata_value(PLAN)?.parse()?;
                let billing_cycle: BillingCycle = metadata_value(BILLING_CYCLE)?.parse()?;
                Ok(Some(ReconcileEvent::CheckoutCompleted(
                    SubscriptionActivation {
                        account_id,
                        plan,
                        billing_cycle,
                        provider_customer_id: session.customer.as_ref().map(expandable_id),
                        provider_subscription_id: session
                            .subscription
                            .as_ref()
                            .map(expandable_id),
                    },
                )))
            }
            Some(other) => Err(BillingError::InvalidInput(format!(
                "Unknown checkout_type '{}'",
                other
            ))),
        }
    }

    /// Apply a reconciled event exactly once per event id
    pub async fn apply(
        &self,
        claim: &EventClaim,
        event: &ReconcileEvent,
    ) -> BillingResult<ReconcileOutcome> {
        let outcome = retry_on_conflict("reconcile", || self.apply_once(claim, event)).await?;

        tracing::info!(
            event_id = %claim.event_id,
            event_type = %claim.event_type,
            outcome = ?outcome,
            "Webhook event reconciled"
        );

        Ok(outcome)
    }

    async fn apply_once(
        &self,
        claim: &EventClaim,
        event: &ReconcileEvent,
    ) -> BillingResult<ReconcileOutcome> {
        match event {
            ReconcileEvent::CheckoutCompleted(activation) => {
                let outcome = self.store.activate_subscription(claim, activation).await?;
                if outcome == ReconcileOutcome::Applied {
                    tracing::info!(
                        account_id = %activation.account_id,
                        plan = %activation.plan,
                        billing_cycle = %activation.billing_cycle,
                        bonus = activation.plan.terms(activation.billing_cycle).bonus_credits,
                        "Subscription activated"
                    );
                }
                Ok(outcome)
            }
            ReconcileEvent::CreditsPurchased(purchase) => {
                let outcome = self.store.purchase_credits(claim, purchase).await?;
                if outcome == ReconcileOutcome::Applied {
                    tracing::info!(
                        account_id = %purchase.account_id,
                        pack = %purchase.pack,
                        credits = purchase.pack.credits(),
                        "Credit pack purchased"
                    );
                }
                Ok(outcome)
            }
            ReconcileEvent::SubscriptionDeleted {
                provider_subscription_id,
            } => {
                let outcome = self
                    .store
                    .cancel_subscription(
                        claim,
                        provider_subscription_id,
                        OffsetDateTime::now_utc(),
                    )
                    .await?;
                if outcome == ReconcileOutcome::Ignored {
                    tracing::info!(
                        provider_subscription_id = %provider_subscription_id,
                        "Subscription deletion for unknown or already canceled subscription"
                    );
                }
                Ok(outcome)
            }
        }
    }

    /// Verify, parse and apply a raw webhook delivery
    pub async fn handle(&self, payload: &str, signature: &str) -> BillingResult<ReconcileOutcome> {
        let event = self.verify_event(payload, signature)?;
        self.handle_verified(&event).await
    }

    pub async fn handle_verified(&self, event: &Event) -> BillingResult<ReconcileOutcome> {
        let event_type = event_type_name(event.type_);
        let Some(reconcile) = Self::parse_event(event)? else {
            tracing::info!(
                event_id = %event.id,
                event_type = %event_type,
                "Received unhandled provider event type"
            );
            return Ok(ReconcileOutcome::Ignored);
        };

        let claim = EventClaim::new(event.id.to_string(), event_type);
        self.apply(&claim, &reconcile).await
    }
}
