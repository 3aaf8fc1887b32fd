//! Payment links and payment-webhook decoding.
//!
//! Link issuance is pure string work over preconfigured checkout links; the
//! order id rides along as the client reference so the webhook can find its
//! way back. Signature verification happens upstream of [`decode_event`].

use serde::Deserialize;

use crate::error::{Error, Result};

pub const CREDIT_BUNDLES: [i64; 3] = [1, 5, 10];

/// Preconfigured checkout links per credit bundle.
#[derive(Debug, Clone)]
pub struct PaymentLinks {
    pub single: String,
    pub five: String,
    pub ten: String,
}

impl PaymentLinks {
    /// Checkout link for a bundle, carrying the order id as client reference.
    pub fn link_for(&self, credits: i64, order_id: &str) -> Result<String> {
        let base = match credits {
            1 => &self.single,
            5 => &self.five,
            10 => &self.ten,
            other => {
                return Err(Error::Payment(format!(
                    "no payment link for {other} credits; options are {CREDIT_BUNDLES:?}"
                )))
            }
        };
        Ok(format!("{base}?client_reference_id={order_id}"))
    }
}

/// A decoded checkout-completed webhook delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentEvent {
    /// Provider event id; the idempotency key for this delivery.
    pub event_id: String,
    /// The order the checkout was opened for.
    pub order_id: String,
    /// Credits purchased in this checkout.
    pub credits_bought: i64,
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: RawCheckout,
}

#[derive(Deserialize)]
struct RawCheckout {
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
}

/// Decode a raw webhook body. Only `checkout.session.completed` is accepted.
pub fn decode_event(payload: &serde_json::Value) -> Result<PaymentEvent> {
    let raw: RawEvent = serde_json::from_value(payload.clone())?;
    if raw.event_type != "checkout.session.completed" {
        return Err(Error::Payment(format!(
            "unhandled event type '{}'",
            raw.event_type
        )));
    }
    let order_id = raw
        .data
        .object
        .client_reference_id
        .ok_or_else(|| Error::Payment("checkout without client_reference_id".into()))?;
    let credits_bought = match raw.data.object.metadata.get("letter_credits") {
        Some(serde_json::Value::String(s)) => s.parse::<i64>().ok(),
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        _ => None,
    }
    .ok_or_else(|| Error::Payment("checkout without letter_credits metadata".into()))?;

    Ok(PaymentEvent {
        event_id: raw.id,
        order_id,
        credits_bought,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn links() -> PaymentLinks {
        PaymentLinks {
            single: "https://pay.example/one".into(),
            five: "https://pay.example/five".into(),
            ten: "https://pay.example/ten".into(),
        }
    }

    #[test]
    fn test_link_carries_order_reference() {
        let link = links().link_for(5, "order-42").unwrap();
        assert_eq!(link, "https://pay.example/five?client_reference_id=order-42");
        assert!(links().link_for(3, "order-42").is_err());
    }

    #[test]
    fn test_decode_checkout_completed() {
        let event = decode_event(&json!({
            "id": "evt_123",
            "type": "checkout.session.completed",
            "data": {"object": {
                "client_reference_id": "order-42",
                "metadata": {"letter_credits": "5"},
            }},
        }))
        .unwrap();
        assert_eq!(
            event,
            PaymentEvent {
                event_id: "evt_123".into(),
                order_id: "order-42".into(),
                credits_bought: 5,
            }
        );
    }

    #[test]
    fn test_decode_accepts_numeric_credits() {
        let event = decode_event(&json!({
            "id": "evt_124",
            "type": "checkout.session.completed",
            "data": {"object": {
                "client_reference_id": "order-43",
                "metadata": {"letter_credits": 1},
            }},
        }))
        .unwrap();
        assert_eq!(event.credits_bought, 1);
    }

    #[test]
    fn test_decode_rejects_other_event_types() {
        let err = decode_event(&json!({
            "id": "evt_125",
            "type": "invoice.paid",
            "data": {"object": {}},
        }))
        .unwrap_err();
        assert!(matches!(err, Error::Payment(_)));
    }

    #[test]
    fn test_decode_requires_reference_and_credits() {
        assert!(decode_event(&json!({
            "id": "evt_126",
            "type": "checkout.session.completed",
            "data": {"object": {"metadata": {"letter_credits": "1"}}},
        }))
        .is_err());
        assert!(decode_event(&json!({
            "id": "evt_127",
            "type": "checkout.session.completed",
            "data": {"object": {"client_reference_id": "order-1", "metadata": {}}},
        }))
        .is_err());
    }
}
