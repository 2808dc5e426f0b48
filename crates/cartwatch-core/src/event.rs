//! Inbound event schema and validation.
//!
//! Events arrive as JSON produced by the upstream simulator/collector. The
//! wire timestamp is RFC 3339; internally everything runs on epoch
//! milliseconds so state-machine and sweeper logic stay pure and test-time
//! injectable.
//!
//! Validation is strict on identity fields (`event_id`, `session_id`,
//! `event_type`, `timestamp`) and lenient on the rest: unknown extra fields
//! are ignored, optional commerce fields default to absent.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EventError;

/// The event types the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStart,
    PageView,
    ProductView,
    Search,
    AddToCart,
    RemoveFromCart,
    CheckoutInitiated,
    Purchase,
    SessionEnd,
}

impl EventType {
    /// Parse the wire representation (snake_case).
    pub fn parse(raw: &str) -> Result<Self, EventError> {
        match raw {
            "session_start" => Ok(Self::SessionStart),
            "page_view" => Ok(Self::PageView),
            "product_view" => Ok(Self::ProductView),
            "search" => Ok(Self::Search),
            "add_to_cart" => Ok(Self::AddToCart),
            "remove_from_cart" => Ok(Self::RemoveFromCart),
            "checkout_initiated" => Ok(Self::CheckoutInitiated),
            "purchase" => Ok(Self::Purchase),
            "session_end" => Ok(Self::SessionEnd),
            other => Err(EventError::UnknownType(other.to_string())),
        }
    }

    /// Wire representation (snake_case).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStart => "session_start",
            Self::PageView => "page_view",
            Self::ProductView => "product_view",
            Self::Search => "search",
            Self::AddToCart => "add_to_cart",
            Self::RemoveFromCart => "remove_from_cart",
            Self::CheckoutInitiated => "checkout_initiated",
            Self::Purchase => "purchase",
            Self::SessionEnd => "session_end",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw wire shape, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct WireEvent {
    event_id: String,
    timestamp: String,
    event_type: String,
    user_id: u64,
    session_id: String,
    product_id: Option<u64>,
    category: Option<String>,
    price: Option<f64>,
    quantity: Option<u32>,
    cart_value: Option<f64>,
    persona: Option<String>,
    device_type: String,
    browser: String,
}

/// A validated, immutable interaction event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique event id (dedupe key under at-least-once delivery).
    pub event_id: String,
    /// Event time, epoch milliseconds.
    pub timestamp_ms: u64,
    /// Event type.
    pub event_type: EventType,
    /// Owning user.
    pub user_id: u64,
    /// Owning session (partition key).
    pub session_id: String,
    /// Product referenced by product/cart events.
    pub product_id: Option<u64>,
    /// Product category.
    pub category: Option<String>,
    /// Unit price on cart events.
    pub price: Option<f64>,
    /// Quantity on cart events (defaults to 1 when priced).
    pub quantity: Option<u32>,
    /// Running cart value as reported by the producer (purchase events).
    pub cart_value: Option<f64>,
    /// Simulated persona label, present on session_start.
    pub persona: Option<String>,
    /// Device type (desktop/mobile/tablet).
    pub device_type: String,
    /// Browser name.
    pub browser: String,
}

impl Event {
    /// Parse and validate a JSON payload.
    pub fn from_json(payload: &str) -> Result<Self, EventError> {
        let wire: WireEvent = serde_json::from_str(payload)
            .map_err(|e| EventError::Malformed(e.to_string()))?;
        Self::from_wire(wire)
    }

    fn from_wire(wire: WireEvent) -> Result<Self, EventError> {
        if wire.event_id.is_empty() {
            return Err(EventError::MissingField("event_id"));
        }
        if wire.session_id.is_empty() {
            return Err(EventError::MissingField("session_id"));
        }
        if wire.event_type.is_empty() {
            return Err(EventError::MissingField("event_type"));
        }
        let event_type = EventType::parse(&wire.event_type)?;
        let timestamp_ms = parse_rfc3339_ms(&wire.timestamp)?;

        if let Some(price) = wire.price {
            if !price.is_finite() || price < 0.0 {
                return Err(EventError::Malformed(format!("negative price: {price}")));
            }
        }
        if let Some(value) = wire.cart_value {
            if !value.is_finite() || value < 0.0 {
                return Err(EventError::Malformed(format!(
                    "negative cart_value: {value}"
                )));
            }
        }

        Ok(Self {
            event_id: wire.event_id,
            timestamp_ms,
            event_type,
            user_id: wire.user_id,
            session_id: wire.session_id,
            product_id: wire.product_id,
            category: wire.category,
            price: wire.price,
            quantity: wire.quantity,
            cart_value: wire.cart_value,
            persona: wire.persona,
            device_type: wire.device_type,
            browser: wire.browser,
        })
    }

    /// Effective line value of a cart event: price × quantity (quantity
    /// defaults to 1).
    #[must_use]
    pub fn line_value(&self) -> f64 {
        let price = self.price.unwrap_or(0.0);
        let quantity = f64::from(self.quantity.unwrap_or(1));
        price * quantity
    }
}

/// Parse an RFC 3339 timestamp into epoch milliseconds.
pub fn parse_rfc3339_ms(raw: &str) -> Result<u64, EventError> {
    if raw.is_empty() {
        return Err(EventError::MissingField("timestamp"));
    }
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| EventError::BadTimestamp(format!("{raw}: {e}")))?;
    let ms = parsed.timestamp_millis();
    if ms < 0 {
        return Err(EventError::BadTimestamp(format!("pre-epoch: {raw}")));
    }
    Ok(ms as u64)
}

/// Render epoch milliseconds as RFC 3339 (UTC, millisecond precision).
#[must_use]
pub fn format_rfc3339_ms(ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a minimal valid event for tests.
    pub fn event(
        event_id: &str,
        session_id: &str,
        event_type: EventType,
        timestamp_ms: u64,
    ) -> Event {
        Event {
            event_id: event_id.to_string(),
            timestamp_ms,
            event_type,
            user_id: 7,
            session_id: session_id.to_string(),
            product_id: None,
            category: None,
            price: None,
            quantity: None,
            cart_value: None,
            persona: None,
            device_type: "desktop".to_string(),
            browser: "Firefox".to_string(),
        }
    }

    /// Build a cart event carrying a price and quantity.
    pub fn cart_event(
        event_id: &str,
        session_id: &str,
        event_type: EventType,
        timestamp_ms: u64,
        price: f64,
        quantity: u32,
        product_id: u64,
    ) -> Event {
        let mut ev = event(event_id, session_id, event_type, timestamp_ms);
        ev.price = Some(price);
        ev.quantity = Some(quantity);
        ev.product_id = Some(product_id);
        ev
    }
}
