//! Per-session state machine: pure transition logic.
//!
//! Phases: `Browsing → Interested → CartActive → Checkout → {Purchased,
//! Abandoned}`, with `BrowsingClosed` for cartless sessions that time out.
//! Every mutation goes through [`SessionState::apply`], which updates the
//! phase and the counters in one pass — an event is never applied partially.
//!
//! Time is injected (`now_ms` / event timestamps); nothing here reads the
//! clock, so every transition and timeout decision is deterministic under
//! test.
//!
//! # Invariants
//!
//! - `cart_value >= 0` (removals clamp at zero)
//! - `unique_products.len() <= products_viewed`
//! - `last_activity_ms >= start_ms`
//! - a session reaches a terminal phase at most once; a finalized session
//!   rejects every further event as an anomaly

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::event::{Event, EventType};

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Browsing,
    Interested,
    CartActive,
    Checkout,
    Purchased,
    Abandoned,
    /// Cartless session closed by inactivity. Not an abandonment.
    BrowsingClosed,
}

impl Phase {
    /// Whether this phase is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Purchased | Self::Abandoned | Self::BrowsingClosed)
    }

    /// Wire/storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Browsing => "browsing",
            Self::Interested => "interested",
            Self::CartActive => "cart_active",
            Self::Checkout => "checkout",
            Self::Purchased => "purchased",
            Self::Abandoned => "abandoned",
            Self::BrowsingClosed => "browsing_closed",
        }
    }
}

/// Outcome of applying one event to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// State mutated.
    Ok,
    /// `session_end` applied; the caller should finalize now.
    FinalizeRequested,
    /// Same `event_id` seen within the dedupe window; no-op.
    Duplicate,
    /// Event type not valid for the current phase; ignored, counted.
    Anomaly,
}

/// What triggered a finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeCause {
    /// Explicit `session_end` event.
    ExplicitEnd,
    /// Purchase reached a terminal phase; finalized immediately.
    Converted,
    /// Inactivity timeout (sweeper).
    Timeout,
    /// Engine shutdown flush.
    Shutdown,
}

impl FinalizeCause {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExplicitEnd => "explicit_end",
            Self::Converted => "converted",
            Self::Timeout => "timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Mutable session state, owned exclusively by one worker shard.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    pub user_id: u64,
    pub phase: Phase,
    /// Session start, epoch ms (first observed event).
    pub start_ms: u64,
    /// Most recent activity, epoch ms.
    pub last_activity_ms: u64,
    pub page_views: u32,
    /// Product-view count (non-unique).
    pub products_viewed: u32,
    /// Distinct product ids viewed.
    pub unique_products: HashSet<u64>,
    pub searches: u32,
    pub cart_additions: u32,
    pub cart_removals: u32,
    /// Current cart value; never negative.
    pub cart_value: f64,
    /// When the cart first became non-empty, epoch ms.
    pub cart_enter_ms: Option<u64>,
    pub checkout_initiated: bool,
    pub persona: Option<String>,
    pub device_type: String,
    pub browser: String,
    pub is_converted: bool,
    pub purchase_value: f64,
    /// Set exactly once by [`SessionState::finalize`].
    pub finalized: bool,
    /// What caused the finalize, once finalized.
    pub finalize_cause: Option<FinalizeCause>,

    /// Bounded window of recently applied event ids for duplicate detection.
    dedupe_order: VecDeque<String>,
    dedupe_set: HashSet<String>,
    dedupe_capacity: usize,
}

impl SessionState {
    /// Create session state from its first observed event.
    ///
    /// Works for explicit `session_start` and for implicit creation on any
    /// first activity; the first event itself must still be applied.
    #[must_use]
    pub fn new(event: &Event, dedupe_capacity: usize) -> Self {
        Self {
            session_id: event.session_id.clone(),
            user_id: event.user_id,
            phase: Phase::Browsing,
            start_ms: event.timestamp_ms,
            last_activity_ms: event.timestamp_ms,
            page_views: 0,
            products_viewed: 0,
            unique_products: HashSet::new(),
            searches: 0,
            cart_additions: 0,
            cart_removals: 0,
            cart_value: 0.0,
            cart_enter_ms: None,
            checkout_initiated: false,
            persona: None,
            device_type: event.device_type.clone(),
            browser: event.browser.clone(),
            is_converted: false,
            purchase_value: 0.0,
            finalized: false,
            finalize_cause: None,
            dedupe_order: VecDeque::new(),
            dedupe_set: HashSet::new(),
            dedupe_capacity: dedupe_capacity.max(1),
        }
    }

    /// Apply one event. Pure with respect to time: only the event's own
    /// timestamp moves the activity clock.
    pub fn apply(&mut self, event: &Event) -> Applied {
        if self.dedupe_set.contains(&event.event_id) {
            return Applied::Duplicate;
        }
        if self.finalized || self.phase.is_terminal() {
            return Applied::Anomaly;
        }

        let outcome = match event.event_type {
            EventType::SessionStart => {
                if self.persona.is_none() {
                    self.persona.clone_from(&event.persona);
                }
                Applied::Ok
            }
            EventType::PageView => {
                self.page_views += 1;
                Applied::Ok
            }
            EventType::ProductView => {
                self.products_viewed += 1;
                if let Some(pid) = event.product_id {
                    self.unique_products.insert(pid);
                }
                if self.phase == Phase::Browsing {
                    self.phase = Phase::Interested;
                }
                Applied::Ok
            }
            EventType::Search => {
                self.searches += 1;
                if self.phase == Phase::Browsing {
                    self.phase = Phase::Interested;
                }
                Applied::Ok
            }
            EventType::AddToCart => {
                self.cart_additions += 1;
                self.cart_value += event.line_value();
                if self.cart_enter_ms.is_none() {
                    self.cart_enter_ms = Some(event.timestamp_ms);
                }
                if matches!(self.phase, Phase::Browsing | Phase::Interested) {
                    self.phase = Phase::CartActive;
                }
                Applied::Ok
            }
            EventType::RemoveFromCart => {
                if !matches!(self.phase, Phase::CartActive | Phase::Checkout) {
                    return Applied::Anomaly;
                }
                self.cart_removals += 1;
                self.cart_value = (self.cart_value - event.line_value()).max(0.0);
                if self.cart_value <= f64::EPSILON {
                    self.cart_value = 0.0;
                    self.phase = Phase::Interested;
                }
                Applied::Ok
            }
            EventType::CheckoutInitiated => {
                if self.phase != Phase::CartActive || self.cart_value <= 0.0 {
                    return Applied::Anomaly;
                }
                self.checkout_initiated = true;
                self.phase = Phase::Checkout;
                Applied::Ok
            }
            EventType::Purchase => {
                if self.phase != Phase::Checkout {
                    return Applied::Anomaly;
                }
                self.is_converted = true;
                self.purchase_value = event.cart_value.unwrap_or(self.cart_value);
                self.phase = Phase::Purchased;
                Applied::Ok
            }
            EventType::SessionEnd => Applied::FinalizeRequested,
        };

        // A rejected event leaves the state untouched, including the
        // activity clock and the dedupe window (returned above).
        self.last_activity_ms = self.last_activity_ms.max(event.timestamp_ms);
        self.remember(event.event_id.clone());
        outcome
    }

    fn remember(&mut self, event_id: String) {
        if self.dedupe_order.len() >= self.dedupe_capacity {
            if let Some(evicted) = self.dedupe_order.pop_front() {
                self.dedupe_set.remove(&evicted);
            }
        }
        self.dedupe_set.insert(event_id.clone());
        self.dedupe_order.push_back(event_id);
    }

    /// Whether the session has been inactive past the timeout at `now_ms`.
    ///
    /// Sessions mid-checkout get `checkout_grace_ms` on top of the base
    /// timeout.
    #[must_use]
    pub fn timed_out(&self, now_ms: u64, timeout_ms: u64, checkout_grace_ms: u64) -> bool {
        if self.finalized || self.phase.is_terminal() {
            return false;
        }
        let effective = if self.phase == Phase::Checkout {
            timeout_ms + checkout_grace_ms
        } else {
            timeout_ms
        };
        now_ms.saturating_sub(self.last_activity_ms) > effective
    }

    /// Transition to the terminal phase. Returns the terminal phase, or
    /// `None` if the session was already finalized.
    ///
    /// The caller decides the abandonment verdict (classifier) afterwards;
    /// this only picks the terminal phase:
    /// converted → `Purchased`; open cart → `Abandoned`; else
    /// `BrowsingClosed`.
    pub fn finalize(&mut self, cause: FinalizeCause) -> Option<Phase> {
        if self.finalized {
            return None;
        }
        let terminal = if self.is_converted {
            Phase::Purchased
        } else if self.cart_value > 0.0 {
            Phase::Abandoned
        } else {
            Phase::BrowsingClosed
        };
        self.phase = terminal;
        self.finalized = true;
        self.finalize_cause = Some(cause);
        Some(terminal)
    }

    /// Session duration in seconds (start to last activity).
    #[must_use]
    pub fn duration_secs(&self) -> u64 {
        self.last_activity_ms.saturating_sub(self.start_ms) / 1000
    }

    /// Seconds the cart has been open, from first add to `end_ms`.
    #[must_use]
    pub fn time_in_cart_secs(&self, end_ms: u64) -> u64 {
        self.cart_enter_ms
            .map_or(0, |enter| end_ms.saturating_sub(enter) / 1000)
    }

    /// Debug-check the structural invariants. Used by tests.
    #[must_use]
    pub fn invariants_hold(&self) -> bool {
        self.cart_value >= 0.0
            && self.unique_products.len() <= self.products_viewed as usize
            && self.last_activity_ms >= self.start_ms
            && (self.finalized == self.finalize_cause.is_some())
    }
}
