//! Finalized session summary — the durable row and cache value.

use serde::{Deserialize, Serialize};

use crate::classifier::Verdict;
use crate::event::format_rfc3339_ms;
use crate::session::{Phase, SessionState};

/// A bounce is a single-page session shorter than this.
const BOUNCE_MAX_DURATION_SECS: u64 = 30;

/// The flattened, immutable summary of a finalized session.
///
/// Upserted into the durable store keyed by `session_id` and written to the
/// cache; re-applying the same summary is a no-op by construction
/// (last-write-wins on `updated_at`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub user_id: u64,
    /// RFC 3339.
    pub start_time: String,
    /// RFC 3339; the session's last activity.
    pub end_time: String,
    /// RFC 3339.
    pub last_activity: String,
    pub device_type: String,
    pub browser: String,
    pub page_views: u32,
    pub products_viewed: u32,
    pub unique_products_viewed: u32,
    pub searches: u32,
    pub cart_additions: u32,
    pub cart_removals: u32,
    pub cart_value: f64,
    pub is_converted: bool,
    pub purchase_value: f64,
    pub is_cart_abandoned: bool,
    pub abandonment_reason: Option<String>,
    pub time_in_cart_seconds: u64,
    pub checkout_initiated: bool,
    pub persona: Option<String>,
    /// Terminal phase label (purchased / abandoned / browsing_closed).
    pub final_phase: String,
    pub session_duration_seconds: u64,
    pub avg_time_per_page: f64,
    pub bounce: bool,
    /// RFC 3339; when the summary was produced.
    pub updated_at: String,
}

impl SessionSummary {
    /// Build a summary from a finalized session.
    ///
    /// `verdict` is present exactly when the terminal phase is `Abandoned`;
    /// `now_ms` stamps `updated_at`.
    #[must_use]
    pub fn build(state: &SessionState, verdict: Option<&Verdict>, now_ms: u64) -> Self {
        let duration = state.duration_secs();
        let avg_time_per_page = if state.page_views > 0 {
            duration as f64 / f64::from(state.page_views)
        } else {
            0.0
        };
        let bounce = state.page_views <= 1 && duration < BOUNCE_MAX_DURATION_SECS;
        let is_cart_abandoned = state.phase == Phase::Abandoned;

        Self {
            session_id: state.session_id.clone(),
            user_id: state.user_id,
            start_time: format_rfc3339_ms(state.start_ms),
            end_time: format_rfc3339_ms(state.last_activity_ms),
            last_activity: format_rfc3339_ms(state.last_activity_ms),
            device_type: state.device_type.clone(),
            browser: state.browser.clone(),
            page_views: state.page_views,
            products_viewed: state.products_viewed,
            unique_products_viewed: state.unique_products.len() as u32,
            searches: state.searches,
            cart_additions: state.cart_additions,
            cart_removals: state.cart_removals,
            cart_value: round2(state.cart_value),
            is_converted: state.is_converted,
            purchase_value: round2(state.purchase_value),
            is_cart_abandoned,
            abandonment_reason: verdict.map(|v| v.reason.clone()),
            time_in_cart_seconds: verdict.map_or(0, |v| v.time_in_cart_secs),
            checkout_initiated: state.checkout_initiated,
            persona: state.persona.clone(),
            final_phase: state.phase.as_str().to_string(),
            session_duration_seconds: duration,
            avg_time_per_page: round2(avg_time_per_page),
            bounce,
            updated_at: format_rfc3339_ms(now_ms),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Verdict;
    use crate::event::test_support::{cart_event, event};
    use crate::event::EventType;
    use crate::session::FinalizeCause;

    const T0: u64 = 1_700_000_000_000;

    #[test]
    fn abandoned_summary_carries_verdict() {
        let start = event("e1", "s1", EventType::SessionStart, T0);
        let mut state = SessionState::new(&start, 32);
        state.apply(&start);
        state.apply(&cart_event("e2", "s1", EventType::AddToCart, T0 + 5000, 45.0, 1, 3));
        state.finalize(FinalizeCause::Timeout).unwrap();

        let verdict = Verdict {
            reason: "high_price".to_string(),
            time_in_cart_secs: 56,
            checkout_initiated: false,
        };
        let summary = SessionSummary::build(&state, Some(&verdict), T0 + 61_000);

        assert!(summary.is_cart_abandoned);
        assert_eq!(summary.abandonment_reason.as_deref(), Some("high_price"));
        assert_eq!(summary.time_in_cart_seconds, 56);
        assert!((summary.cart_value - 45.0).abs() < f64::EPSILON);
        assert!(!summary.checkout_initiated);
        assert_eq!(summary.final_phase, "abandoned");
    }

    #[test]
    fn purchased_summary_has_no_abandonment() {
        let start = event("e1", "s1", EventType::SessionStart, T0);
        let mut state = SessionState::new(&start, 32);
        state.apply(&start);
        state.apply(&cart_event("e2", "s1", EventType::AddToCart, T0 + 1000, 30.0, 1, 3));
        state.apply(&event("e3", "s1", EventType::CheckoutInitiated, T0 + 2000));
        let mut purchase = event("e4", "s1", EventType::Purchase, T0 + 3000);
        purchase.cart_value = Some(30.0);
        state.apply(&purchase);
        state.finalize(FinalizeCause::Converted).unwrap();

        let summary = SessionSummary::build(&state, None, T0 + 3000);
        assert!(summary.is_converted);
        assert!(!summary.is_cart_abandoned);
        assert!(summary.abandonment_reason.is_none());
        assert!((summary.purchase_value - 30.0).abs() < f64::EPSILON);
        assert_eq!(summary.final_phase, "purchased");
    }

    #[test]
    fn single_page_short_session_is_a_bounce() {
        let start = event("e1", "s1", EventType::SessionStart, T0);
        let mut state = SessionState::new(&start, 32);
        state.apply(&start);
        state.apply(&event("e2", "s1", EventType::PageView, T0 + 5000));
        state.finalize(FinalizeCause::Timeout).unwrap();

        let summary = SessionSummary::build(&state, None, T0 + 66_000);
        assert_eq!(summary.page_views, 1);
        assert!(summary.bounce);
        assert_eq!(summary.final_phase, "browsing_closed");
    }

    #[test]
    fn long_session_is_not_a_bounce() {
        let start = event("e1", "s1", EventType::SessionStart, T0);
        let mut state = SessionState::new(&start, 32);
        state.apply(&start);
        state.apply(&event("e2", "s1", EventType::PageView, T0 + 45_000));
        state.finalize(FinalizeCause::Timeout).unwrap();

        let summary = SessionSummary::build(&state, None, T0 + 106_000);
        assert!(!summary.bounce);
        assert_eq!(summary.session_duration_seconds, 45);
    }

    #[test]
    fn avg_time_per_page_divides_duration() {
        let start = event("e1", "s1", EventType::SessionStart, T0);
        let mut state = SessionState::new(&start, 32);
        state.apply(&start);
        for i in 0..4u64 {
            state.apply(&event(
                &format!("p{i}"),
                "s1",
                EventType::PageView,
                T0 + (i + 1) * 10_000,
            ));
        }
        state.finalize(FinalizeCause::ExplicitEnd).unwrap();

        let summary = SessionSummary::build(&state, None, T0 + 40_000);
        assert_eq!(summary.session_duration_seconds, 40);
        assert!((summary.avg_time_per_page - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn serializes_for_cache_storage() {
        let start = event("e1", "s1", EventType::SessionStart, T0);
        let mut state = SessionState::new(&start, 32);
        state.apply(&start);
        state.finalize(FinalizeCause::Timeout).unwrap();

        let summary = SessionSummary::build(&state, None, T0);
        let json = serde_json::to_string(&summary).unwrap();
        let back: SessionSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, summary);
    }
}
