//! Subscription matching.
//!
//! An endpoint subscribes to an event type when its subscription list
//! contains that exact type or the wildcard. Matching is case-sensitive with
//! no prefix or glob semantics, and it ignores the enabled flag.

use crate::models::Endpoint;

/// Subscription entry that matches every event type.
pub const WILDCARD: &str = "*";

/// Returns whether `endpoint` subscribes to `event_type`.
pub fn matches(endpoint: &Endpoint, event_type: &str) -> bool {
    subscribes(&endpoint.subscriptions, event_type)
}

/// Returns whether a subscription list covers `event_type`.
pub fn subscribes<S: AsRef<str>>(subscriptions: &[S], event_type: &str) -> bool {
    subscriptions.iter().map(AsRef::as_ref).any(|entry| entry == WILDCARD || entry == event_type)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use proptest::prelude::*;

    use super::*;
    use crate::models::NewEndpoint;

    fn endpoint(subscriptions: &[&str]) -> Endpoint {
        NewEndpoint::new("https://good.example/hook", subscriptions.iter().copied())
            .into_endpoint(Utc::now())
    }

    #[test]
    fn exact_match_only() {
        let endpoint = endpoint(&["order.created"]);

        assert!(matches(&endpoint, "order.created"));
        assert!(!matches(&endpoint, "order.updated"));
        assert!(!matches(&endpoint, "order"));
        assert!(!matches(&endpoint, "Order.Created"));
    }

    #[test]
    fn wildcard_matches_everything() {
        let endpoint = endpoint(&["*"]);

        assert!(matches(&endpoint, "order.created"));
        assert!(matches(&endpoint, "anything.at.all"));
    }

    #[test]
    fn wildcard_is_not_a_glob() {
        let endpoint = endpoint(&["order.*"]);

        assert!(!matches(&endpoint, "order.created"));
        assert!(matches(&endpoint, "order.*"));
    }

    #[test]
    fn disabled_flag_is_ignored() {
        let mut endpoint = endpoint(&["order.created"]);
        endpoint.enabled = false;

        assert!(matches(&endpoint, "order.created"));
    }

    proptest! {
        #[test]
        fn wildcard_endpoint_matches_any_event(event_type in "[a-z]{1,8}(\\.[a-z]{1,8}){0,2}") {
            prop_assert!(subscribes(&["*"], &event_type));
        }

        #[test]
        fn match_equals_membership(
            subscriptions in prop::collection::vec("[a-c]\\.[a-c]", 1..5),
            event_type in "[a-c]\\.[a-c]",
        ) {
            let expected = subscriptions.iter().any(|s| s == &event_type);
            prop_assert_eq!(subscribes(&subscriptions, &event_type), expected);
        }
    }
}
