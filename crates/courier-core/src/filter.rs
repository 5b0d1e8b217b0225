//! Glob-based event filters shared by subscriptions and live streams.
//!
//! Patterns support `*` (any run of characters, dots included) and `?` (a
//! single character); everything else matches literally and
//! case-sensitively. `order.*` therefore matches `order.created` and
//! `order.item.added` but not `orders.created`.

use serde::{Deserialize, Serialize};

/// Matches `text` against a glob `pattern`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<usize> = None;
    let mut star_text = 0;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_text = t;
            p += 1;
        } else if let Some(star_pos) = star {
            // backtrack: let the last star absorb one more character
            p = star_pos + 1;
            star_text += 1;
            t = star_text;
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Event type and source filter. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Globs over the event type.
    #[serde(default)]
    pub event_types: Vec<String>,

    /// Globs over the event source.
    #[serde(default)]
    pub sources: Vec<String>,
}

impl EventFilter {
    /// Creates a filter over event types only.
    pub fn for_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { event_types: types.into_iter().map(Into::into).collect(), sources: Vec::new() }
    }

    /// Restricts the filter to the given sources.
    #[must_use]
    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    /// Returns whether an event with this type and source passes.
    pub fn matches(&self, event_type: &str, source: &str) -> bool {
        let type_ok = self.event_types.is_empty()
            || self.event_types.iter().any(|pattern| glob_match(pattern, event_type));
        let source_ok =
            self.sources.is_empty() || self.sources.iter().any(|pattern| glob_match(pattern, source));
        type_ok && source_ok
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn wildcard_segments() {
        assert!(glob_match("order.*", "order.created"));
        assert!(glob_match("order.*", "order.item.added"));
        assert!(!glob_match("order.*", "orders.created"));
        assert!(!glob_match("order.*", "order"));
        assert!(glob_match("*.created", "invoice.created"));
        assert!(glob_match("order.?reated", "order.created"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("", "x"));
    }

    #[test]
    fn filter_requires_type_and_source() {
        let filter = EventFilter::for_types(["order.*", "invoice.paid"]).with_sources(["shop"]);

        assert!(filter.matches("order.created", "shop"));
        assert!(filter.matches("invoice.paid", "shop"));
        assert!(!filter.matches("invoice.void", "shop"));
        assert!(!filter.matches("order.created", "billing"));
        assert!(EventFilter::default().matches("anything", "anywhere"));
    }

    proptest! {
        #[test]
        fn literal_pattern_matches_only_itself(a in "[a-z.]{0,12}", b in "[a-z.]{0,12}") {
            prop_assert_eq!(glob_match(&a, &b), a == b);
        }

        #[test]
        fn prefix_star_matches_every_extension(prefix in "[a-z]{1,8}", rest in "[a-z.]{0,12}") {
            let pattern = format!("{prefix}.*");
            let text = format!("{prefix}.{rest}");
            prop_assert!(glob_match(&pattern, &text));
        }

        #[test]
        fn lone_star_matches_everything(text in ".{0,24}") {
            prop_assert!(glob_match("*", &text));
        }
    }
}
