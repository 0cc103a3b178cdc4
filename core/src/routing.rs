//! Routing and binding engine.
//!
//! Decides whether a consumer group wants a published message, given the
//! topic's type and the group's bindings. Pure functions over snapshot data;
//! no state is consulted or mutated.

use crate::cluster::{BindingMatch, ClusterConsumerGroup, ClusterTopic, TopicKind};
use crate::protocol::Message;

const SEPARATOR: char = '.';
const WILDCARD: &str = "*";
const ZERO_OR_MORE: &str = "#";

/// Does `consumer_group` want `message` published to `topic`?
///
/// Messages older than the group's `since` cutoff are never delivered,
/// regardless of bindings.
pub fn message_matches(
    message: &Message,
    message_time: u64,
    topic: &ClusterTopic,
    consumer_group: &ClusterConsumerGroup,
) -> bool {
    if message_time < consumer_group.since {
        return false;
    }

    match topic.kind {
        TopicKind::Direct => consumer_group.bindings.iter().any(|binding| {
            binding.topic_name == topic.name
                && matches!(&binding.by, BindingMatch::RoutingKey(key) if *key == message.routing_key)
        }),

        TopicKind::Fanout => consumer_group
            .bindings
            .iter()
            .any(|binding| binding.topic_name == topic.name),

        TopicKind::Topic => consumer_group.bindings.iter().any(|binding| {
            binding.topic_name == topic.name
                && matches!(&binding.by, BindingMatch::RoutingKey(pattern)
                    if routing_key_matches(pattern, &message.routing_key))
        }),

        TopicKind::Headers => {
            if message.headers.is_empty() {
                return false;
            }
            for binding in &consumer_group.bindings {
                if binding.topic_name != topic.name {
                    continue;
                }
                match &binding.by {
                    BindingMatch::HeadersAll(expected) => {
                        if expected
                            .iter()
                            .all(|(name, value)| message.headers.get(name) == Some(value))
                        {
                            return true;
                        }
                    }
                    BindingMatch::HeadersAny(expected) => {
                        return expected
                            .iter()
                            .any(|(name, value)| message.headers.get(name) == Some(value));
                    }
                    _ => {}
                }
            }
            false
        }
    }
}

/// Match `routing_key` against `pattern` over dot-separated segments.
///
/// `*` matches exactly one non-empty segment, `#` matches zero or more
/// segments, and literal segments match byte-exact. A trailing dot on
/// either side never matches: it is a required empty segment, not an
/// exhausted one.
pub fn routing_key_matches(pattern: &str, routing_key: &str) -> bool {
    if pattern.is_empty() {
        return routing_key.is_empty();
    }

    match pattern.split_once(SEPARATOR) {
        None => {
            if pattern == WILDCARD {
                !routing_key.is_empty() && !routing_key.contains(SEPARATOR)
            } else if pattern == ZERO_OR_MORE {
                match routing_key.split_once(SEPARATOR) {
                    None => true,
                    Some((_, rest)) => {
                        if rest.is_empty() {
                            // trailing dot
                            return false;
                        }
                        routing_key_matches(pattern, rest)
                    }
                }
            } else {
                routing_key == pattern
            }
        }
        Some((part, pattern_rest)) => {
            if pattern_rest.is_empty() {
                // trailing dot in the pattern demands an empty final
                // segment, which no routing key can produce
                return false;
            }
            if part == WILDCARD {
                match routing_key.split_once(SEPARATOR) {
                    None => !routing_key.is_empty() && routing_key_matches(pattern_rest, ""),
                    Some((_, rest)) => {
                        if rest.is_empty() {
                            return false;
                        }
                        routing_key_matches(pattern_rest, rest)
                    }
                }
            } else if part == ZERO_OR_MORE {
                let mut routing_key = routing_key;
                loop {
                    if routing_key_matches(pattern_rest, routing_key) {
                        return true;
                    }
                    match routing_key.split_once(SEPARATOR) {
                        None => return false,
                        Some((_, rest)) => {
                            if rest.is_empty() {
                                return false;
                            }
                            routing_key = rest;
                        }
                    }
                }
            } else {
                match routing_key.split_once(SEPARATOR) {
                    None => routing_key == part && routing_key_matches(pattern_rest, ""),
                    Some((head, rest)) => {
                        if head != part {
                            return false;
                        }
                        if rest.is_empty() {
                            return false;
                        }
                        routing_key_matches(pattern_rest, rest)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Binding;
    use crate::protocol::FieldValue;
    use std::time::Duration;

    fn topic(kind: TopicKind) -> ClusterTopic {
        ClusterTopic {
            name: "t".to_string(),
            kind,
            shards: 1,
            replication_factor: 1,
            retention: Duration::from_secs(60),
        }
    }

    fn group(bindings: Vec<Binding>) -> ClusterConsumerGroup {
        ClusterConsumerGroup {
            name: "g".to_string(),
            size: 1024,
            since: 0,
            bindings,
            offset_commits: Vec::new(),
        }
    }

    fn message(routing_key: &str) -> Message {
        Message {
            routing_key: routing_key.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn routing_key_pattern_table() {
        let cases = [
            ("a.b.c", "a.b.c", true),
            ("a.*.c", "a.b.c", true),
            ("a.*.c", "a.c", false),
            ("a.#", "a.b.c.d", true),
            ("a.#.d", "a.d", true),
            ("#", "", true),
            ("#", "a.b", true),
            ("a.", "a", false),
            ("a.", "a.b", false),
            ("*.", "a", false),
            ("#.", "", false),
            ("a.b", "a.b.c", false),
            ("*", "", false),
            ("*", "a", true),
            ("*.b", "a.b", true),
            ("", "", true),
            ("", "a", false),
        ];
        for (pattern, key, expected) in cases {
            assert_eq!(
                routing_key_matches(pattern, key),
                expected,
                "pattern {:?} key {:?}",
                pattern,
                key
            );
        }
    }

    #[test]
    fn routing_key_rejects_trailing_dot_in_key() {
        assert!(!routing_key_matches("a", "a."));
        assert!(!routing_key_matches("a.#", "a."));
        assert!(!routing_key_matches("a.*", "a."));
    }

    #[test]
    fn routing_key_rejects_trailing_dot_in_pattern() {
        assert!(!routing_key_matches("a.", "a"));
        assert!(!routing_key_matches("a.b.", "a.b"));
        assert!(!routing_key_matches("*.", "a"));
        assert!(!routing_key_matches("#.", "a.b"));
    }

    #[test]
    fn direct_topic_matches_exact_key_only() {
        let t = topic(TopicKind::Direct);
        let g = group(vec![Binding {
            topic_name: "t".to_string(),
            by: BindingMatch::RoutingKey("rk".to_string()),
        }]);

        assert!(message_matches(&message("rk"), 0, &t, &g));
        assert!(!message_matches(&message("other"), 0, &t, &g));
    }

    #[test]
    fn fanout_topic_matches_any_binding() {
        let t = topic(TopicKind::Fanout);
        let bound = group(vec![Binding {
            topic_name: "t".to_string(),
            by: BindingMatch::Fanout,
        }]);
        let unbound = group(Vec::new());

        assert!(message_matches(&message("anything"), 0, &t, &bound));
        assert!(!message_matches(&message("anything"), 0, &t, &unbound));
    }

    #[test]
    fn headers_all_requires_every_pair() {
        let t = topic(TopicKind::Headers);
        let g = group(vec![Binding {
            topic_name: "t".to_string(),
            by: BindingMatch::HeadersAll(
                [
                    ("x".to_string(), FieldValue::I32(1)),
                    ("y".to_string(), FieldValue::I32(2)),
                ]
                .into(),
            ),
        }]);

        let mut m = message("");
        m.headers = [
            ("x".to_string(), FieldValue::I32(1)),
            ("y".to_string(), FieldValue::I32(2)),
            ("z".to_string(), FieldValue::I32(3)),
        ]
        .into();
        assert!(message_matches(&m, 0, &t, &g));

        let mut partial = message("");
        partial.headers = [("x".to_string(), FieldValue::I32(1))].into();
        assert!(!message_matches(&partial, 0, &t, &g));
    }

    #[test]
    fn headers_any_requires_one_pair() {
        let t = topic(TopicKind::Headers);
        let g = group(vec![Binding {
            topic_name: "t".to_string(),
            by: BindingMatch::HeadersAny(
                [
                    ("x".to_string(), FieldValue::I32(1)),
                    ("y".to_string(), FieldValue::I32(2)),
                ]
                .into(),
            ),
        }]);

        let mut m = message("");
        m.headers = [("y".to_string(), FieldValue::I32(2))].into();
        assert!(message_matches(&m, 0, &t, &g));

        let mut wrong = message("");
        wrong.headers = [("y".to_string(), FieldValue::I32(9))].into();
        assert!(!message_matches(&wrong, 0, &t, &g));
    }

    #[test]
    fn since_cutoff_rejects_older_messages() {
        let t = topic(TopicKind::Fanout);
        let mut g = group(vec![Binding {
            topic_name: "t".to_string(),
            by: BindingMatch::Fanout,
        }]);
        g.since = 1_000;

        assert!(!message_matches(&message("k"), 999, &t, &g));
        assert!(message_matches(&message("k"), 1_000, &t, &g));
    }

    #[test]
    fn bindings_for_other_topics_are_ignored() {
        let t = topic(TopicKind::Direct);
        let g = group(vec![Binding {
            topic_name: "elsewhere".to_string(),
            by: BindingMatch::RoutingKey("rk".to_string()),
        }]);
        assert!(!message_matches(&message("rk"), 0, &t, &g));
    }
}
