//! Topic matching and subscription management
//!
//! Subscriptions are sharded by the first level of their filter. Filters
//! whose first level is a wildcard live in the dedicated `+` and `#` shards,
//! so a publish to topic `a/b` consults exactly three shards: `a`, `+` and
//! `#` (only the first for `$`-topics). Every shard is a [`TopicTrie`] owned
//! by the topic bucket its key hashes to; a bucket may own several shards.
//!
//! The index stores client identities and options only. Sessions hold the
//! filter strings, and each side resolves the other through its owning
//! store.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{
    is_literal_filter, topic_matches_filter, validate_topic_filter,
    validate_topic_filter_with_max_levels, validate_topic_name,
    validate_topic_name_with_max_levels, TopicLevel,
};

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;
use std::sync::Arc;

use crate::protocol::{QoS, SubscriptionOptions};

/// A subscription entry returned by a match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub client_id: Arc<str>,
    pub options: SubscriptionOptions,
}

/// Subscribers registered under one filter, keyed by client
pub type SubscriberSet = AHashMap<Arc<str>, SubscriptionOptions>;

/// Shard key of a topic filter: its first level
pub fn shard_key(filter: &str) -> &str {
    match filter.find('/') {
        Some(i) => &filter[..i],
        None => filter,
    }
}

/// Shards that may hold filters matching `topic`
pub fn match_shard_keys(topic: &str) -> SmallVec<[&str; 3]> {
    let mut keys = SmallVec::new();
    keys.push(shard_key(topic));
    // $-topics are never matched by wildcard-first filters
    if !topic.starts_with('$') {
        keys.push("+");
        keys.push("#");
    }
    keys
}

/// Per-bucket subscription index
#[derive(Debug, Default)]
pub struct TopicIndex {
    shards: AHashMap<CompactString, TopicTrie<SubscriberSet>>,
    subscriptions: usize,
}

impl TopicIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client_id` under `filter`, replacing its previous options.
    /// Returns true if the client was not yet subscribed to this filter.
    pub fn subscribe(
        &mut self,
        filter: &str,
        client_id: Arc<str>,
        options: SubscriptionOptions,
    ) -> bool {
        let shard = self
            .shards
            .entry(CompactString::new(shard_key(filter)))
            .or_default();
        let is_new = shard.entry(filter).insert(client_id, options).is_none();
        if is_new {
            self.subscriptions += 1;
        }
        is_new
    }

    /// Remove `client_id` from `filter`. Returns true if it was subscribed.
    pub fn unsubscribe(&mut self, filter: &str, client_id: &str) -> bool {
        let key = shard_key(filter);
        let Some(shard) = self.shards.get_mut(key) else {
            return false;
        };
        let Some(set) = shard.get_mut(filter) else {
            return false;
        };

        let removed = set.remove(client_id).is_some();
        if set.is_empty() {
            shard.remove(filter);
            if shard.is_empty() {
                self.shards.remove(key);
            }
        }
        if removed {
            self.subscriptions -= 1;
        }
        removed
    }

    /// Collect subscribers in shard `key` whose filter matches `topic`
    pub fn matches_in_shard(&self, key: &str, topic: &str, out: &mut Vec<Subscription>) {
        if let Some(shard) = self.shards.get(key) {
            shard.matches(topic, |set| {
                out.extend(set.iter().map(|(client_id, options)| Subscription {
                    client_id: client_id.clone(),
                    options: *options,
                }));
            });
        }
    }

    /// Collect subscribers for `topic` across every shard this index holds
    pub fn matches(&self, topic: &str) -> Vec<Subscription> {
        let mut out = Vec::new();
        for key in match_shard_keys(topic) {
            self.matches_in_shard(key, topic, &mut out);
        }
        out
    }

    /// Number of (filter, client) registrations
    pub fn len(&self) -> usize {
        self.subscriptions
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions == 0
    }
}

/// Aggregated subscription info for a single client during routing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSub {
    pub qos: QoS,
    pub retain_as_published: bool,
    pub subscription_ids: SmallVec<[u32; 2]>,
}

/// Deduplicate matches by client, keeping the highest granted QoS and
/// collecting every subscription identifier. Subscriptions flagged
/// `no_local` never receive their own client's publishes.
pub fn aggregate_matches(
    publisher: &str,
    matches: impl IntoIterator<Item = Subscription>,
) -> AHashMap<Arc<str>, ClientSub> {
    let mut client_subs: AHashMap<Arc<str>, ClientSub> = AHashMap::new();

    for sub in matches {
        let options = sub.options;
        if options.no_local && &*sub.client_id == publisher {
            continue;
        }

        if let Some(entry) = client_subs.get_mut(&sub.client_id) {
            if options.qos > entry.qos {
                entry.qos = options.qos;
            }
            if options.retain_as_published {
                entry.retain_as_published = true;
            }
            if let Some(id) = options.subscription_id {
                if !entry.subscription_ids.contains(&id) {
                    entry.subscription_ids.push(id);
                }
            }
        } else {
            let mut subscription_ids = SmallVec::new();
            if let Some(id) = options.subscription_id {
                subscription_ids.push(id);
            }
            client_subs.insert(
                sub.client_id,
                ClientSub {
                    qos: options.qos,
                    retain_as_published: options.retain_as_published,
                    subscription_ids,
                },
            );
        }
    }

    client_subs
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn client(id: &str) -> Arc<str> {
        Arc::from(id)
    }

    fn clients(subs: &[Subscription]) -> Vec<String> {
        let mut ids: Vec<String> = subs.iter().map(|s| s.client_id.to_string()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_shard_keys() {
        assert_eq!(shard_key("sensors/+/temp"), "sensors");
        assert_eq!(shard_key("+/temp"), "+");
        assert_eq!(shard_key("#"), "#");
        assert_eq!(shard_key("/a"), "");

        assert_eq!(match_shard_keys("sensors/a").as_slice(), &["sensors", "+", "#"]);
        assert_eq!(match_shard_keys("$SYS/uptime").as_slice(), &["$SYS"]);
    }

    #[test]
    fn test_subscribe_replaces_options() {
        let mut index = TopicIndex::new();
        assert!(index.subscribe("a/b", client("c1"), SubscriptionOptions::with_qos(QoS::AtMostOnce)));
        assert!(!index.subscribe("a/b", client("c1"), SubscriptionOptions::with_qos(QoS::ExactlyOnce)));
        assert_eq!(index.len(), 1);

        let matches = index.matches("a/b");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].options.qos, QoS::ExactlyOnce);
    }

    #[test]
    fn test_wildcard_shards() {
        let mut index = TopicIndex::new();
        index.subscribe("sensors/+/temp", client("dev-1"), SubscriptionOptions::default());
        index.subscribe("+/room1/temp", client("dev-2"), SubscriptionOptions::default());
        index.subscribe("#", client("dev-3"), SubscriptionOptions::default());
        index.subscribe("other/#", client("dev-4"), SubscriptionOptions::default());

        assert_eq!(
            clients(&index.matches("sensors/room1/temp")),
            vec!["dev-1", "dev-2", "dev-3"]
        );
        assert!(index.matches("$SYS/room1/temp").is_empty());
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn test_unsubscribe_drops_empty_shards() {
        let mut index = TopicIndex::new();
        index.subscribe("a/#", client("c1"), SubscriptionOptions::default());
        index.subscribe("a/#", client("c2"), SubscriptionOptions::default());

        assert!(index.unsubscribe("a/#", "c1"));
        assert!(!index.unsubscribe("a/#", "c1"));
        assert_eq!(clients(&index.matches("a/x")), vec!["c2"]);

        assert!(index.unsubscribe("a/#", "c2"));
        assert!(index.is_empty());
        assert!(index.shards.is_empty());
        assert!(!index.unsubscribe("missing/filter", "c2"));
    }

    #[test]
    fn test_aggregate_overlapping_subscriptions() {
        let subs = vec![
            Subscription {
                client_id: client("c1"),
                options: SubscriptionOptions {
                    subscription_id: Some(7),
                    ..SubscriptionOptions::with_qos(QoS::AtMostOnce)
                },
            },
            Subscription {
                client_id: client("c1"),
                options: SubscriptionOptions {
                    subscription_id: Some(9),
                    ..SubscriptionOptions::with_qos(QoS::ExactlyOnce)
                },
            },
            Subscription {
                client_id: client("pub"),
                options: SubscriptionOptions {
                    no_local: true,
                    ..SubscriptionOptions::with_qos(QoS::AtLeastOnce)
                },
            },
        ];

        let merged = aggregate_matches("pub", subs);
        assert_eq!(merged.len(), 1);
        let c1 = merged.get(&client("c1")).unwrap();
        assert_eq!(c1.qos, QoS::ExactlyOnce);
        assert_eq!(c1.subscription_ids.as_slice(), &[7, 9]);
    }

    fn level() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(String::new()),
            Just("a".to_string()),
            Just("b".to_string()),
            Just("$s".to_string()),
        ]
    }

    fn topic() -> impl Strategy<Value = String> {
        prop::collection::vec(level(), 1..5).prop_map(|levels| levels.join("/"))
    }

    fn filter() -> impl Strategy<Value = String> {
        let filter_level = prop_oneof![
            3 => level(),
            1 => Just("+".to_string()),
        ];
        (prop::collection::vec(filter_level, 0..5), any::<bool>()).prop_filter_map(
            "empty filter",
            |(mut levels, trailing_hash)| {
                if trailing_hash {
                    levels.push("#".to_string());
                }
                if levels.is_empty() {
                    None
                } else {
                    Some(levels.join("/"))
                }
            },
        )
    }

    proptest! {
        #[test]
        fn prop_index_agrees_with_level_rule(
            filters in prop::collection::vec(filter(), 1..12),
            topics in prop::collection::vec(topic(), 1..12),
        ) {
            let mut index = TopicIndex::new();
            for (i, f) in filters.iter().enumerate() {
                index.subscribe(f, Arc::from(format!("c{}", i)), SubscriptionOptions::default());
            }

            for t in &topics {
                let mut got = clients(&index.matches(t));
                got.dedup();
                let mut expected: Vec<String> = filters
                    .iter()
                    .enumerate()
                    .filter(|(_, f)| topic_matches_filter(t, f))
                    .map(|(i, _)| format!("c{}", i))
                    .collect();
                expected.sort();
                prop_assert_eq!(got, expected, "topic {:?}", t);
            }
        }

        #[test]
        fn prop_unsubscribe_restores_empty_index(filters in prop::collection::vec(filter(), 1..12)) {
            let mut index = TopicIndex::new();
            for f in &filters {
                index.subscribe(f, Arc::from("c"), SubscriptionOptions::default());
            }
            for f in &filters {
                index.unsubscribe(f, "c");
            }
            prop_assert!(index.is_empty());
            prop_assert!(index.shards.is_empty());
        }
    }
}
