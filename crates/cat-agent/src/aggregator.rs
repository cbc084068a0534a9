// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tumbling-window aggregate tables.
//!
//! Tables are keyed by domain, then by `(type, name)`. They are owned by a single
//! consumer task and cleared entirely on every flush.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::constants::{
    BATCH_FLAG, BATCH_SPLIT, NAME_EVENT_AGGREGATOR, NAME_TRANSACTION_AGGREGATOR, SUCCESS,
    TYPE_SYSTEM,
};
use crate::message::{Message, MessageBase, MessageTree};
use crate::message_id::MessageIdFactory;

const MAX_BUCKET_MS: i64 = 3_600_000;

/// Buckets a duration in milliseconds. Resolution coarsens as durations grow so the
/// histogram stays small.
#[must_use]
pub fn compute_duration(ms: i64) -> i64 {
    match ms {
        i64::MIN..=0 => 1,
        1..=19 => ms,
        20..=199 => ms - ms % 5,
        200..=499 => ms - ms % 20,
        500..=1999 => ms - ms % 50,
        2000..=19_999 => ms - ms % 500,
        20_000..=999_999 => ms - ms % 10_000,
        _ => {
            let mut step: i64 = 524_288;
            while step < ms && step < MAX_BUCKET_MS {
                step <<= 1;
            }
            step.min(MAX_BUCKET_MS)
        }
    }
}

/// One observed message, reduced to what the aggregates need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub domain: Arc<str>,
    pub r#type: String,
    pub name: String,
    pub success: bool,
    pub duration_micros: i64,
}

impl Observation {
    #[must_use]
    pub fn new(domain: Arc<str>, base: &MessageBase, duration_micros: i64) -> Self {
        Observation {
            domain,
            r#type: base.r#type.clone(),
            name: base.name.clone(),
            success: base.status == SUCCESS,
            duration_micros,
        }
    }
}

/// Per-key accumulator flushed as one summary child.
pub trait Aggregate: Default + Send + 'static {
    /// Name of the synthetic parent transaction.
    const NAME: &'static str;

    fn add(&mut self, observation: &Observation);

    fn encode(&self) -> String;

    fn summary(r#type: String, name: String, data: String, timestamp: i64) -> Message;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransactionData {
    count: u64,
    fail: u64,
    sum_ms: i64,
    durations: BTreeMap<i64, u64>,
}

impl Aggregate for TransactionData {
    const NAME: &'static str = NAME_TRANSACTION_AGGREGATOR;

    fn add(&mut self, observation: &Observation) {
        self.count = self.count.saturating_add(1);
        if !observation.success {
            self.fail = self.fail.saturating_add(1);
        }
        // durations come straight off the wire
        let ms = observation.duration_micros / 1000;
        self.sum_ms = self.sum_ms.saturating_add(ms);
        let occurrences = self.durations.entry(compute_duration(ms)).or_insert(0);
        *occurrences = occurrences.saturating_add(1);
    }

    /// `@count;fail;sumMs;bucket,n|bucket,n;`
    fn encode(&self) -> String {
        let mut out = format!(
            "{BATCH_FLAG}{}{BATCH_SPLIT}{}{BATCH_SPLIT}{}{BATCH_SPLIT}",
            self.count, self.fail, self.sum_ms
        );
        for (i, (bucket, occurrences)) in self.durations.iter().enumerate() {
            if i > 0 {
                out.push('|');
            }
            let _ = write!(out, "{bucket},{occurrences}");
        }
        out.push(BATCH_SPLIT);
        out
    }

    fn summary(r#type: String, name: String, data: String, timestamp: i64) -> Message {
        Message::transaction(MessageBase::new(r#type, name, SUCCESS, data, timestamp), 0)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EventData {
    count: u64,
    fail: u64,
}

impl Aggregate for EventData {
    const NAME: &'static str = NAME_EVENT_AGGREGATOR;

    fn add(&mut self, observation: &Observation) {
        self.count += 1;
        if !observation.success {
            self.fail += 1;
        }
    }

    /// `@count;fail`
    fn encode(&self) -> String {
        format!("{BATCH_FLAG}{}{BATCH_SPLIT}{}", self.count, self.fail)
    }

    fn summary(r#type: String, name: String, data: String, timestamp: i64) -> Message {
        Message::event(MessageBase::new(r#type, name, SUCCESS, data, timestamp))
    }
}

pub struct AggregateTable<A> {
    domains: HashMap<Arc<str>, HashMap<(String, String), A>>,
}

impl<A: Aggregate> Default for AggregateTable<A> {
    fn default() -> Self {
        AggregateTable {
            domains: HashMap::new(),
        }
    }
}

impl<A: Aggregate> AggregateTable<A> {
    pub fn add(&mut self, observation: &Observation) {
        self.domains
            .entry(Arc::clone(&observation.domain))
            .or_default()
            .entry((observation.r#type.clone(), observation.name.clone()))
            .or_default()
            .add(observation);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Empties the table, producing one system tree per domain.
    pub fn flush(&mut self, ids: &MessageIdFactory, now: i64) -> Vec<MessageTree> {
        self.domains
            .drain()
            .map(|(domain, buckets)| {
                let mut root = crate::message::Transaction {
                    base: MessageBase::new(TYPE_SYSTEM, A::NAME, SUCCESS, "", now),
                    children: Vec::with_capacity(buckets.len()),
                    duration_micros: 0,
                };
                for ((r#type, name), data) in buckets {
                    root.add_child(A::summary(r#type, name, data.encode(), now));
                }
                let message_id = ids.next_id(&domain);
                MessageTree::system(domain.as_ref(), message_id, Message::Transaction(root))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn observation(domain: &str, name: &str, success: bool, duration_micros: i64) -> Observation {
        Observation {
            domain: Arc::from(domain),
            r#type: "Sys".to_string(),
            name: name.to_string(),
            success,
            duration_micros,
        }
    }

    #[test]
    fn test_compute_duration_table() {
        assert_eq!(compute_duration(-5), 1);
        assert_eq!(compute_duration(0), 1);
        assert_eq!(compute_duration(19), 19);
        assert_eq!(compute_duration(37), 35);
        assert_eq!(compute_duration(499), 480);
        assert_eq!(compute_duration(1999), 1950);
        assert_eq!(compute_duration(19_999), 19_500);
        assert_eq!(compute_duration(999_999), 990_000);
        assert_eq!(compute_duration(1_000_000), 1_048_576);
        assert_eq!(compute_duration(2_000_000), 2_097_152);
        assert_eq!(compute_duration(3_000_000), 3_600_000);
        assert_eq!(compute_duration(50_000_000), 3_600_000);
    }

    #[test]
    fn test_transaction_encode() {
        let mut data = TransactionData::default();
        data.add(&observation("d", "op", false, 12_000));
        data.add(&observation("d", "op", true, 37_900));
        data.add(&observation("d", "op", true, 36_000));
        assert_eq!(data.encode(), "@3;1;85;12,1|35,2;");
    }

    #[test]
    fn test_transaction_sum_saturates_on_extreme_durations() {
        let mut data = TransactionData::default();
        for _ in 0..1001 {
            data.add(&observation("d", "op", true, i64::MAX));
        }
        data.add(&observation("d", "op", true, i64::MIN));
        assert_eq!(data.count, 1002);
        // i64::MIN / 1000 pulls the saturated sum back down
        assert_eq!(data.sum_ms, i64::MAX + i64::MIN / 1000);
        assert_eq!(data.durations.get(&MAX_BUCKET_MS), Some(&1001));
        assert_eq!(data.durations.get(&1), Some(&1));

        let mut data = TransactionData::default();
        for _ in 0..1001 {
            data.add(&observation("d", "op", true, i64::MAX));
        }
        assert_eq!(data.encode(), format!("@1001;0;{};{MAX_BUCKET_MS},1001;", i64::MAX));
    }

    #[test]
    fn test_event_encode() {
        let mut data = EventData::default();
        data.add(&observation("d", "e", true, 0));
        data.add(&observation("d", "e", false, 0));
        assert_eq!(data.encode(), "@2;1");
    }

    #[test]
    fn test_flush_builds_one_tree_per_domain() {
        let ids = MessageIdFactory::with_hour("home", "7f000001", 5);
        let mut table = AggregateTable::<TransactionData>::default();
        table.add(&observation("d", "op", false, 4_000));
        table.add(&observation("d", "op", true, 6_000));
        table.add(&observation("d", "other", true, 1_000));
        table.add(&observation("e", "op", true, 1_000));

        let mut trees = table.flush(&ids, 1234);
        assert!(table.is_empty());
        trees.sort_by(|a, b| a.domain.cmp(&b.domain));
        assert_eq!(trees.len(), 2);

        let tree = &trees[0];
        assert_eq!(tree.domain, "d");
        assert_eq!(tree.message_id, "d-7f000001-5-1");
        assert!(!tree.can_discard());
        let Message::Transaction(root) = &tree.message else {
            panic!("summary root should be a transaction");
        };
        assert_eq!(root.base.r#type, "System");
        assert_eq!(root.base.name, "TransactionAggregator");
        assert_eq!(root.base.timestamp, 1234);
        assert_eq!(root.children.len(), 2);
        let op = root
            .children
            .iter()
            .find(|c| c.base().name == "op")
            .expect("missing op summary");
        assert!(op.base().data.starts_with("@2;1;10;"));
        assert!(op.is_success());
    }

    #[test]
    fn test_event_flush_children_are_events() {
        let ids = MessageIdFactory::with_hour("home", "7f000001", 5);
        let mut table = AggregateTable::<EventData>::default();
        table.add(&observation("d", "e", true, 0));
        let trees = table.flush(&ids, 1);
        let Message::Transaction(root) = &trees[0].message else {
            panic!("summary root should be a transaction");
        };
        assert_eq!(root.base.name, "EventAggregator");
        assert_eq!(
            root.children,
            vec![Message::event(MessageBase::new("Sys", "e", "0", "@1;0", 1))]
        );
    }

    proptest! {
        #[test]
        fn prop_bucket_is_bounded_and_monotonic(a in 0i64..10_000_000, b in 0i64..10_000_000) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(compute_duration(lo) <= compute_duration(hi));
            prop_assert!(compute_duration(hi) <= MAX_BUCKET_MS);
            prop_assert!(compute_duration(hi) >= 1);
        }
    }
}
