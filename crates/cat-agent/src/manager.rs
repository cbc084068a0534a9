// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sampling and dispatch.
//!
//! Every tree, whether decoded from a client or produced by an aggregator, enters
//! through [`Manager::dispatch`]. A discardable tree that misses the sampler is folded
//! into the local aggregates; anything else is offered to the upstream sender.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::aggregator_service::LocalAggregator;
use crate::constants::SAMPLE_EPSILON;
use crate::message::MessageTree;
use crate::router::RouterConfig;
use crate::sender::SenderHandle;

/// Entry point for trees on their way upstream.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, tree: MessageTree);
}

pub struct Manager {
    router_config: Arc<RouterConfig>,
    aggregator: LocalAggregator,
    sender: SenderHandle,
    sample_count: AtomicU64,
}

impl Manager {
    #[must_use]
    pub fn new(
        router_config: Arc<RouterConfig>,
        aggregator: LocalAggregator,
        sender: SenderHandle,
    ) -> Self {
        Manager {
            router_config,
            aggregator,
            sender,
            sample_count: AtomicU64::new(0),
        }
    }

    /// Deterministic round-robin sampler: with ratio `r`, every `floor(1/r)`-th call hits.
    pub fn hit_sample(&self) -> bool {
        let ratio = self.router_config.sample();
        if ratio >= 1.0 {
            return true;
        }
        if ratio < SAMPLE_EPSILON {
            return false;
        }
        let count = self.sample_count.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let every = ((1.0 / ratio) as u64).max(1);
        count % every == 0
    }
}

impl Dispatch for Manager {
    fn dispatch(&self, tree: MessageTree) {
        if tree.can_discard() && !self.hit_sample() {
            trace!("Aggregating tree {}", tree.message_id);
            self.aggregator.aggregate(&tree);
            return;
        }

        // Children of forwarded trees still feed the local aggregates. Agent-generated
        // summaries are excluded so they never re-enter aggregation.
        if !tree.is_system() {
            self.aggregator.aggregate_children(&tree);
        }
        self.sender.offer(tree);
    }
}
