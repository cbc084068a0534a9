// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregator consumer tasks.
//!
//! Each aggregator owns a bounded queue drained by one task. Producers never block:
//! a full queue drops the observation with a warning. Every tick the task turns its
//! table into system trees and hands them back to the dispatch path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::{Aggregate, AggregateTable, EventData, Observation, TransactionData};
use crate::constants::{AGGREGATOR_QUEUE_SIZE, AGGREGATOR_TICK};
use crate::manager::Dispatch;
use crate::message::{Message, MessageTree, Transaction};
use crate::message_id::MessageIdFactory;
use crate::util::now_millis;

#[derive(Clone)]
pub struct AggregatorHandle {
    name: &'static str,
    tx: mpsc::Sender<Observation>,
    dropped: Arc<AtomicU64>,
}

impl AggregatorHandle {
    /// Queues an observation, dropping it when the queue is full or closed.
    pub fn observe(&self, observation: Observation) {
        match self.tx.try_send(observation) {
            Ok(()) => {}
            Err(TrySendError::Full(observation)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "{} queue is full, {},{} has been discarded",
                    self.name, observation.r#type, observation.name
                );
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("{} is shut down, observation discarded", self.name);
            }
        }
    }

    /// Observations lost to a full or closed queue.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct AggregatorService<A: Aggregate> {
    rx: mpsc::Receiver<Observation>,
    table: AggregateTable<A>,
    ids: Arc<MessageIdFactory>,
    tick: Duration,
}

pub type TransactionAggregatorService = AggregatorService<TransactionData>;
pub type EventAggregatorService = AggregatorService<EventData>;

impl<A: Aggregate> AggregatorService<A> {
    #[must_use]
    pub fn new(ids: Arc<MessageIdFactory>) -> (Self, AggregatorHandle) {
        Self::with_capacity(ids, AGGREGATOR_QUEUE_SIZE, AGGREGATOR_TICK)
    }

    #[must_use]
    pub fn with_capacity(
        ids: Arc<MessageIdFactory>,
        capacity: usize,
        tick: Duration,
    ) -> (Self, AggregatorHandle) {
        let (tx, rx) = mpsc::channel(capacity);
        let service = AggregatorService {
            rx,
            table: AggregateTable::default(),
            ids,
            tick,
        };
        let handle = AggregatorHandle {
            name: A::NAME,
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (service, handle)
    }

    /// Runs until cancelled, then drains whatever is still queued and flushes once more.
    pub async fn run(mut self, sink: Arc<dyn Dispatch>, cancel_token: CancellationToken) {
        info!("{} running", A::NAME);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + self.tick, self.tick);

        loop {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(observation) => self.table.add(&observation),
                    None => break,
                },
                _ = ticker.tick() => self.flush(sink.as_ref()),
                () = cancel_token.cancelled() => break,
            }
        }

        self.rx.close();
        while let Some(observation) = self.rx.recv().await {
            self.table.add(&observation);
        }
        self.flush(sink.as_ref());
        info!("{} exit", A::NAME);
    }

    #[cfg(test)]
    pub(crate) fn drain_queued(&mut self) -> Vec<Observation> {
        let mut queued = Vec::new();
        while let Ok(observation) = self.rx.try_recv() {
            queued.push(observation);
        }
        queued
    }

    fn flush(&mut self, sink: &dyn Dispatch) {
        if self.table.is_empty() {
            return;
        }
        for tree in self.table.flush(&self.ids, now_millis()) {
            debug!("{} flush, message id: {}", A::NAME, tree.message_id);
            sink.dispatch(tree);
        }
    }
}

/// Routes observations to the transaction and event aggregators.
#[derive(Clone)]
pub struct LocalAggregator {
    transactions: AggregatorHandle,
    events: AggregatorHandle,
}

impl LocalAggregator {
    #[must_use]
    pub fn new(transactions: AggregatorHandle, events: AggregatorHandle) -> Self {
        LocalAggregator {
            transactions,
            events,
        }
    }

    /// Aggregates the root message and all of its descendants.
    pub fn aggregate(&self, tree: &MessageTree) {
        let domain: Arc<str> = Arc::from(tree.domain.as_str());
        self.observe(&domain, &tree.message);
    }

    /// Aggregates only the descendants of the root message.
    pub fn aggregate_children(&self, tree: &MessageTree) {
        if let Message::Transaction(root) = &tree.message {
            let domain: Arc<str> = Arc::from(tree.domain.as_str());
            for child in &root.children {
                self.observe(&domain, child);
            }
        }
    }

    fn observe(&self, domain: &Arc<str>, message: &Message) {
        match message {
            Message::Transaction(t) => self.observe_transaction(domain, t),
            Message::Event(base) => self
                .events
                .observe(Observation::new(Arc::clone(domain), base, 0)),
            Message::Heartbeat(_) => {}
        }
    }

    fn observe_transaction(&self, domain: &Arc<str>, transaction: &Transaction) {
        self.transactions.observe(Observation::new(
            Arc::clone(domain),
            &transaction.base,
            transaction.duration_micros,
        ));
        for child in &transaction.children {
            self.observe(domain, child);
        }
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.transactions.dropped() + self.events.dropped()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::message::MessageBase;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    #[derive(Default)]
    pub(crate) struct CollectingSink {
        pub(crate) trees: Mutex<Vec<MessageTree>>,
    }

    impl Dispatch for CollectingSink {
        fn dispatch(&self, tree: MessageTree) {
            self.trees.lock().unwrap().push(tree);
        }
    }

    fn ids() -> Arc<MessageIdFactory> {
        Arc::new(MessageIdFactory::with_hour("home", "7f000001", 1))
    }

    fn tree_with_children() -> MessageTree {
        let mut root = Transaction {
            base: MessageBase::new("URL", "/a", "0", "", 1),
            children: Vec::new(),
            duration_micros: 5_000,
        };
        root.add_child(Message::event(MessageBase::new("Cache", "miss", "0", "", 2)));
        let mut sql = Transaction {
            base: MessageBase::new("SQL", "select", "ERR", "", 3),
            children: Vec::new(),
            duration_micros: 2_000,
        };
        sql.add_child(Message::event(MessageBase::new("Cache", "miss", "1", "", 4)));
        root.add_child(Message::Transaction(sql));
        MessageTree::new("d", "id", Message::Transaction(root))
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_flushes() {
        let (service, handle) =
            TransactionAggregatorService::with_capacity(ids(), 16, Duration::from_secs(3600));
        let sink = Arc::new(CollectingSink::default());
        let cancel = CancellationToken::new();

        handle.observe(Observation {
            domain: Arc::from("d"),
            r#type: "Sys".to_string(),
            name: "op".to_string(),
            success: false,
            duration_micros: 1_000,
        });
        handle.observe(Observation {
            domain: Arc::from("d"),
            r#type: "Sys".to_string(),
            name: "op".to_string(),
            success: true,
            duration_micros: 3_000,
        });

        cancel.cancel();
        service.run(sink.clone(), cancel).await;

        let trees = sink.trees.lock().unwrap();
        assert_eq!(trees.len(), 1);
        let Message::Transaction(root) = &trees[0].message else {
            panic!("summary should be a transaction");
        };
        assert_eq!(root.children.len(), 1);
        assert!(root.children[0].base().data.starts_with("@2;1;4;"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush() {
        let (service, handle) =
            EventAggregatorService::with_capacity(ids(), 16, Duration::from_secs(3));
        let sink = Arc::new(CollectingSink::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(service.run(sink.clone(), cancel.clone()));

        handle.observe(Observation {
            domain: Arc::from("d"),
            r#type: "Cache".to_string(),
            name: "miss".to_string(),
            success: true,
            duration_micros: 0,
        });
        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(sink.trees.lock().unwrap().len(), 1);

        // nothing new, so the next tick produces nothing
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(sink.trees.lock().unwrap().len(), 1);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(sink.trees.lock().unwrap().len(), 1);
    }

    #[test]
    #[traced_test]
    fn test_full_queue_drops() {
        let (_service, handle) =
            TransactionAggregatorService::with_capacity(ids(), 1, Duration::from_secs(3));
        let observation = Observation {
            domain: Arc::from("d"),
            r#type: "Sys".to_string(),
            name: "op".to_string(),
            success: true,
            duration_micros: 0,
        };
        handle.observe(observation.clone());
        handle.observe(observation);
        assert_eq!(handle.dropped(), 1);
        assert!(logs_contain("queue is full"));
    }

    #[test]
    fn test_local_aggregator_walks_tree() {
        let (mut transactions, t_handle) =
            TransactionAggregatorService::with_capacity(ids(), 16, Duration::from_secs(3));
        let (mut events, e_handle) =
            EventAggregatorService::with_capacity(ids(), 16, Duration::from_secs(3));
        let local = LocalAggregator::new(t_handle, e_handle);

        local.aggregate(&tree_with_children());
        let names: Vec<_> = transactions.drain_queued().into_iter().map(|o| o.name).collect();
        assert_eq!(names, vec!["/a", "select"]);
        let queued_events = events.drain_queued();
        assert_eq!(queued_events.len(), 2);
        assert!(queued_events.iter().all(|o| o.name == "miss"));
        assert_eq!(queued_events.iter().filter(|o| !o.success).count(), 1);

        local.aggregate_children(&tree_with_children());
        let names: Vec<_> = transactions.drain_queued().into_iter().map(|o| o.name).collect();
        assert_eq!(names, vec!["select"]);
    }
}
