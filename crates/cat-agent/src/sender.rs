// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Upstream dispatcher.
//!
//! Trees wait in one of two bounded queues: `normal` for successful roots and `high`
//! for failed ones. A pool of [`Consumer`]s per upstream address drains them. The
//! supervisor in [`SenderService::run`] rebuilds the whole pool whenever the routing
//! table changes; queued trees survive the rebuild.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::consumer::Consumer;
use crate::constants::{HIGH_QUEUE_SIZE, NORMAL_QUEUE_SIZE};
use crate::message::MessageTree;
use crate::router::{RouterConfig, Routers};

/// Receiving half shared by every consumer of one queue class.
pub type SharedQueue = Arc<Mutex<mpsc::Receiver<MessageTree>>>;

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub hostname: Arc<str>,
    pub ip: Arc<str>,
    pub normal_consumers: usize,
    pub high_consumers: usize,
}

impl SenderConfig {
    #[must_use]
    pub fn new(hostname: &str, ip: &str, normal_consumers: usize, high_consumers: usize) -> Self {
        SenderConfig {
            hostname: Arc::from(hostname),
            ip: Arc::from(ip),
            normal_consumers,
            high_consumers,
        }
    }
}

#[derive(Clone)]
pub struct SenderHandle {
    normal: mpsc::Sender<MessageTree>,
    high: mpsc::Sender<MessageTree>,
    shutting_down: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl SenderHandle {
    /// Enqueues without blocking. Trees are dropped when the sender is shutting down
    /// or the target queue is full.
    pub fn offer(&self, tree: MessageTree) {
        if self.shutting_down.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let (queue, name) = if tree.message.is_success() {
            (&self.normal, "normal")
        } else {
            (&self.high, "high")
        };
        match queue.try_send(tree) {
            Ok(()) => {}
            Err(TrySendError::Full(tree)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Sender {} queue is full, tree {} has been discarded",
                    name, tree.message_id
                );
            }
            Err(TrySendError::Closed(tree)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Sender {} queue is closed, tree {} dropped", name, tree.message_id);
            }
        }
    }

    #[must_use]
    pub fn normal_len(&self) -> usize {
        self.normal.max_capacity() - self.normal.capacity()
    }

    #[must_use]
    pub fn high_len(&self) -> usize {
        self.high.max_capacity() - self.high.capacity()
    }

    /// Trees lost to a full queue or to shutdown.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct SenderService {
    router_config: Arc<RouterConfig>,
    config: SenderConfig,
    normal: SharedQueue,
    high: SharedQueue,
    shutting_down: Arc<AtomicBool>,
}

impl SenderService {
    #[must_use]
    pub fn new(router_config: Arc<RouterConfig>, config: SenderConfig) -> (Self, SenderHandle) {
        Self::with_capacity(router_config, config, NORMAL_QUEUE_SIZE, HIGH_QUEUE_SIZE)
    }

    #[must_use]
    pub fn with_capacity(
        router_config: Arc<RouterConfig>,
        config: SenderConfig,
        normal_capacity: usize,
        high_capacity: usize,
    ) -> (Self, SenderHandle) {
        let (normal_tx, normal_rx) = mpsc::channel(normal_capacity);
        let (high_tx, high_rx) = mpsc::channel(high_capacity);
        let shutting_down = Arc::new(AtomicBool::new(false));

        let service = SenderService {
            router_config,
            config,
            normal: Arc::new(Mutex::new(normal_rx)),
            high: Arc::new(Mutex::new(high_rx)),
            shutting_down: Arc::clone(&shutting_down),
        };
        let handle = SenderHandle {
            normal: normal_tx,
            high: high_tx,
            shutting_down,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (service, handle)
    }

    /// Supervises the consumer pool until `cancel_token` fires, restarting it on every
    /// routing table change. On exit the consumers drain both queues.
    pub async fn run(self, cancel_token: CancellationToken) {
        info!("Sender running");
        let mut routers_rx = self.router_config.subscribe();
        let mut router_open = true;

        loop {
            // Marks the current table as seen, so a change that lands while the pool
            // is starting still wakes the next wait.
            let routers = Arc::clone(&routers_rx.borrow_and_update());
            let generation = CancellationToken::new();
            let mut consumers = self.spawn_consumers(&routers, &generation);

            let restart = tokio::select! {
                changed = routers_rx.changed(), if router_open => {
                    if changed.is_err() {
                        router_open = false;
                    }
                    true
                }
                () = cancel_token.cancelled() => false,
            };

            if !restart {
                self.shutting_down.store(true, Ordering::Release);
            }
            generation.cancel();
            while let Some(result) = consumers.join_next().await {
                if let Err(e) = result {
                    warn!("Sender consumer task failed: {}", e);
                }
            }

            if !restart {
                break;
            }
            info!("Routers changed, sender restarted");
        }
        info!("Sender exit");
    }

    fn spawn_consumers(&self, routers: &Routers, generation: &CancellationToken) -> JoinSet<()> {
        let mut consumers = JoinSet::new();
        if routers.is_empty() {
            warn!("No upstream routers, sender is idle");
        }
        for router in routers.iter() {
            let classes = [
                ("normal", &self.normal, self.config.normal_consumers),
                ("high", &self.high, self.config.high_consumers),
            ];
            for (class, queue, count) in classes {
                for id in 0..count {
                    let consumer = Consumer::new(
                        format!("{class}-{router}-{id}"),
                        router.clone(),
                        Arc::clone(queue),
                        &self.config,
                        Arc::clone(&self.shutting_down),
                        generation.clone(),
                    );
                    consumers.spawn(consumer.run());
                }
            }
        }
        consumers
    }
}
