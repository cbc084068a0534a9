// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-level facade owning every agent component.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator_service::{
    EventAggregatorService, LocalAggregator, TransactionAggregatorService,
};
use crate::config::AgentConfig;
use crate::decoder::decode;
use crate::errors::{ConfigError, DecodeError};
use crate::manager::{Dispatch, Manager};
use crate::message::MessageTree;
use crate::message_id::MessageIdFactory;
use crate::router::RouterConfig;
use crate::router_poller::RouterPoller;
use crate::sender::{SenderConfig, SenderHandle, SenderService};

struct Tasks {
    background: JoinSet<()>,
    aggregators: JoinSet<()>,
    sender: JoinHandle<()>,
}

pub struct CatAgent {
    config: Arc<AgentConfig>,
    router_config: Arc<RouterConfig>,
    ids: Arc<MessageIdFactory>,
    manager: Arc<Manager>,
    aggregator: LocalAggregator,
    sender: SenderHandle,
    shutting_down: AtomicBool,
    background_token: CancellationToken,
    aggregator_token: CancellationToken,
    sender_token: CancellationToken,
    tasks: Mutex<Option<Tasks>>,
}

impl CatAgent {
    /// Builds and starts every component. Must be called inside a tokio runtime.
    ///
    /// The routing table is seeded from `cat.routers` and then refreshed once from
    /// the control plane; startup fails when neither yields a usable address.
    pub async fn start(config: Arc<AgentConfig>) -> Result<Self, ConfigError> {
        let cat = &config.cat;
        let router_config = Arc::new(RouterConfig::new(cat.sample));
        if let Some(routers) = &cat.routers {
            router_config.update_routers(routers);
        }

        let poller = RouterPoller::new(cat, Arc::clone(&router_config))
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        if let Err(e) = poller.poll_once().await {
            warn!("Initial router config request failed: {}", e);
        }
        if router_config.routers().is_empty() {
            error!("No upstream routers available, the agent cannot start");
            return Err(ConfigError::NoRouters);
        }

        let ids = Arc::new(MessageIdFactory::new(cat.domain.as_str(), cat.ip_hex.as_str()));
        let (transactions, transaction_handle) =
            TransactionAggregatorService::new(Arc::clone(&ids));
        let (events, event_handle) = EventAggregatorService::new(Arc::clone(&ids));
        let aggregator = LocalAggregator::new(transaction_handle, event_handle);

        let (sender_service, sender) = SenderService::new(
            Arc::clone(&router_config),
            SenderConfig::new(
                &cat.hostname,
                &cat.ip,
                cat.normal_consumers(),
                cat.high_consumers(),
            ),
        );
        let manager = Arc::new(Manager::new(
            Arc::clone(&router_config),
            aggregator.clone(),
            sender.clone(),
        ));

        let background_token = CancellationToken::new();
        let aggregator_token = CancellationToken::new();
        let sender_token = CancellationToken::new();

        let sender_task = tokio::spawn(sender_service.run(sender_token.clone()));

        let sink: Arc<dyn Dispatch> = Arc::clone(&manager) as Arc<dyn Dispatch>;
        let mut aggregators = JoinSet::new();
        aggregators.spawn(transactions.run(Arc::clone(&sink), aggregator_token.clone()));
        aggregators.spawn(events.run(sink, aggregator_token.clone()));

        let mut background = JoinSet::new();
        background.spawn(Arc::clone(&ids).run_rollover(background_token.clone()));
        background.spawn(poller.run(background_token.clone()));

        info!(
            "Cat agent started, domain: {}, routers: {:?}",
            cat.domain,
            router_config.routers()
        );
        Ok(CatAgent {
            config: Arc::clone(&config),
            router_config,
            ids,
            manager,
            aggregator,
            sender,
            shutting_down: AtomicBool::new(false),
            background_token,
            aggregator_token,
            sender_token,
            tasks: Mutex::new(Some(Tasks {
                background,
                aggregators,
                sender: sender_task,
            })),
        })
    }

    /// Hands a tree to the dispatch path. Dropped while shutting down or while the
    /// control plane has disabled the agent.
    pub fn send(&self, tree: MessageTree) {
        if self.shutting_down.load(Ordering::Acquire) {
            debug!("Agent is shutting down, tree {} dropped", tree.message_id);
            return;
        }
        if !self.router_config.is_enabled() {
            return;
        }
        self.manager.dispatch(tree);
    }

    /// Decodes one ingest body and sends the resulting tree.
    pub fn handle_send_message(&self, body: &[u8]) -> Result<(), DecodeError> {
        let tree = decode(body, &self.ids)?;
        self.send(tree);
        Ok(())
    }

    #[must_use]
    pub fn create_message_id(&self, domain: &str) -> String {
        self.ids.next_id(domain)
    }

    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    #[must_use]
    pub fn router_config(&self) -> &Arc<RouterConfig> {
        &self.router_config
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Trees dropped by the sender queues.
    #[must_use]
    pub fn dropped_trees(&self) -> u64 {
        self.sender.dropped()
    }

    /// Observations dropped by the aggregator queues.
    #[must_use]
    pub fn dropped_observations(&self) -> u64 {
        self.aggregator.dropped()
    }

    /// Stops every component in dependency order. Aggregators flush into the sender
    /// before the sender drains. Calling it twice is a no-op.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut tasks) = tasks else {
            return;
        };
        info!("Cat agent shutting down");

        self.background_token.cancel();
        while let Some(result) = tasks.background.join_next().await {
            if let Err(e) = result {
                warn!("Background task failed: {}", e);
            }
        }

        self.aggregator_token.cancel();
        while let Some(result) = tasks.aggregators.join_next().await {
            if let Err(e) = result {
                warn!("Aggregator task failed: {}", e);
            }
        }

        self.sender_token.cancel();
        if let Err(e) = tasks.sender.await {
            warn!("Sender task failed: {}", e);
        }
        info!("Cat agent exit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CatConfig;

    fn config(routers: Option<&str>) -> Arc<AgentConfig> {
        let mut config = AgentConfig {
            cat: CatConfig {
                domain: "shop".to_string(),
                hostname: "host-1".to_string(),
                ip: "127.0.0.1".to_string(),
                // nothing listens on the discard port, the first poll fails fast
                servers: vec!["127.0.0.1:9".to_string()],
                routers: routers.map(str::to_string),
                sender_normal_queue_consumer_num: 1,
                sender_high_queue_consumer_num: 1,
                ..CatConfig::default()
            },
            ..AgentConfig::default()
        };
        config.validate().expect("valid config");
        Arc::new(config)
    }

    #[tokio::test]
    async fn test_start_without_routers_fails() {
        let result = CatAgent::start(config(None)).await;
        assert!(matches!(result, Err(ConfigError::NoRouters)));
    }

    #[tokio::test]
    async fn test_create_message_id_uses_home_prefix() {
        let agent = CatAgent::start(config(Some("127.0.0.1:9"))).await.expect("agent");
        let id = agent.create_message_id("shop");
        assert!(id.starts_with("shop-7f000001-"), "{id}");
        assert!(id.ends_with("-1"), "{id}");
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_after_shutdown_is_dropped() {
        let agent = CatAgent::start(config(Some("127.0.0.1:9"))).await.expect("agent");
        agent.shutdown().await;
        assert!(agent.is_shutting_down());
        agent
            .handle_send_message(b"shop\tg\t1\tmain\t\t\t\nE\tSys\tboot\t0\t1\t\t\n")
            .expect("decodes");
        assert_eq!(agent.dropped_trees(), 0);
        // second call returns immediately
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_handle_send_message_rejects_bad_body() {
        let agent = CatAgent::start(config(Some("127.0.0.1:9"))).await.expect("agent");
        let result = agent.handle_send_message(b"shop\tg\t1\tmain\t\t\t\nT\tURL\t/\t0\t1\t\t\n");
        assert!(matches!(result, Err(DecodeError::UnmatchedClose(_))));
        agent.shutdown().await;
    }
}
