// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Polls the control plane for routing, sampling and enable updates.
//!
//! The router endpoint answers a flat document of
//! `<property id="..." value="..."/>` elements inside `<property-config>`.

use std::sync::{Arc, OnceLock};

use rand::seq::SliceRandom;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CatConfig;
use crate::constants::{ROUTER_REQUEST_TIMEOUT, ROUTER_UPDATE_INTERVAL};
use crate::errors::RouterError;
use crate::router::RouterConfig;

const PROPERTY_SAMPLE: &str = "sample";
const PROPERTY_ROUTERS: &str = "routers";
const PROPERTY_BLOCK: &str = "block";

fn property_regex() -> &'static Regex {
    static PROPERTY: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    PROPERTY.get_or_init(|| {
        Regex::new(r"<property((?:[ \t\r\n][^>]*)?)>").expect("failed creating regex")
    })
}

fn attribute_regex() -> &'static Regex {
    static ATTRIBUTE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    ATTRIBUTE.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][A-Za-z0-9_.:-]*)[ \t\r\n]*=[ \t\r\n]*(?:"([^"]*)"|'([^']*)')"#)
            .expect("failed creating regex")
    })
}

/// Resolves the five predefined XML entities. Anything else is left as is.
fn unescape(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Extracts `(id, value)` pairs in document order. Attributes may come in any order
/// and use either quote style; elements missing `id` or `value` are skipped.
#[must_use]
pub fn parse_properties(body: &str) -> Vec<(String, String)> {
    property_regex()
        .captures_iter(body)
        .filter_map(|element| {
            let mut id = None;
            let mut value = None;
            for attribute in attribute_regex().captures_iter(&element[1]) {
                let raw = attribute
                    .get(2)
                    .or_else(|| attribute.get(3))
                    .map_or("", |m| m.as_str());
                match &attribute[1] {
                    "id" => id = Some(unescape(raw)),
                    "value" => value = Some(unescape(raw)),
                    _ => {}
                }
            }
            Some((id?, value?))
        })
        .collect()
}

pub struct RouterPoller {
    client: reqwest::Client,
    servers: Vec<String>,
    query: Vec<(&'static str, String)>,
    router_config: Arc<RouterConfig>,
}

impl RouterPoller {
    pub fn new(config: &CatConfig, router_config: Arc<RouterConfig>) -> Result<Self, RouterError> {
        let client = reqwest::Client::builder()
            .timeout(ROUTER_REQUEST_TIMEOUT)
            .build()
            .map_err(|source| RouterError::Http {
                server: String::new(),
                source,
            })?;
        Ok(RouterPoller {
            client,
            servers: config.servers.clone(),
            query: vec![
                ("env", config.env.clone()),
                ("domain", config.domain.clone()),
                ("ip", config.ip.clone()),
                ("hostname", config.hostname.clone()),
                ("op", "xml".to_string()),
            ],
            router_config,
        })
    }

    /// Asks the configured servers, in random order, until one answers, then applies
    /// every known property from its answer.
    pub async fn poll_once(&self) -> Result<(), RouterError> {
        let mut servers = self.servers.clone();
        servers.shuffle(&mut rand::thread_rng());

        for server in &servers {
            match self.fetch(server).await {
                Ok(body) => {
                    self.apply(&body);
                    return Ok(());
                }
                Err(e) => warn!("{}", e),
            }
        }
        Err(RouterError::AllServersFailed)
    }

    async fn fetch(&self, server: &str) -> Result<String, RouterError> {
        let url = format!("http://{server}/cat/s/router");
        info!("Getting router config from {}", url);
        let http_error = |source| RouterError::Http {
            server: server.to_string(),
            source,
        };

        let response = self
            .client
            .get(&url)
            .query(&self.query)
            .send()
            .await
            .map_err(http_error)?;
        if !response.status().is_success() {
            return Err(RouterError::Status {
                server: server.to_string(),
                status: response.status().as_u16(),
            });
        }
        response.text().await.map_err(http_error)
    }

    fn apply(&self, body: &str) {
        let properties = parse_properties(body);
        if properties.is_empty() {
            warn!("Router config has no properties: {}", body);
        }
        for (id, value) in properties {
            match id.as_str() {
                PROPERTY_SAMPLE => self.router_config.update_sample(&value),
                PROPERTY_ROUTERS => {
                    self.router_config.update_routers(&value);
                }
                PROPERTY_BLOCK => self.router_config.update_block(&value),
                other => debug!("Ignoring router property {}", other),
            }
        }
    }

    /// Polls every minute until cancelled. The first poll is expected to have been
    /// done synchronously at startup.
    pub async fn run(self, cancel_token: CancellationToken) {
        let mut interval = tokio::time::interval(ROUTER_UPDATE_INTERVAL);
        // first tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!("Failed to refresh router config: {}", e);
                    }
                }
                () = cancel_token.cancelled() => break,
            }
        }
        debug!("Router poller stopped");
    }
}
