// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Live routing state shared by the dispatch path.
//!
//! The sample ratio and enable flag are single scalars kept in atomics. The routing
//! table lives in a `watch` channel: readers borrow the current table, and the sender
//! supervisor subscribes to be woken whenever it changes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::constants::SAMPLE_EPSILON;

pub type Routers = Arc<Vec<String>>;

pub struct RouterConfig {
    sample: AtomicU64,
    enabled: AtomicBool,
    routers: watch::Sender<Routers>,
}

impl RouterConfig {
    #[must_use]
    pub fn new(sample: f64) -> Self {
        let (routers, _) = watch::channel(Arc::new(Vec::new()));
        RouterConfig {
            sample: AtomicU64::new(sample.to_bits()),
            enabled: AtomicBool::new(true),
            routers,
        }
    }

    #[must_use]
    pub fn sample(&self) -> f64 {
        f64::from_bits(self.sample.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Current routing table.
    #[must_use]
    pub fn routers(&self) -> Routers {
        Arc::clone(&self.routers.borrow())
    }

    /// Receiver woken on every routing table change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Routers> {
        self.routers.subscribe()
    }

    /// Applies a `host:port;host:port` list. Returns whether the table changed.
    ///
    /// A list with no usable address is rejected and the current table kept.
    pub fn update_routers(&self, value: &str) -> bool {
        let resolved = resolve_server_addresses(value);
        if resolved.is_empty() {
            warn!("Ignoring router update with no usable address: {:?}", value);
            return false;
        }

        self.routers.send_if_modified(|current| {
            if **current == resolved {
                return false;
            }
            if current.is_empty() {
                info!("Routers initialized to {:?}", resolved);
            } else {
                info!("Routers changed to {:?}", resolved);
            }
            *current = Arc::new(resolved);
            true
        })
    }

    pub fn update_sample(&self, value: &str) {
        match value.trim().parse::<f64>() {
            Ok(sample) if sample.is_finite() => {
                if (sample - self.sample()).abs() > SAMPLE_EPSILON {
                    self.sample.store(sample.to_bits(), Ordering::Relaxed);
                    info!("Sample rate has been set to {}%", sample * 100.0);
                }
            }
            _ => warn!("Sample should be a valid float, {:?} given", value),
        }
    }

    /// `"false"` enables the agent, any other value disables it.
    pub fn update_block(&self, value: &str) {
        let enable = value == "false";
        if self.enabled.swap(enable, Ordering::Relaxed) != enable {
            if enable {
                info!("Agent has been enabled");
            } else {
                info!("Agent has been disabled");
            }
        }
    }
}

/// Splits `a:1;b:2` into addresses, skipping segments that are not `host:port`.
///
/// ```
/// use cat_agent::router::resolve_server_addresses;
///
/// assert_eq!(
///     resolve_server_addresses("10.0.0.1:2280;;bad;10.0.0.2:2280;"),
///     vec!["10.0.0.1:2280".to_string(), "10.0.0.2:2280".to_string()]
/// );
/// ```
#[must_use]
pub fn resolve_server_addresses(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|segment| !segment.is_empty() && segment.split(':').count() == 2)
        .map(str::to_string)
        .collect()
}
