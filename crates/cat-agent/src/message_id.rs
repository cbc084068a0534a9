// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Message-ID generation.
//!
//! IDs have the form `<domain>-<ipHex>-<hour>-<seq>`, where `hour` is the number of
//! whole hours since the unix epoch. The home domain uses one atomic counter and a
//! cached prefix; any other domain gets a lazily created counter in a shared map.
//! Every counter restarts at the top of each hour.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use hashbrown::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::util::now_millis;

const MILLIS_PER_HOUR: i64 = 3_600_000;

struct HourState {
    hour: i64,
    home_prefix: String,
    counters: HashMap<String, Arc<AtomicU32>>,
}

pub struct MessageIdFactory {
    domain: String,
    ip_hex: String,
    home_index: AtomicU32,
    state: RwLock<HourState>,
}

impl MessageIdFactory {
    #[must_use]
    pub fn new(domain: impl Into<String>, ip_hex: impl Into<String>) -> Self {
        Self::with_hour(domain, ip_hex, current_hour())
    }

    #[must_use]
    pub fn with_hour(domain: impl Into<String>, ip_hex: impl Into<String>, hour: i64) -> Self {
        let domain = domain.into();
        let ip_hex = ip_hex.into();
        let home_prefix = format!("{domain}-{ip_hex}-{hour}-");
        MessageIdFactory {
            domain,
            ip_hex,
            home_index: AtomicU32::new(0),
            state: RwLock::new(HourState {
                hour,
                home_prefix,
                counters: HashMap::new(),
            }),
        }
    }

    /// Returns a fresh ID for `domain`. Never fails; the domain is embedded verbatim.
    pub fn next_id(&self, domain: &str) -> String {
        // Counters are bumped under the read lock so a concurrent rollover can never
        // pair a new sequence number with a stale hour.
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if domain == self.domain {
            let seq = self.home_index.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            return format!("{}{}", state.home_prefix, seq);
        }

        if let Some(counter) = state.counters.get(domain) {
            let seq = counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            return self.format_id(domain, state.hour, seq);
        }
        drop(state);

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let counter = state
            .counters
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(AtomicU32::new(0)))
            .clone();
        let seq = counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        self.format_id(domain, state.hour, seq)
    }

    /// Moves to `hour`, resetting every counter and the cached home prefix.
    ///
    /// Returns `false` and leaves the counters untouched unless `hour` is later than
    /// the current one, so a sequence is never reissued within an hour.
    pub fn rollover(&self, hour: i64) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if hour <= state.hour {
            return false;
        }
        state.hour = hour;
        state.home_prefix = format!("{}-{}-{}-", self.domain, self.ip_hex, hour);
        self.home_index.store(0, Ordering::Relaxed);
        for counter in state.counters.values() {
            counter.store(0, Ordering::Relaxed);
        }
        debug!("Message id hour rolled over to {}", hour);
        true
    }

    #[must_use]
    pub fn hour(&self) -> i64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .hour
    }

    /// Fires at the top of every wall-clock hour until cancelled.
    ///
    /// The timer runs on the monotonic clock, so a wakeup can land just before the
    /// wall-clock boundary; in that case it sleeps again until the hour has advanced.
    pub async fn run_rollover(self: Arc<Self>, cancel_token: CancellationToken) {
        info!("Message id rollover timer started");
        loop {
            let wait = until_next_hour(now_millis());
            tokio::select! {
                () = tokio::time::sleep(wait) => {
                    let hour = current_hour();
                    if !self.rollover(hour) {
                        debug!("Woke up before hour {} ended, waiting again", hour);
                    }
                }
                () = cancel_token.cancelled() => break,
            }
        }
        debug!("Message id rollover timer stopped");
    }

    fn format_id(&self, domain: &str, hour: i64, seq: u32) -> String {
        format!("{}-{}-{}-{}", domain, self.ip_hex, hour, seq)
    }
}

#[must_use]
pub fn current_hour() -> i64 {
    now_millis() / MILLIS_PER_HOUR
}

fn until_next_hour(now_ms: i64) -> Duration {
    let elapsed = now_ms.rem_euclid(MILLIS_PER_HOUR);
    // The extra millisecond lands the wakeup inside the new hour.
    Duration::from_millis((MILLIS_PER_HOUR - elapsed) as u64 + 1)
}
