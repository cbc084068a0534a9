// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Status value meaning success. Anything else is a failure.
pub const SUCCESS: &str = "0";

/// Protocol tag leading every upstream record.
pub const BINARY_PROTOCOL: &[u8; 3] = b"NT1";

pub const TYPE_SYSTEM: &str = "System";
pub const NAME_TRANSACTION_AGGREGATOR: &str = "TransactionAggregator";
pub const NAME_EVENT_AGGREGATOR: &str = "EventAggregator";

pub const BATCH_FLAG: char = '@';
pub const BATCH_SPLIT: char = ';';

pub const AGENT_THREAD_GROUP: &str = "cat-agent-group";
pub const AGENT_THREAD_NAME: &str = "cat-agent";

pub const DEFAULT_HOSTNAME: &str = "UnknownHost";
pub const DEFAULT_ENV: &str = "dev";
pub const DEFAULT_IP: &str = "127.0.0.1";
pub const DEFAULT_IP_HEX: &str = "7f000001";

pub const DEFAULT_CONSUMER_NUM: usize = 10;
pub const NORMAL_QUEUE_SIZE: usize = 50_000;
pub const HIGH_QUEUE_SIZE: usize = 50_000;
pub const CONSUMER_BATCH_SIZE: usize = 150;
pub const CONSUMER_TICK: Duration = Duration::from_secs(1);

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const WRITE_DEADLINE: Duration = Duration::from_secs(1);
pub const CONNECTION_MAX_AGE: Duration = Duration::from_secs(10 * 60);
pub const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
pub const BACKOFF_MAX: Duration = Duration::from_secs(5);

pub const AGGREGATOR_QUEUE_SIZE: usize = 1000;
pub const AGGREGATOR_TICK: Duration = Duration::from_secs(3);

pub const ROUTER_UPDATE_INTERVAL: Duration = Duration::from_secs(60);
pub const ROUTER_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:2280";
pub const DEFAULT_SERVER_TIMEOUT_MILLIS: u64 = 5000;

/// Ratios below this never hit the sampler.
pub const SAMPLE_EPSILON: f64 = 1e-9;
