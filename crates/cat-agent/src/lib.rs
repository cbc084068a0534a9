// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod aggregator;
pub mod aggregator_service;
pub mod config;
pub mod constants;
pub mod consumer;
pub mod decoder;
pub mod encoder;
pub mod errors;
pub mod manager;
pub mod message;
pub mod message_id;
pub mod router;
pub mod router_poller;
pub mod sender;
pub mod server;
pub mod util;
