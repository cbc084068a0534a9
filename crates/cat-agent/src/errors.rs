// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised while decoding an ingest body. The tree is discarded.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Header field {0} is missing")]
    MissingHeaderField(&'static str),

    #[error("Malformed message line at byte {0}")]
    MalformedLine(usize),

    #[error("Unknown message type {0:?}")]
    UnknownType(char),

    #[error("Close of {0} without an open transaction")]
    UnmatchedClose(String),

    #[error("Close of {close} does not match open transaction {open}")]
    MismatchedClose { open: String, close: String },

    #[error("Transaction {open} was never closed")]
    Unbalanced { open: String },

    #[error("Body contains no message")]
    EmptyTree,
}

/// Startup configuration errors. All of them are fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("cat.domain is required")]
    MissingDomain,

    #[error("cat.servers must list at least one router server")]
    MissingServers,

    #[error("{0} must not be negative")]
    NegativeConsumerNum(&'static str),

    #[error("No usable upstream router address")]
    NoRouters,
}

/// Errors from the control-plane router poll.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Router request to {server} failed: {source}")]
    Http {
        server: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Router server {server} answered status {status}")]
    Status { server: String, status: u16 },

    #[error("No router server answered")]
    AllServersFailed,
}

/// Inbound listener errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
