// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod logger;

use std::{env, path::PathBuf, process, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cat_agent::{agent::CatAgent, config::AgentConfig, server::Server};

const CONFIG_PATH_ENV: &str = "CAT_AGENT_CONFIG";
const LOG_LEVEL_ENV: &str = "CAT_AGENT_LOG_LEVEL";
const DEFAULT_CONFIG_PATH: &str = "cat-agent.yaml";

#[tokio::main]
pub async fn main() {
    let config_path = config_path(env::args().skip(1));
    let config = match AgentConfig::load(&config_path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("cat-agent: invalid configuration {}: {e}", config_path.display());
            process::exit(1);
        }
    };

    let log_level = env::var(LOG_LEVEL_ENV)
        .map(|val| val.to_lowercase())
        .unwrap_or_else(|_| config.log_level.to_lowercase());
    // reqwest and hyper are noisy below warn
    let env_filter = format!("h2=warn,hyper=warn,reqwest=warn,rustls=warn,{log_level}");
    let env_filter = match EnvFilter::try_new(&env_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("cat-agent: could not parse log level {log_level}: {e}");
            process::exit(1);
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .event_format(logger::Formatter::new())
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("cat-agent: setting default subscriber failed: {e}");
    }

    info!("Starting cat agent with config {}", config_path.display());
    let agent = match CatAgent::start(Arc::clone(&config)).await {
        Ok(agent) => Arc::new(agent),
        Err(e) => {
            error!("Failed to start cat agent: {}", e);
            process::exit(1);
        }
    };

    let server = match Server::bind(&config.server, Arc::clone(&agent)).await {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            agent.shutdown().await;
            process::exit(1);
        }
    };
    let server_token = CancellationToken::new();
    let server_task = tokio::spawn(server.serve(server_token.clone()));

    wait_for_signal().await;
    info!("Received shutdown signal");

    server_token.cancel();
    if let Err(e) = server_task.await {
        error!("Server task failed: {}", e);
    }
    agent.shutdown().await;
    info!("Bye");
}

/// `--conf <file>` (or `-conf <file>`), else `CAT_AGENT_CONFIG`, else the default file.
fn config_path(mut args: impl Iterator<Item = String>) -> PathBuf {
    while let Some(arg) = args.next() {
        if let Some(path) = arg
            .strip_prefix("--conf=")
            .or_else(|| arg.strip_prefix("-conf="))
        {
            return PathBuf::from(path);
        }
        if arg == "--conf" || arg == "-conf" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
        }
    }
    env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
