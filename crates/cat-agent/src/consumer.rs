// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One upstream worker: batches trees from its queue and writes them, length-framed,
//! over a private TCP connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::{
    BACKOFF_INITIAL, BACKOFF_MAX, CONNECTION_MAX_AGE, CONNECT_TIMEOUT, CONSUMER_BATCH_SIZE,
    CONSUMER_TICK, WRITE_DEADLINE,
};
use crate::encoder::BinaryEncoder;
use crate::message::MessageTree;
use crate::sender::{SenderConfig, SharedQueue};

struct Connection {
    stream: TcpStream,
    established: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connect {
    /// Retry with backoff until connected or cancelled.
    Blocking,
    /// One attempt only.
    NonBlocking,
}

pub struct Consumer {
    name: String,
    server: String,
    queue: SharedQueue,
    encoder: BinaryEncoder,
    batch: Vec<MessageTree>,
    out: Vec<u8>,
    connection: Option<Connection>,
    shutting_down: Arc<AtomicBool>,
    cancel_token: CancellationToken,
}

impl Consumer {
    #[must_use]
    pub fn new(
        name: String,
        server: String,
        queue: SharedQueue,
        config: &SenderConfig,
        shutting_down: Arc<AtomicBool>,
        cancel_token: CancellationToken,
    ) -> Self {
        Consumer {
            name,
            server,
            queue,
            encoder: BinaryEncoder::new(Arc::clone(&config.hostname), Arc::clone(&config.ip)),
            batch: Vec::with_capacity(CONSUMER_BATCH_SIZE),
            out: Vec::new(),
            connection: None,
            shutting_down,
            cancel_token,
        }
    }

    pub async fn run(mut self) {
        info!("Consumer {} running", self.name);
        let mut ticker = tokio::time::interval(CONSUMER_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                received = recv(&self.queue) => match received {
                    Some(tree) => {
                        self.batch.push(tree);
                        if self.batch.len() >= CONSUMER_BATCH_SIZE {
                            self.flush(Connect::Blocking).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => self.flush(Connect::Blocking).await,
            }
        }

        if self.shutting_down.load(Ordering::Acquire) {
            self.drain().await;
        }
        self.flush(Connect::NonBlocking).await;
        if !self.batch.is_empty() {
            warn!(
                "Consumer {} could not reach {}, {} trees dropped",
                self.name,
                self.server,
                self.batch.len()
            );
        }
        if let Some(mut connection) = self.connection.take() {
            let _ = connection.stream.shutdown().await;
        }
        info!("Consumer {} exit", self.name);
    }

    /// Moves everything still queued through the connection without blocking on
    /// connect. Used only when the whole sender is shutting down.
    async fn drain(&mut self) {
        loop {
            let next = self.queue.lock().await.try_recv();
            let Ok(tree) = next else {
                break;
            };
            self.batch.push(tree);
            if self.batch.len() >= CONSUMER_BATCH_SIZE {
                self.flush(Connect::NonBlocking).await;
                if !self.batch.is_empty() {
                    // upstream unreachable, stop draining
                    break;
                }
            }
        }
    }

    async fn flush(&mut self, mode: Connect) {
        if self.batch.is_empty() {
            return;
        }
        if !self.connect(mode).await {
            return;
        }
        let Some(connection) = self.connection.as_mut() else {
            return;
        };

        debug!("Consumer {} flush {} trees", self.name, self.batch.len());
        self.out.clear();
        for tree in self.batch.drain(..) {
            self.encoder.encode_framed(&tree, &mut self.out);
        }

        match tokio::time::timeout(WRITE_DEADLINE, connection.stream.write_all(&self.out)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    "Consumer {} write error: {}, connection has been dropped",
                    self.name, e
                );
                self.connection = None;
            }
            Err(_) => {
                warn!(
                    "Consumer {} write deadline exceeded, connection has been dropped",
                    self.name
                );
                self.connection = None;
            }
        }
    }

    /// Ensures a fresh connection. Returns false when none could be made, which in
    /// blocking mode only happens on cancellation.
    async fn connect(&mut self, mode: Connect) -> bool {
        if let Some(connection) = &self.connection {
            if connection.established.elapsed() < CONNECTION_MAX_AGE {
                return true;
            }
            debug!("Consumer {} recycling connection to {}", self.name, self.server);
        }
        self.connection = None;

        let mut delay = BACKOFF_INITIAL;
        loop {
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.server)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    self.connection = Some(Connection {
                        stream,
                        established: Instant::now(),
                    });
                    return true;
                }
                Ok(Err(e)) => {
                    if mode == Connect::NonBlocking {
                        debug!("Consumer {} dial to {} failed: {}", self.name, self.server, e);
                        return false;
                    }
                    error!(
                        "Consumer {} dial to {} error: {}, retrying in {:?}",
                        self.name, self.server, e, delay
                    );
                }
                Err(_) => {
                    if mode == Connect::NonBlocking {
                        return false;
                    }
                    error!(
                        "Consumer {} dial to {} timed out, retrying in {:?}",
                        self.name, self.server, delay
                    );
                }
            }

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancel_token.cancelled() => return false,
            }
            delay = next_backoff(delay);
        }
    }
}

fn next_backoff(delay: Duration) -> Duration {
    (delay * 2).min(BACKOFF_MAX)
}

async fn recv(queue: &SharedQueue) -> Option<MessageTree> {
    queue.lock().await.recv().await
}
