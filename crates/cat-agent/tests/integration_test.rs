// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use cat_agent::agent::CatAgent;
use cat_agent::config::{AgentConfig, CatConfig, ServerConfig};
use cat_agent::server::Server;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const FAILED_TREE: &[u8] =
    b"shop\tgroup\t7\tmain\t\t\t\nt\tURL\t/checkout\t0\t100\t\t\nE\tSQL\terror\tERROR\t101\t\t\nT\tURL\t/checkout\tERROR\t100\t2500\t\n";
const OK_TREE: &[u8] =
    b"shop\tgroup\t7\tmain\t\t\t\nt\tURL\t/home\t0\t100\t\t\nE\tCache\thit\t0\t101\t\t\nT\tURL\t/home\t0\t100\t1200\t\n";

/// Stands in for an upstream collector, forwarding every received record.
async fn upstream() -> (String, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Ok(len) = stream.read_u32().await {
                    let mut record = vec![0; len as usize];
                    if stream.read_exact(&mut record).await.is_err() {
                        return;
                    }
                    let _ = tx.send(record);
                }
            });
        }
    });
    (addr, rx)
}

fn config(routers: &str, sample: f64) -> Arc<AgentConfig> {
    let mut config = AgentConfig {
        cat: CatConfig {
            domain: "shop".to_string(),
            hostname: "host-1".to_string(),
            ip: "10.0.0.1".to_string(),
            servers: vec!["127.0.0.1:9".to_string()],
            routers: Some(routers.to_string()),
            sample,
            sender_normal_queue_consumer_num: 1,
            sender_high_queue_consumer_num: 1,
            ..CatConfig::default()
        },
        server: ServerConfig {
            addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        },
        ..AgentConfig::default()
    };
    config.validate().unwrap();
    Arc::new(config)
}

async fn next_record(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no record received upstream")
        .expect("upstream closed")
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn request(cmd: u32, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&cmd.to_be_bytes());
    frame.extend_from_slice(&(8 + body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

async fn read_response(stream: &mut TcpStream) -> (u32, Vec<u8>) {
    let status = stream.read_u32().await.unwrap();
    let length = stream.read_u32().await.unwrap() as usize;
    let mut payload = vec![0; length - 8];
    stream.read_exact(&mut payload).await.unwrap();
    (status, payload)
}

#[tokio::test]
async fn test_failed_tree_reaches_upstream_through_server() {
    let (upstream_addr, mut records) = upstream().await;
    let config = config(&upstream_addr, 1.0);
    let agent = Arc::new(CatAgent::start(Arc::clone(&config)).await.unwrap());

    let server = Server::bind(&config.server, Arc::clone(&agent)).await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let server_token = CancellationToken::new();
    let server_task = tokio::spawn(server.serve(server_token.clone()));

    let mut client = TcpStream::connect(server_addr).await.unwrap();

    client.write_all(&request(1, b"shop")).await.unwrap();
    let (status, payload) = read_response(&mut client).await;
    assert_eq!(status, 0);
    let id = String::from_utf8(payload).unwrap();
    assert!(id.starts_with("shop-0a000001-"), "{id}");

    client.write_all(&request(1, b"")).await.unwrap();
    assert_eq!(read_response(&mut client).await, (4, Vec::new()));

    client.write_all(&request(42, b"")).await.unwrap();
    assert_eq!(read_response(&mut client).await, (3, Vec::new()));

    // fire-and-forget, followed by a request whose answer proves ordering
    client.write_all(&request(2, FAILED_TREE)).await.unwrap();
    client.write_all(&request(1, b"shop")).await.unwrap();
    let (status, _) = read_response(&mut client).await;
    assert_eq!(status, 0);

    let record = next_record(&mut records).await;
    assert!(record.starts_with(b"NT1"));
    assert!(contains(&record, b"/checkout"));
    assert!(contains(&record, b"host-1"));

    server_token.cancel();
    server_task.await.unwrap();
    agent.shutdown().await;
}

#[tokio::test]
async fn test_oversized_request_closes_connection() {
    let (upstream_addr, _records) = upstream().await;
    let config = config(&upstream_addr, 1.0);
    let agent = Arc::new(CatAgent::start(Arc::clone(&config)).await.unwrap());
    let server = Server::bind(&config.server, Arc::clone(&agent)).await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let server_token = CancellationToken::new();
    let server_task = tokio::spawn(server.serve(server_token.clone()));

    let mut client = TcpStream::connect(server_addr).await.unwrap();
    client
        .write_all(&[0, 0, 0, 2, 0xFF, 0xFF, 0xFF, 0xFF])
        .await
        .unwrap();
    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("server kept the connection open");
    assert!(matches!(read, Ok(0) | Err(_)));

    // the server keeps accepting
    let mut client = TcpStream::connect(server_addr).await.unwrap();
    client.write_all(&request(1, b"shop")).await.unwrap();
    assert_eq!(read_response(&mut client).await.0, 0);

    server_token.cancel();
    server_task.await.unwrap();
    agent.shutdown().await;
}

#[tokio::test]
async fn test_routing_change_moves_traffic() {
    let (first_addr, mut first) = upstream().await;
    let (second_addr, mut second) = upstream().await;
    let agent = CatAgent::start(config(&first_addr, 1.0)).await.unwrap();

    agent.handle_send_message(FAILED_TREE).unwrap();
    assert!(next_record(&mut first).await.starts_with(b"NT1"));

    assert!(agent.router_config().update_routers(&second_addr));
    // give the sender time to rebuild its consumer pool
    tokio::time::sleep(Duration::from_millis(300)).await;

    agent.handle_send_message(FAILED_TREE).unwrap();
    assert!(contains(&next_record(&mut second).await, b"/checkout"));
    assert!(first.try_recv().is_err());

    agent.shutdown().await;
}

#[tokio::test]
async fn test_unsampled_trees_are_summarized_on_shutdown() {
    let (upstream_addr, mut records) = upstream().await;
    let agent = CatAgent::start(config(&upstream_addr, 0.0)).await.unwrap();

    for _ in 0..5 {
        agent.handle_send_message(OK_TREE).unwrap();
    }
    agent.shutdown().await;

    let mut summaries = vec![next_record(&mut records).await, next_record(&mut records).await];
    summaries.sort_by_key(|r| !contains(r, b"TransactionAggregator"));
    assert!(contains(&summaries[0], b"TransactionAggregator"));
    assert!(contains(&summaries[0], b"@5;0;5;1,5;"));
    assert!(contains(&summaries[1], b"EventAggregator"));
    assert!(contains(&summaries[1], b"@5;0"));
    // raw trees never went upstream
    assert!(summaries.iter().all(|r| !contains(r, b"main")));
    assert!(records.try_recv().is_err());
}

#[tokio::test]
async fn test_disabled_agent_drops_trees() {
    let (upstream_addr, mut records) = upstream().await;
    let agent = CatAgent::start(config(&upstream_addr, 1.0)).await.unwrap();

    agent.router_config().update_block("true");
    agent.handle_send_message(FAILED_TREE).unwrap();
    agent.shutdown().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(records.try_recv().is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_server_replaces_stale_file() {
    use tokio::net::UnixStream;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cat-agent.sock");
    std::fs::write(&path, b"stale").unwrap();

    let (upstream_addr, _records) = upstream().await;
    let agent = Arc::new(CatAgent::start(config(&upstream_addr, 1.0)).await.unwrap());
    let server_config = ServerConfig {
        addr: format!("unix://{}", path.display()),
        ..ServerConfig::default()
    };
    let server = Server::bind(&server_config, Arc::clone(&agent)).await.unwrap();
    assert!(server.local_addr().is_none());
    let server_token = CancellationToken::new();
    let server_task = tokio::spawn(server.serve(server_token.clone()));

    let mut client = UnixStream::connect(&path).await.unwrap();
    client.write_all(&request(1, b"billing")).await.unwrap();
    let status = client.read_u32().await.unwrap();
    let length = client.read_u32().await.unwrap() as usize;
    let mut payload = vec![0; length - 8];
    client.read_exact(&mut payload).await.unwrap();
    assert_eq!(status, 0);
    assert!(payload.starts_with(b"billing-0a000001-"));

    drop(client);
    server_token.cancel();
    server_task.await.unwrap();
    assert!(!path.exists());
    agent.shutdown().await;
}
