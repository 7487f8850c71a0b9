use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gateway::config::{EndpointConfig, PoolConfig};
use gateway::transport::tcp::{Request, Response};
use gateway::transport::TcpTransport;
use gateway::{GateError, MessageBody, PushResult, ServiceNode};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Backend that answers pushes after `delay`, stamping every result with the
/// number of the push request it belongs to.
async fn slow_backend(delay: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let requests = Arc::new(AtomicU32::new(0));

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let requests = Arc::clone(&requests);
            tokio::spawn(async move {
                let (reader, mut writer) = socket.into_split();
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let reply = match serde_json::from_str::<Request>(&line).unwrap() {
                        Request::Echo { payload } => Response::Echo { payload },
                        Request::Push { msgs, .. } => {
                            let n = requests.fetch_add(1, Ordering::SeqCst) + 1;
                            tokio::time::sleep(delay).await;
                            Response::Pushed {
                                results: msgs.iter().map(|_| PushResult::accepted(0, n)).collect(),
                            }
                        }
                    };
                    let mut out = serde_json::to_string(&reply).unwrap();
                    out.push('\n');
                    if writer.write_all(out.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    address
}

fn node(address: String, max_concurrent: usize) -> ServiceNode<TcpTransport> {
    let pool = PoolConfig {
        max_connections: 1,
        max_concurrent,
        checkout_timeout_ms: Some(3000),
    };
    ServiceNode::new(&EndpointConfig::new("slow", address), Arc::new(TcpTransport::default()), &pool)
}

fn msgs() -> Vec<MessageBody> {
    vec![MessageBody::new("room", "hello")]
}

#[tokio::test]
async fn test_abandoned_push_does_not_leak_reply() {
    let node = node(slow_backend(Duration::from_millis(100)).await, 1);

    let abandoned = tokio::time::timeout(Duration::from_millis(20), node.push("alice", &msgs())).await;
    assert!(abandoned.is_err());

    // The first reply belongs to the dropped request; this push must see
    // its own.
    let results = node.push("alice", &msgs()).await.unwrap();
    assert_eq!(results[0].sequence, 2);
    assert_eq!(node.pool().len(), 1);
}

#[tokio::test]
async fn test_shared_client_refuses_requests_after_abandoned_one() {
    let node = Arc::new(node(slow_backend(Duration::from_millis(100)).await, 2));

    let first = {
        let node = Arc::clone(&node);
        tokio::spawn(async move { node.push("alice", &msgs()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Shares the busy client and queues behind the first request.
    let second = {
        let node = Arc::clone(&node);
        tokio::spawn(async move { node.push("bob", &msgs()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    first.abort();

    let err = second.await.unwrap().unwrap_err();
    assert!(matches!(err, GateError::Transport(_)), "unexpected error {err}");

    let results = node.push("carol", &msgs()).await.unwrap();
    assert_eq!(results[0].sequence, 2);
}
