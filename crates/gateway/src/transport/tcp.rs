//! JSON-lines over TCP.
//!
//! Each request and each reply is one JSON object on its own line. A client
//! carries one request at a time; concurrent callers sharing a pooled client
//! queue on its stream lock.
//!
//! A request abandoned before its reply was read (timeout or a dropped
//! caller) leaves that reply on the stream. The client is then out of sync:
//! it refuses further requests and reports itself unhealthy so its pool
//! evicts it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::ServiceTransport;
use crate::error::{GateError, Result};
use crate::message::{MessageBody, PushResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Echo { payload: String },
    Push { session: String, msgs: Vec<MessageBody> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Echo { payload: String },
    Pushed { results: Vec<PushResult> },
    Error { message: String },
}

struct Stream {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// One TCP connection to a service node.
pub struct TcpClient {
    address: String,
    stream: Mutex<Stream>,
    /// Set while a request awaits its reply.
    in_flight: AtomicBool,
}

impl TcpClient {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether an earlier request was abandoned before its reply arrived.
    pub fn is_desynced(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient").field("address", &self.address).finish()
    }
}

#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(5))
    }
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    async fn call(&self, client: &TcpClient, request: &Request) -> Result<Response> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');

        let mut stream = client.stream.lock().await;
        if client.is_desynced() {
            return Err(GateError::Transport("stream out of sync".into()));
        }

        client.in_flight.store(true, Ordering::Release);
        let outcome = tokio::time::timeout(self.request_timeout, exchange(&mut stream, &line)).await;
        if let Ok(Ok(_)) = &outcome {
            client.in_flight.store(false, Ordering::Release);
        }
        match outcome {
            Ok(Ok(Response::Error { message })) => Err(GateError::Remote(message)),
            Ok(result) => result,
            Err(_) => Err(GateError::Timeout(self.request_timeout)),
        }
    }
}

async fn exchange(stream: &mut Stream, line: &str) -> Result<Response> {
    stream.writer.write_all(line.as_bytes()).await?;
    stream.writer.flush().await?;

    let mut reply = String::new();
    if stream.reader.read_line(&mut reply).await? == 0 {
        return Err(GateError::Transport("connection closed by peer".into()));
    }
    Ok(serde_json::from_str(&reply)?)
}

fn unexpected(reply: Response) -> GateError {
    GateError::Transport(format!("unexpected reply: {reply:?}"))
}

#[async_trait]
impl ServiceTransport for TcpTransport {
    type Client = TcpClient;

    async fn dial(&self, address: &str) -> Result<TcpClient> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| GateError::Timeout(self.connect_timeout))??;
        stream.set_nodelay(true)?;
        debug!(address, "dialed service node");

        let (reader, writer) = stream.into_split();
        Ok(TcpClient {
            address: address.to_string(),
            stream: Mutex::new(Stream {
                reader: BufReader::new(reader),
                writer,
            }),
            in_flight: AtomicBool::new(false),
        })
    }

    async fn echo(&self, client: &TcpClient, payload: &str) -> Result<String> {
        let request = Request::Echo {
            payload: payload.to_string(),
        };
        match self.call(client, &request).await? {
            Response::Echo { payload } => Ok(payload),
            other => Err(unexpected(other)),
        }
    }

    async fn push(&self, client: &TcpClient, session: &str, msgs: &[MessageBody]) -> Result<Vec<PushResult>> {
        let request = Request::Push {
            session: session.to_string(),
            msgs: msgs.to_vec(),
        };
        match self.call(client, &request).await? {
            Response::Pushed { results } => Ok(results),
            other => Err(unexpected(other)),
        }
    }

    fn healthy(&self, client: &TcpClient, err: Option<&GateError>) -> bool {
        !client.is_desynced() && !err.is_some_and(GateError::is_connection_fault)
    }
}
