//! A minimal service node speaking the JSON-lines protocol.
//!
//! It stores nothing; it stamps each pushed message with a wall-clock
//! timestamp and a per-group sequence number, and remembers what it saw so
//! callers can inspect arrival order.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::tcp::{Request, Response};
use crate::error::Result;
use crate::message::{MessageBody, PushResult};

#[derive(Debug, Default)]
pub struct Backend {
    name: String,
    sequences: DashMap<String, u32>,
    received: Mutex<Vec<MessageBody>>,
}

impl Backend {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ..Default::default()
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Messages accepted so far, in arrival order.
    pub fn received(&self) -> Vec<MessageBody> {
        self.received.lock().clone()
    }

    /// Accepts connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(backend = %self.name, addr = %listener.local_addr()?, "backend listening");
        loop {
            let (socket, peer) = listener.accept().await?;
            debug!(backend = %self.name, %peer, "accepted");
            let backend = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = backend.handle(socket).await {
                    warn!(backend = %backend.name, %peer, error = %e, "connection ended with error");
                }
            });
        }
    }

    async fn handle(&self, socket: TcpStream) -> Result<()> {
        let (reader, mut writer) = socket.into_split();
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            let reply = match serde_json::from_str::<Request>(&line) {
                Ok(request) => self.answer(request),
                Err(e) => Response::Error {
                    message: format!("malformed request: {e}"),
                },
            };
            let mut out = serde_json::to_string(&reply)?;
            out.push('\n');
            writer.write_all(out.as_bytes()).await?;
        }
        Ok(())
    }

    fn answer(&self, request: Request) -> Response {
        match request {
            Request::Echo { payload } => Response::Echo { payload },
            Request::Push { msgs, .. } => {
                let results = msgs.into_iter().map(|msg| self.accept(msg)).collect();
                Response::Pushed { results }
            }
        }
    }

    fn accept(&self, msg: MessageBody) -> PushResult {
        if msg.group.is_empty() {
            return PushResult {
                timestamp: 0,
                sequence: 0,
                error: Some("empty group".into()),
            };
        }
        let sequence = {
            let mut seq = self.sequences.entry(msg.group.clone()).or_insert(0);
            *seq += 1;
            *seq
        };
        self.received.lock().push(msg);
        PushResult::accepted(now_millis(), sequence)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
