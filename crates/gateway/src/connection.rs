//! Per-client sessions and long-poll delivery.
//!
//! Producers write into a connection's [`RingBuffer`] under its lock and
//! signal a [`Notify`]; the single consumer parks in [`Connection::receive`]
//! until enough messages arrive or its deadline passes.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::buffer::RingBuffer;
use crate::error::{GateError, Result};
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Http,
    Tcp,
    WebSocket,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
            Protocol::WebSocket => "websocket",
        })
    }
}

/// How the client is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectMetadata {
    pub protocol: Protocol,
    pub remote: String,
    /// Long-poll timeout in milliseconds. Negative on connect means "use the
    /// hub default"; once attached, negative means wait forever.
    pub timeout_ms: i64,
}

impl ConnectMetadata {
    pub fn new(protocol: Protocol, remote: impl Into<String>) -> Self {
        Self {
            protocol,
            remote: remote.into(),
            timeout_ms: -1,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnState {
    Open = 0,
    Connected = 1,
    Closed = 2,
}

impl ConnState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnState::Open,
            1 => ConnState::Connected,
            _ => ConnState::Closed,
        }
    }
}

/// What to do when a connection's buffer is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the oldest unread message.
    #[default]
    DropOldest,
    /// Refuse the new message.
    Reject,
}

/// Outcome of writing messages into one or more connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub written: usize,
    /// Older messages overwritten to make room.
    pub dropped: usize,
    /// Messages refused by a full buffer.
    pub rejected: usize,
    /// Target sessions with no attached connection.
    pub unrouted: usize,
}

impl std::ops::AddAssign for Delivery {
    fn add_assign(&mut self, rhs: Self) {
        self.written += rhs.written;
        self.dropped += rhs.dropped;
        self.rejected += rhs.rejected;
        self.unrouted += rhs.unrouted;
    }
}

pub struct Connection {
    key: String,
    state: AtomicU8,
    meta: RwLock<ConnectMetadata>,
    buffer: Mutex<RingBuffer<Message>>,
    signal: Notify,
    receiving: AtomicBool,
    overflow: OverflowPolicy,
    last_active: Mutex<Instant>,
}

impl Connection {
    pub fn new(key: impl Into<String>, meta: ConnectMetadata, capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            key: key.into(),
            state: AtomicU8::new(ConnState::Open as u8),
            meta: RwLock::new(meta),
            buffer: Mutex::new(RingBuffer::new(capacity)),
            signal: Notify::new(),
            receiving: AtomicBool::new(false),
            overflow,
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn metadata(&self) -> ConnectMetadata {
        self.meta.read().clone()
    }

    pub fn receive_timeout_ms(&self) -> i64 {
        self.meta.read().timeout_ms
    }

    /// Buffered, unread messages.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().count()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.lock().capacity()
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::Acquire)
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    pub(crate) fn attach(&self, meta: ConnectMetadata) {
        *self.meta.write() = meta;
        self.state.store(ConnState::Connected as u8, Ordering::Release);
        self.touch();
    }

    /// Marks the connection closed and wakes its receiver.
    pub(crate) fn close(&self) {
        self.state.store(ConnState::Closed as u8, Ordering::Release);
        self.signal.notify_one();
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Buffers `msgs` in order.
    ///
    /// A full buffer drops its oldest message or refuses the new one,
    /// depending on the overflow policy; producers never wait. Fails with
    /// `RingFull` only when nothing could be written.
    pub fn push(&self, msgs: &[Message]) -> Result<Delivery> {
        let overwrite = self.overflow == OverflowPolicy::DropOldest;
        let mut delivery = Delivery::default();
        {
            let mut buffer = self.buffer.lock();
            for msg in msgs {
                match buffer.write(msg.clone(), overwrite) {
                    Ok(dropped) => {
                        delivery.written += 1;
                        delivery.dropped += usize::from(dropped);
                    }
                    Err(_) => delivery.rejected += 1,
                }
            }
        }

        if delivery.written > 0 {
            self.signal.notify_one();
        }
        if delivery.dropped > 0 {
            metrics::counter!("gate_ring_dropped_total").increment(delivery.dropped as u64);
        }
        if delivery.rejected > 0 {
            metrics::counter!("gate_ring_rejected_total").increment(delivery.rejected as u64);
            trace!(session = %self.key, rejected = delivery.rejected, "buffer full");
        }

        if delivery.written == 0 && delivery.rejected > 0 {
            return Err(GateError::RingFull);
        }
        Ok(delivery)
    }

    /// Long-poll for messages.
    ///
    /// Returns once `bulk` messages are collected, `max` is reached (zero
    /// means no cap), the connection is closed, or `timeout_ms` elapses.
    /// A zero timeout returns whatever is buffered; a negative one waits
    /// until `bulk` is reached. Only one receiver may wait at a time.
    pub async fn receive(&self, max: usize, bulk: usize, timeout_ms: i64) -> Result<Vec<Message>> {
        let _receiving = Receiving::acquire(&self.receiving).ok_or(GateError::ConcurrentReceive)?;
        self.touch();

        let cap = if max == 0 { usize::MAX } else { max };
        let bulk = bulk.max(1).min(cap);
        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));
        let mut out = Vec::new();

        loop {
            let notified = self.signal.notified();
            tokio::pin!(notified);
            // Registered before the final check so a write in between still wakes us.
            notified.as_mut().enable();

            out.extend(self.buffer.lock().drain(cap - out.len()));
            if out.len() >= bulk || timeout_ms == 0 || self.state() == ConnState::Closed {
                break;
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => break,
                    }
                }
                None => notified.await,
            }
        }

        self.touch();
        Ok(out)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("buffered", &self.buffered())
            .finish()
    }
}

/// Held for the duration of one `receive`.
struct Receiving<'a>(&'a AtomicBool);

impl<'a> Receiving<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for Receiving<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
