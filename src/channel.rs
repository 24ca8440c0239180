//! Channel state for accepted connections.
//!
//! Every accepted connection gets a `ChannelContext` at accept time. The
//! context is handed by reference to the connect hook, to every router and
//! handler call, and to the close hook, so callbacks never look up
//! per-connection state out of band.

use crate::codec::{TextCodec, VariableLengthCodec};
use crate::error::ChannelError;
use bytes::{Bytes, BytesMut};
use slab::Slab;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Identifier assigned to a channel when it is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Hands out channel ids, starting at 1.
///
/// Safe to share between concurrent accept paths: each call to `next`
/// returns a distinct, larger id.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU32,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    pub fn next(&self) -> ChannelId {
        ChannelId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Handle for one accepted connection.
#[derive(Debug, Clone)]
pub struct Channel {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    codec: VariableLengthCodec,
    outbound: mpsc::Sender<Bytes>,
}

impl Channel {
    pub fn new(
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        codec: VariableLengthCodec,
        outbound: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            remote_addr,
            local_addr,
            codec,
            outbound,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue a text message for the peer.
    ///
    /// The frame is written by the connection task after the current
    /// callback returns. Fails with `QueueFull` while the peer is not
    /// draining earlier frames.
    #[allow(dead_code)] // Called by replying handlers; `EchoHandler` does not reply
    pub fn write(&self, msg: &str) -> Result<(), ChannelError> {
        let mut frame = BytesMut::new();
        self.codec.encode(msg, &TextCodec, &mut frame)?;
        self.outbound
            .try_send(frame.freeze())
            .map_err(|e| match e {
                TrySendError::Full(_) => ChannelError::QueueFull,
                TrySendError::Closed(_) => ChannelError::Closed,
            })
    }
}

/// Per-connection state threaded through every callback.
#[derive(Debug)]
pub struct ChannelContext {
    pub id: ChannelId,
    pub channel: Channel,
}

/// Registry of live channels using slab allocation.
pub struct ChannelRegistry {
    channels: Slab<Arc<ChannelContext>>,
    max_channels: usize,
}

impl ChannelRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_channels: usize) -> Self {
        Self {
            channels: Slab::with_capacity(max_channels.min(1024)),
            max_channels,
        }
    }

    /// Insert a channel.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, ctx: Arc<ChannelContext>) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.channels.insert(ctx))
    }

    /// Remove a channel from the registry.
    pub fn remove(&mut self, key: usize) -> Option<Arc<ChannelContext>> {
        self.channels.try_remove(key)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_full(&self) -> bool {
        self.channels.len() >= self.max_channels
    }

    pub fn capacity(&self) -> usize {
        self.max_channels
    }

    /// Ids of live channels, in no particular order.
    pub fn ids(&self) -> Vec<ChannelId> {
        self.channels.iter().map(|(_, ctx)| ctx.id).collect()
    }
}

#[cfg(test)]
pub(crate) fn test_context(id: u32) -> (ChannelContext, mpsc::Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(2);
    let ctx = ChannelContext {
        id: ChannelId(id),
        channel: Channel::new(
            "127.0.0.1:50000".parse().unwrap(),
            "127.0.0.1:8080".parse().unwrap(),
            VariableLengthCodec::new(),
            tx,
        ),
    };
    (ctx, rx)
}
