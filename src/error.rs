//! Error types for channels, codecs, callbacks, the server and the
//! self-test client.

use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Framing or payload decoding/encoding failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame body is larger than the configured maximum.
    FrameTooLarge { size: usize, max: usize },
    /// Length prefix is not a valid varint for a 32-bit length.
    MalformedLength,
    /// Text payload is not valid UTF-8.
    InvalidUtf8,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::FrameTooLarge { size, max } => {
                write!(f, "frame too large: {size} bytes (max {max})")
            }
            CodecError::MalformedLength => write!(f, "malformed length prefix"),
            CodecError::InvalidUtf8 => write!(f, "payload is not valid utf-8"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Reason a channel terminated, or a write to it failed.
#[derive(Debug)]
pub enum ChannelError {
    Io(io::Error),
    Codec(CodecError),
    /// The channel's connection task has already finished.
    Closed,
    /// Too many frames are waiting to be written to the peer.
    QueueFull,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Io(e) => write!(f, "i/o error: {e}"),
            ChannelError::Codec(e) => write!(f, "codec error: {e}"),
            ChannelError::Closed => write!(f, "channel closed"),
            ChannelError::QueueFull => write!(f, "outbound queue full"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Io(e) => Some(e),
            ChannelError::Codec(e) => Some(e),
            ChannelError::Closed | ChannelError::QueueFull => None,
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        ChannelError::Io(e)
    }
}

impl From<CodecError> for ChannelError {
    fn from(e: CodecError) -> Self {
        ChannelError::Codec(e)
    }
}

/// Declares a message-carrying error for a user callback.
macro_rules! callback_error {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        #[allow(dead_code)] // Constructed by callback implementations
        pub struct $name(String);

        impl $name {
            #[allow(dead_code)]
            pub fn new(msg: impl Into<String>) -> Self {
                Self(msg.into())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ": {}"), self.0)
            }
        }

        impl std::error::Error for $name {}
    };
}

callback_error!(
    /// Returned by `Hooks::on_channel` to refuse a connection.
    HookError,
    "hook rejected channel"
);
callback_error!(
    /// Returned by a router that cannot pick a handler.
    RouteError,
    "no route"
);
callback_error!(
    /// Returned by a handler that failed to process a message.
    HandlerError,
    "handler failed"
);

/// Server-side failures.
#[derive(Debug)]
pub enum ServerError {
    /// The listening socket could not be created or bound.
    Bind(String, io::Error),
    /// `accept` (or reading the accepted socket's address) failed.
    Accept(io::Error),
    /// The channel registry is at capacity.
    RegistryFull { capacity: usize },
    /// `on_channel` refused the connection.
    Rejected(HookError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Bind(addr, e) => write!(f, "failed to bind '{addr}': {e}"),
            ServerError::Accept(e) => write!(f, "accept failed: {e}"),
            ServerError::RegistryFull { capacity } => {
                write!(f, "too many channels (capacity {capacity})")
            }
            ServerError::Rejected(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ServerError {}

/// Self-test client failures. Any of these aborts the send loop.
#[derive(Debug)]
pub enum ClientError {
    Connect(SocketAddr, io::Error),
    Send(ChannelError),
    Close(io::Error),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Connect(addr, e) => write!(f, "failed to connect to {addr}: {e}"),
            ClientError::Send(e) => write!(f, "failed to send message: {e}"),
            ClientError::Close(e) => write!(f, "failed to close connection: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}
