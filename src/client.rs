//! Loopback self-test client.
//!
//! Connects to the server's own listening address and sends a fixed run of
//! framed text messages, one interval apart.

use crate::codec::{TextCodec, VariableLengthCodec};
use crate::config::ClientConfig;
use crate::error::{ChannelError, ClientError};
use bytes::BytesMut;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Buffered writer that frames each message before sending it.
pub struct FrameWriter<W> {
    inner: W,
    codec: VariableLengthCodec,
    buffer: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, codec: VariableLengthCodec) -> Self {
        Self {
            inner,
            codec,
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Encode one text message and flush it to the underlying writer.
    pub async fn send(&mut self, msg: &str) -> Result<(), ChannelError> {
        self.codec.encode(msg, &TextCodec, &mut self.buffer)?;

        let result = self.inner.write_all(&self.buffer).await;
        self.buffer.clear();
        result?;

        self.inner.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Text of the `seq`th self-test message.
pub fn message(seq: usize) -> String {
    format!("[msg{seq}]hello server!")
}

/// Address a local client should dial to reach a server bound to `local`.
///
/// Wildcard binds are reached through the loopback address of the same
/// family.
pub fn loopback_target(local: SocketAddr) -> SocketAddr {
    match local {
        SocketAddr::V4(addr) if addr.ip().is_unspecified() => {
            SocketAddr::from((Ipv4Addr::LOCALHOST, addr.port()))
        }
        SocketAddr::V6(addr) if addr.ip().is_unspecified() => {
            SocketAddr::from((Ipv6Addr::LOCALHOST, addr.port()))
        }
        other => other,
    }
}

/// Run the self-test against `addr`. Returns the number of messages sent.
///
/// The first failure aborts the run; nothing is retried.
pub async fn run_self_test(
    addr: SocketAddr,
    config: &ClientConfig,
    codec: VariableLengthCodec,
) -> Result<usize, ClientError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ClientError::Connect(addr, e))?;
    info!(server = %addr, messages = config.messages, "Self-test client connected");

    let mut writer = FrameWriter::new(stream, codec);

    for seq in 0..config.messages {
        let msg = message(seq);
        writer.send(&msg).await.map_err(ClientError::Send)?;
        debug!(seq, "Sent message");
        tokio::time::sleep(config.interval).await;
    }

    close(writer.into_inner(), config.abortive_close).await?;
    info!(abortive = config.abortive_close, "Self-test client closed");

    tokio::time::sleep(config.linger).await;
    Ok(config.messages)
}

async fn close(mut stream: TcpStream, abortive: bool) -> Result<(), ClientError> {
    if abortive {
        // Zero linger turns the close into a reset
        socket2::SockRef::from(&stream)
            .set_linger(Some(Duration::ZERO))
            .map_err(ClientError::Close)?;
    } else {
        stream.shutdown().await.map_err(ClientError::Close)?;
    }
    drop(stream);
    Ok(())
}
