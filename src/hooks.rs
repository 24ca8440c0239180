//! Channel lifecycle hooks.

use crate::channel::ChannelContext;
use crate::error::{ChannelError, HookError};
use tracing::info;

/// Callbacks run by the server at the start and end of every channel.
pub trait Hooks: Send + Sync + 'static {
    /// Called once after a connection is accepted and registered.
    ///
    /// Returning an error drops the connection; `on_channel_closed` is
    /// not called for it.
    fn on_channel(&self, ctx: &ChannelContext) -> Result<(), HookError>;

    /// Called exactly once when an accepted channel terminates. `err` is
    /// `None` for a clean close.
    fn on_channel_closed(&self, ctx: &ChannelContext, err: Option<&ChannelError>);
}

/// Logs channel open and close events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHooks;

impl Hooks for LoggingHooks {
    fn on_channel(&self, ctx: &ChannelContext) -> Result<(), HookError> {
        info!(
            id = %ctx.id,
            remote = %ctx.channel.remote_addr(),
            local = %ctx.channel.local_addr(),
            "new channel"
        );
        Ok(())
    }

    fn on_channel_closed(&self, ctx: &ChannelContext, err: Option<&ChannelError>) {
        match err {
            Some(e) => info!(
                id = %ctx.id,
                remote = %ctx.channel.remote_addr(),
                error = %e,
                "channel closed"
            ),
            None => info!(
                id = %ctx.id,
                remote = %ctx.channel.remote_addr(),
                "channel closed"
            ),
        }
    }
}

/// Collects formatted log output so tests can assert on it.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct LogBuffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

#[cfg(test)]
impl LogBuffer {
    /// Plain-text info-level subscriber writing into this buffer.
    pub(crate) fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_target(false)
            .without_time()
            .with_max_level(tracing::Level::INFO)
            .finish()
    }

    pub(crate) fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .map(str::to_owned)
            .collect()
    }

    /// Lines for channel open, message and close events, in order.
    pub(crate) fn channel_lines(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|l| {
                l.contains("new channel")
                    || l.contains("receive msg from channel")
                    || l.contains("channel closed")
            })
            .collect()
    }
}

#[cfg(test)]
impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
