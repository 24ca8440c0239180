//! Message routing.
//!
//! The server asks the router for a handler once per decoded message, then
//! invokes that handler with the same channel context.

use crate::channel::ChannelContext;
use crate::error::{HandlerError, RouteError};
use tracing::info;

/// Application logic for one inbound message.
pub trait Handler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn handle(&self, ctx: &ChannelContext, msg: &str) -> Result<(), HandlerError>;
}

/// Picks the handler for an inbound message.
pub trait Router: Send + Sync + 'static {
    fn route(&self, ctx: &ChannelContext, msg: &str) -> Result<&dyn Handler, RouteError>;
}

/// Logs every message it receives. Sends no reply.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl Handler for EchoHandler {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn handle(&self, ctx: &ChannelContext, msg: &str) -> Result<(), HandlerError> {
        info!(
            id = %ctx.id,
            remote = %ctx.channel.remote_addr(),
            msg,
            "receive msg from channel"
        );
        Ok(())
    }
}

/// Routes every message to `EchoHandler`.
#[derive(Debug, Default)]
pub struct EchoRouter {
    echo: EchoHandler,
}

impl Router for EchoRouter {
    fn route(&self, _ctx: &ChannelContext, _msg: &str) -> Result<&dyn Handler, RouteError> {
        Ok(&self.echo)
    }
}
