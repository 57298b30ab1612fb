//! Plugins register to the request lifecycle by implementing [`Plugin`].
//! They run in registration order for every message.
use anyhow::Result;
use async_trait::async_trait;

pub(crate) use crate::server::context::MsgContext;

/// Action for the server to take after the plugin returns
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Action {
    /// Respond with `resp_msg` from `MsgContext`
    Respond,
    /// Don't respond
    NoResponse,
    /// Continue executing the next plugin
    Continue,
}

/// define a plugin which will mutate a `MsgContext`
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// what to execute during this step in the message lifecycle
    ///
    /// Messages are handled one at a time, a plugin runs to completion
    /// before the next message is read off the socket.
    async fn handle(&self, ctx: &mut MsgContext) -> Result<Action>;
}
