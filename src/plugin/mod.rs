//! Interceptors that run at every I/O transition of an endpoint.
//!
//! A plugin implements only the hooks it cares about; every hook defaults to a
//! no-op that returns `Ok(())`. Returning an error status from a hook stops the
//! remaining plugins for that hook point and fails the surrounding operation:
//!
//! - header/body read hooks fail the exchange (a failing `before_read_header`
//!   closes the session),
//! - write hooks fail the write with the returned status,
//! - dial hooks make the dial attempt count as failed,
//! - `after_accept` rejects the inbound connection.
//!
//! Plugins are registered into a [`PluginContainer`] in one of three segments:
//! left (endpoint wide, runs first), middle (route group) and right (endpoint
//! wide, runs last).

pub mod container;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::EndpointConfig;
use crate::endpoint::Endpoint;
use crate::exchange::Exchange;
use crate::message::Message;
use crate::router::Handler;
use crate::session::Session;
use crate::status::Status;

pub use container::PluginContainer;

/// Outcome of a single hook.
pub type HookResult = Result<(), Status>;

#[async_trait]
#[allow(unused_variables)]
pub trait Plugin: Send + Sync + 'static {
    /// Unique within a container.
    fn name(&self) -> &str;

    fn before_new_endpoint(&self, config: &mut EndpointConfig) -> HookResult {
        Ok(())
    }

    fn after_new_endpoint(&self, endpoint: &Endpoint) -> HookResult {
        Ok(())
    }

    fn after_reg_router(&self, handler: &Handler) -> HookResult {
        Ok(())
    }

    fn after_listen(&self, addr: &str) -> HookResult {
        Ok(())
    }

    async fn before_dial(&self, addr: &str, is_redial: bool) -> HookResult {
        Ok(())
    }

    async fn after_dial(&self, session: &Arc<Session>, is_redial: bool) -> HookResult {
        Ok(())
    }

    async fn after_dial_fail(&self, addr: &str, status: &Status, is_redial: bool) -> HookResult {
        Ok(())
    }

    async fn after_accept(&self, session: &Arc<Session>) -> HookResult {
        Ok(())
    }

    async fn before_write_call(&self, session: &Arc<Session>, msg: &mut Message) -> HookResult {
        Ok(())
    }

    async fn after_write_call(&self, session: &Arc<Session>, msg: &Message) -> HookResult {
        Ok(())
    }

    async fn before_write_reply(&self, ex: &mut Exchange) -> HookResult {
        Ok(())
    }

    async fn after_write_reply(&self, ex: &mut Exchange) -> HookResult {
        Ok(())
    }

    async fn before_write_push(&self, session: &Arc<Session>, msg: &mut Message) -> HookResult {
        Ok(())
    }

    async fn after_write_push(&self, session: &Arc<Session>, msg: &Message) -> HookResult {
        Ok(())
    }

    async fn before_read_header(&self, session: &Arc<Session>) -> HookResult {
        Ok(())
    }

    async fn after_read_call_header(&self, ex: &mut Exchange) -> HookResult {
        Ok(())
    }

    async fn before_read_call_body(&self, ex: &mut Exchange) -> HookResult {
        Ok(())
    }

    async fn after_read_call_body(&self, ex: &mut Exchange) -> HookResult {
        Ok(())
    }

    async fn after_read_push_header(&self, ex: &mut Exchange) -> HookResult {
        Ok(())
    }

    async fn before_read_push_body(&self, ex: &mut Exchange) -> HookResult {
        Ok(())
    }

    async fn after_read_push_body(&self, ex: &mut Exchange) -> HookResult {
        Ok(())
    }

    async fn after_read_reply_header(&self, ex: &mut Exchange) -> HookResult {
        Ok(())
    }

    async fn before_read_reply_body(&self, ex: &mut Exchange) -> HookResult {
        Ok(())
    }

    async fn after_read_reply_body(&self, ex: &mut Exchange) -> HookResult {
        Ok(())
    }

    async fn after_disconnect(&self, session: &Arc<Session>) -> HookResult {
        Ok(())
    }
}
