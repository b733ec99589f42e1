//! The `router` module is the managed subscription API on top of a
//! [`Subscriber`](crate::broker::Subscriber).
//!
//! A [`TopicRegistrar`] hands out subscription ids, wraps each handler in the
//! registrar-wide and per-topic middleware, enforces the topic ACL and
//! removes every subscription it made when stopped. Handlers receive a
//! [`Ctx`] for each message.

pub mod acl;
pub mod ctx;
pub mod middleware;
pub mod registrar;

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::utils::Result;

pub use acl::TopicAclConfig;
pub use ctx::{Ctx, TopicContext};
pub use middleware::{Timeout, connect_context, identity, recover};
pub use registrar::{ErrorHandler, TopicRegistrar, TopicRegistrarBuilder};

pub type HandlerFuture = BoxFuture<'static, Result<()>>;

pub type TopicHandler = Arc<dyn Fn(Ctx) -> HandlerFuture + Send + Sync>;

/// Wraps a handler in another one. The first middleware registered is the
/// outermost.
pub type TopicMiddleware = Arc<dyn Fn(TopicHandler) -> TopicHandler + Send + Sync>;

pub fn handler<F, Fut>(f: F) -> TopicHandler
where
    F: Fn(Ctx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx: Ctx| -> HandlerFuture { Box::pin(f(ctx)) })
}

/// Wraps a blocking-free synchronous closure as a [`TopicHandler`].
pub fn sync_handler<F>(f: F) -> TopicHandler
where
    F: Fn(Ctx) -> Result<()> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |ctx: Ctx| -> HandlerFuture {
        let f = f.clone();
        Box::pin(async move { f(ctx) })
    })
}

pub fn middleware<F>(f: F) -> TopicMiddleware
where
    F: Fn(TopicHandler) -> TopicHandler + Send + Sync + 'static,
{
    Arc::new(f)
}

/// One argument to [`TopicRegistrar::topic`]: the last must be a handler,
/// every other one a middleware.
#[derive(Clone)]
pub enum TopicArg {
    Middleware(TopicMiddleware),
    Handler(TopicHandler),
}

impl From<TopicHandler> for TopicArg {
    fn from(handler: TopicHandler) -> Self {
        TopicArg::Handler(handler)
    }
}

impl From<TopicMiddleware> for TopicArg {
    fn from(middleware: TopicMiddleware) -> Self {
        TopicArg::Middleware(middleware)
    }
}

impl std::fmt::Debug for TopicArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopicArg::Middleware(_) => f.write_str("Middleware"),
            TopicArg::Handler(_) => f.write_str("Handler"),
        }
    }
}

pub fn compose(handler: TopicHandler, middleware: &[TopicMiddleware]) -> TopicHandler {
    middleware.iter().rev().fold(handler, |next, m| m(next))
}

#[cfg(test)]
mod tests;
