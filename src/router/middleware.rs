use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::warn;

use super::{Ctx, HandlerFuture, TopicArg, TopicHandler, TopicMiddleware, middleware};
use crate::session::{ConnectContextStore, IdentityStore};
use crate::utils::Error;

const TIMEOUT_REJECT_REASON: &str = "handler timeout";

/// Bounds each handler invocation with a deadline.
///
/// The handler's [`Ctx`] carries a context that expires after `duration`;
/// the handler still runs to completion, so it must watch
/// [`Ctx::done`] to stop early. If the deadline passed the invocation fails
/// with [`Error::TopicHandlerTimeout`], and with
/// [`Timeout::with_disconnect`] the sender is rejected as well.
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    duration: Duration,
    disconnect: bool,
}

impl Timeout {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            disconnect: false,
        }
    }

    pub fn with_disconnect(mut self) -> Self {
        self.disconnect = true;
        self
    }

    pub fn into_middleware(self) -> TopicMiddleware {
        let Timeout {
            duration,
            disconnect,
        } = self;

        middleware(move |next: TopicHandler| -> TopicHandler {
            Arc::new(move |mut ctx: Ctx| -> HandlerFuture {
                let next = next.clone();
                Box::pin(async move {
                    let bounded = ctx.context().with_timeout(duration);
                    ctx.set_context(bounded.clone());
                    let sender = disconnect.then(|| ctx.clone());

                    let result = next(ctx).await;
                    let expired = matches!(bounded.err(), Some(Error::DeadlineExceeded));
                    bounded.cancel();
                    if !expired {
                        return result;
                    }

                    if let Some(sender) = sender {
                        if let Err(e) = sender.reject(TIMEOUT_REJECT_REASON).await {
                            warn!(topic = %sender.topic(), error = %e, "failed to reject client after handler timeout");
                        }
                    }
                    Err(Error::TopicHandlerTimeout(duration))
                })
            })
        })
    }
}

impl From<Timeout> for TopicMiddleware {
    fn from(timeout: Timeout) -> Self {
        timeout.into_middleware()
    }
}

impl From<Timeout> for TopicArg {
    fn from(timeout: Timeout) -> Self {
        TopicArg::Middleware(timeout.into_middleware())
    }
}

/// Turns a panicking handler into [`Error::TopicHandlerPanic`].
pub fn recover() -> TopicMiddleware {
    middleware(|next: TopicHandler| -> TopicHandler {
        Arc::new(move |ctx: Ctx| -> HandlerFuture {
            let next = next.clone();
            Box::pin(async move {
                match AssertUnwindSafe(async move { next(ctx).await })
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(panic) => Err(Error::TopicHandlerPanic(panic_message(panic.as_ref()))),
                }
            })
        })
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Attaches the sender's [`ClientIdentity`](crate::session::ClientIdentity)
/// from `store`, if it has one.
pub fn identity(store: Arc<IdentityStore>) -> TopicMiddleware {
    middleware(move |next: TopicHandler| -> TopicHandler {
        let store = store.clone();
        Arc::new(move |mut ctx: Ctx| -> HandlerFuture {
            let identity = ctx.client().and_then(|client| store.get(&client.id));
            if let Some(identity) = identity {
                ctx.set_identity(identity);
            }
            next(ctx)
        })
    })
}

/// Attaches the sender's [`ConnectContext`](crate::session::ConnectContext)
/// from `store`, if it has one.
pub fn connect_context(store: Arc<ConnectContextStore>) -> TopicMiddleware {
    middleware(move |next: TopicHandler| -> TopicHandler {
        let store = store.clone();
        Arc::new(move |mut ctx: Ctx| -> HandlerFuture {
            let context = ctx.client().and_then(|client| store.get(&client.id));
            if let Some(context) = context {
                ctx.set_connect_context(context);
            }
            next(ctx)
        })
    })
}
