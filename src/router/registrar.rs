use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, info, warn};

use super::acl::TopicAclConfig;
use super::{Ctx, TopicArg, TopicHandler, TopicMiddleware, compose};
use crate::broker::{
    Broker, MessageHandler, Publisher, SessionController, Subscriber, Subscription, message_handler,
};
use crate::session::IdentityStore;
use crate::utils::{Error, Result};

/// Receives every error a topic handler returns.
pub type ErrorHandler = Arc<dyn Fn(&Ctx, &Error) + Send + Sync>;

/// Managed subscriptions on top of a [`Subscriber`].
///
/// Clones share state. Once [`TopicRegistrar::stop`] has run every
/// subscription made through the registrar is gone and new ones are refused.
#[derive(Clone)]
pub struct TopicRegistrar {
    inner: Arc<Inner>,
}

struct Inner {
    subscriber: Arc<dyn Subscriber>,
    publisher: Option<Arc<dyn Publisher>>,
    session: Option<Arc<dyn SessionController>>,
    identities: Option<Arc<IdentityStore>>,
    acl: TopicAclConfig,
    error_handler: ErrorHandler,
    next_id: AtomicU64,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    stopped: bool,
    entries: Vec<Subscription>,
    middleware: Vec<TopicMiddleware>,
}

pub struct TopicRegistrarBuilder {
    subscriber: Arc<dyn Subscriber>,
    publisher: Option<Arc<dyn Publisher>>,
    session: Option<Arc<dyn SessionController>>,
    identities: Option<Arc<IdentityStore>>,
    acl: TopicAclConfig,
    error_handler: Option<ErrorHandler>,
}

impl TopicRegistrarBuilder {
    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn session_controller(mut self, session: Arc<dyn SessionController>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn identities(mut self, identities: Arc<IdentityStore>) -> Self {
        self.identities = Some(identities);
        self
    }

    pub fn acl(mut self, acl: TopicAclConfig) -> Self {
        self.acl = acl;
        self
    }

    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn build(self) -> TopicRegistrar {
        TopicRegistrar {
            inner: Arc::new(Inner {
                subscriber: self.subscriber,
                publisher: self.publisher,
                session: self.session,
                identities: self.identities,
                acl: self.acl,
                error_handler: self
                    .error_handler
                    .unwrap_or_else(|| Arc::new(log_handler_error) as ErrorHandler),
                next_id: AtomicU64::new(1),
                state: Mutex::new(State::default()),
            }),
        }
    }
}

impl TopicRegistrar {
    pub fn builder(subscriber: Arc<dyn Subscriber>) -> TopicRegistrarBuilder {
        TopicRegistrarBuilder {
            subscriber,
            publisher: None,
            session: None,
            identities: None,
            acl: TopicAclConfig::default(),
            error_handler: None,
        }
    }

    /// A builder using `broker` as subscriber, publisher and session
    /// controller.
    pub fn for_broker<B>(broker: Arc<B>) -> TopicRegistrarBuilder
    where
        B: Broker + SessionController + 'static,
    {
        Self::builder(broker.clone())
            .publisher(broker.clone())
            .session_controller(broker)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends registrar-wide middleware. Only topics registered afterwards
    /// are wrapped by it.
    pub fn use_middleware(&self, middleware: impl IntoIterator<Item = TopicMiddleware>) {
        self.state().middleware.extend(middleware);
    }

    /// Subscribes `filter`. `args` is any number of middleware followed by
    /// exactly one handler.
    pub async fn topic(&self, filter: &str, args: Vec<TopicArg>) -> Result<Subscription> {
        let (handler, local) = split_args(args)?;

        let (id, handler) = {
            let state = self.state();
            if state.stopped {
                return Err(Error::TopicRegistrarStopped);
            }
            if !self.inner.acl.allows(filter) {
                return Err(Error::TopicNotAllowed(filter.to_string()));
            }
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let chain: Vec<TopicMiddleware> =
                state.middleware.iter().cloned().chain(local).collect();
            (id, compose(handler, &chain))
        };

        self.inner
            .subscriber
            .subscribe(filter, id, self.message_handler(handler))
            .await?;

        let subscription = Subscription::new(filter, id);
        let stopped = {
            let mut state = self.state();
            if !state.stopped {
                state.entries.push(subscription.clone());
            }
            state.stopped
        };
        if stopped {
            if let Err(e) = self.inner.subscriber.unsubscribe(filter, id).await {
                warn!(filter, subscription_id = id, error = %e, "failed to undo subscription on stopped registrar");
            }
            return Err(Error::TopicRegistrarStopped);
        }

        debug!(filter, subscription_id = id, "topic registered");
        Ok(subscription)
    }

    /// Shorthand for a topic without per-topic middleware.
    pub async fn handle(&self, filter: &str, handler: TopicHandler) -> Result<Subscription> {
        self.topic(filter, vec![TopicArg::Handler(handler)]).await
    }

    /// Removes one subscription made by this registrar. Unknown entries are
    /// ignored.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        let found = {
            let mut state = self.state();
            let before = state.entries.len();
            state.entries.retain(|entry| entry != subscription);
            state.entries.len() != before
        };
        if !found {
            return Ok(());
        }
        self.inner
            .subscriber
            .unsubscribe(&subscription.filter, subscription.id)
            .await
    }

    /// Unsubscribes everything and refuses further registrations. Errors
    /// from individual unsubscribes are collected; a second call is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let entries = {
            let mut state = self.state();
            if state.stopped {
                return Ok(());
            }
            state.stopped = true;
            std::mem::take(&mut state.entries)
        };

        let mut errors = Vec::new();
        for entry in &entries {
            if let Err(e) = self
                .inner
                .subscriber
                .unsubscribe(&entry.filter, entry.id)
                .await
            {
                warn!(filter = %entry.filter, subscription_id = entry.id, error = %e, "unsubscribe failed");
                errors.push(e);
            }
        }
        info!(subscriptions = entries.len(), "topic registrar stopped");
        Error::aggregate(errors)
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.state().entries.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.state().stopped
    }

    fn message_handler(&self, handler: TopicHandler) -> MessageHandler {
        let publisher = self.inner.publisher.clone();
        let session = self.inner.session.clone();
        let identities = self.inner.identities.clone();
        let on_error = self.inner.error_handler.clone();

        message_handler(move |delivery| {
            let ctx = Ctx::from_delivery(delivery)
                .with_publisher(publisher.clone())
                .with_session_controller(session.clone())
                .with_identities(identities.clone());
            let handler = handler.clone();
            let on_error = on_error.clone();
            async move {
                if let Err(e) = handler(ctx.clone()).await {
                    on_error(&ctx, &e);
                }
            }
        })
    }
}

impl fmt::Debug for TopicRegistrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("TopicRegistrar")
            .field("stopped", &state.stopped)
            .field("subscriptions", &state.entries)
            .field("middleware", &state.middleware.len())
            .field("acl", &self.inner.acl)
            .finish()
    }
}

fn split_args(mut args: Vec<TopicArg>) -> Result<(TopicHandler, Vec<TopicMiddleware>)> {
    let handler = match args.pop() {
        Some(TopicArg::Handler(handler)) => handler,
        Some(TopicArg::Middleware(_)) => {
            return Err(Error::InvalidTopicRegistrationArgs(
                "last argument must be a handler".to_string(),
            ));
        }
        None => {
            return Err(Error::InvalidTopicRegistrationArgs(
                "a handler is required".to_string(),
            ));
        }
    };

    let middleware = args
        .into_iter()
        .enumerate()
        .map(|(i, arg)| match arg {
            TopicArg::Middleware(m) => Ok(m),
            TopicArg::Handler(_) => Err(Error::InvalidTopicRegistrationArgs(format!(
                "argument {i} must be middleware"
            ))),
        })
        .collect::<Result<Vec<_>>>()?;

    Ok((handler, middleware))
}

fn log_handler_error(ctx: &Ctx, err: &Error) {
    error!(
        topic = %ctx.topic(),
        filter = %ctx.filter(),
        payload = %String::from_utf8_lossy(ctx.payload()),
        client_id = %ctx.client_id().unwrap_or_default(),
        error = %err,
        "topic handler failed"
    );
}
