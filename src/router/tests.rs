use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::{Notify, mpsc};

use super::*;
use crate::broker::{EmbeddedBroker, Message, MessageHandler, Publisher, Subscriber, Subscription};
use crate::client::{Client, ConnectInfo};
use crate::protocol::{Packet, QoS};
use crate::session::{ConnectContextStore, IdentityStore};
use crate::utils::{Error, Result};

/// Subscriber that only counts calls.
#[derive(Default)]
struct CountingSubscriber {
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
}

#[async_trait]
impl Subscriber for CountingSubscriber {
    async fn subscribe(&self, _filter: &str, _id: u64, _handler: MessageHandler) -> Result<()> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unsubscribe(&self, _filter: &str, _id: u64) -> Result<()> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Subscriber whose unsubscribe always fails.
struct FailingSubscriber;

#[async_trait]
impl Subscriber for FailingSubscriber {
    async fn subscribe(&self, _filter: &str, _id: u64, _handler: MessageHandler) -> Result<()> {
        Ok(())
    }

    async fn unsubscribe(&self, _filter: &str, _id: u64) -> Result<()> {
        Err(Error::ConnectionClosed)
    }
}

/// Subscriber whose subscribe blocks until released, recording what was
/// unsubscribed.
#[derive(Default)]
struct GatedSubscriber {
    entered: Notify,
    release: Notify,
    unsubscribed: Mutex<Vec<(String, u64)>>,
}

#[async_trait]
impl Subscriber for GatedSubscriber {
    async fn subscribe(&self, _filter: &str, _id: u64, _handler: MessageHandler) -> Result<()> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str, id: u64) -> Result<()> {
        self.unsubscribed
            .lock()
            .unwrap()
            .push((filter.to_string(), id));
        Ok(())
    }
}

fn noop() -> TopicHandler {
    sync_handler(|_| Ok(()))
}

fn test_ctx() -> Ctx {
    Ctx::new(
        Subscription::new("t", 1),
        Message::new("t", Bytes::from_static(b"{}")),
    )
}

fn errors_channel() -> (ErrorHandler, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: ErrorHandler = Arc::new(move |_ctx: &Ctx, err: &Error| {
        let _ = tx.send(err.to_string());
    });
    (handler, rx)
}

#[test]
fn test_acl_prefixes() {
    let acl = TopicAclConfig::allow_prefixes(["/public/"]);
    assert!(acl.allows("/public/x"));
    assert!(!acl.allows("/private/x"));

    assert!(TopicAclConfig::default().allows("/anything"));
    assert!(!TopicAclConfig::allow_prefixes(Vec::<String>::new()).allows("/public/x"));
}

#[tokio::test]
async fn test_registrar_enforces_acl() {
    let registrar = TopicRegistrar::builder(Arc::new(CountingSubscriber::default()))
        .acl(TopicAclConfig::allow_prefixes(["/public/"]))
        .build();

    assert!(registrar.handle("/public/x", noop()).await.is_ok());
    let err = registrar.handle("/private/x", noop()).await.unwrap_err();
    assert!(matches!(err, Error::TopicNotAllowed(filter) if filter == "/private/x"));
}

#[tokio::test]
async fn test_registrar_rejects_invalid_args() {
    let registrar = TopicRegistrar::builder(Arc::new(CountingSubscriber::default())).build();

    let err = registrar.topic("a", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTopicRegistrationArgs(_)));

    let err = registrar
        .topic("a", vec![recover().into()])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTopicRegistrationArgs(_)));

    let err = registrar
        .topic("a", vec![noop().into(), noop().into()])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTopicRegistrationArgs(_)));
}

#[tokio::test]
async fn test_registrar_ids_increase() {
    let registrar = TopicRegistrar::builder(Arc::new(CountingSubscriber::default())).build();
    let first = registrar.handle("a", noop()).await.unwrap();
    let second = registrar.handle("a", noop()).await.unwrap();
    assert_eq!(first.id, 1);
    assert_eq!(second.id, 2);
    assert_eq!(registrar.subscriptions(), vec![first, second]);
}

#[tokio::test]
async fn test_stop_twice_unsubscribes_once() {
    let subscriber = Arc::new(CountingSubscriber::default());
    let registrar = TopicRegistrar::builder(subscriber.clone()).build();
    registrar.handle("a", noop()).await.unwrap();
    registrar.handle("b", noop()).await.unwrap();

    registrar.stop().await.unwrap();
    registrar.stop().await.unwrap();
    assert!(registrar.is_stopped());
    assert_eq!(subscriber.unsubscribes.load(Ordering::SeqCst), 2);
    assert!(registrar.subscriptions().is_empty());

    let err = registrar.handle("c", noop()).await.unwrap_err();
    assert!(matches!(err, Error::TopicRegistrarStopped));
    assert_eq!(subscriber.subscribes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_stop_during_subscribe_undoes_it() {
    let subscriber = Arc::new(GatedSubscriber::default());
    let registrar = TopicRegistrar::builder(subscriber.clone()).build();

    let registering = tokio::spawn({
        let registrar = registrar.clone();
        async move { registrar.handle("slow/topic", noop()).await }
    });
    subscriber.entered.notified().await;

    registrar.stop().await.unwrap();
    assert!(subscriber.unsubscribed.lock().unwrap().is_empty());
    subscriber.release.notify_one();

    let err = tokio::time::timeout(Duration::from_secs(5), registering)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::TopicRegistrarStopped));
    assert_eq!(
        *subscriber.unsubscribed.lock().unwrap(),
        vec![("slow/topic".to_string(), 1)]
    );
    assert!(registrar.subscriptions().is_empty());
}

#[tokio::test]
async fn test_stop_aggregates_unsubscribe_errors() {
    let registrar = TopicRegistrar::builder(Arc::new(FailingSubscriber)).build();
    registrar.handle("a", noop()).await.unwrap();
    registrar.handle("b", noop()).await.unwrap();

    let err = registrar.stop().await.unwrap_err();
    assert!(matches!(err, Error::Multiple(errors) if errors.len() == 2));
    assert!(registrar.stop().await.is_ok());
}

#[tokio::test]
async fn test_unsubscribe_single_entry() {
    let subscriber = Arc::new(CountingSubscriber::default());
    let registrar = TopicRegistrar::builder(subscriber.clone()).build();
    let sub = registrar.handle("a", noop()).await.unwrap();

    registrar.unsubscribe(&sub).await.unwrap();
    registrar.unsubscribe(&sub).await.unwrap();
    assert_eq!(subscriber.unsubscribes.load(Ordering::SeqCst), 1);
    assert!(registrar.subscriptions().is_empty());
}

fn tracing_middleware(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> TopicMiddleware {
    middleware(move |next: TopicHandler| -> TopicHandler {
        let log = log.clone();
        handler(move |ctx| {
            let next = next.clone();
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("{name}>"));
                let result = next(ctx).await;
                log.lock().unwrap().push(format!("<{name}"));
                result
            }
        })
    })
}

#[tokio::test]
async fn test_middleware_onion_order() {
    let broker = Arc::new(EmbeddedBroker::new());
    let registrar = TopicRegistrar::for_broker(broker.clone()).build();
    let log = Arc::new(Mutex::new(Vec::new()));

    registrar.use_middleware([
        tracing_middleware("A", log.clone()),
        tracing_middleware("B", log.clone()),
    ]);

    let inner_log = log.clone();
    registrar
        .topic(
            "orders/+",
            vec![
                tracing_middleware("local", log.clone()).into(),
                sync_handler(move |_| {
                    inner_log.lock().unwrap().push("handler".to_string());
                    Ok(())
                })
                .into(),
            ],
        )
        .await
        .unwrap();

    broker
        .publish("orders/1", Bytes::from_static(b"x"), false, QoS::AtMostOnce)
        .await
        .unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["A>", "B>", "local>", "handler", "<local", "<B", "<A"]
    );
}

#[tokio::test]
async fn test_global_middleware_applies_to_later_topics_only() {
    let broker = Arc::new(EmbeddedBroker::new());
    let registrar = TopicRegistrar::for_broker(broker.clone()).build();
    let log = Arc::new(Mutex::new(Vec::new()));

    registrar.handle("early", noop()).await.unwrap();
    registrar.use_middleware([tracing_middleware("G", log.clone())]);
    registrar.handle("late", noop()).await.unwrap();

    broker
        .publish("early", Bytes::new(), false, QoS::AtMostOnce)
        .await
        .unwrap();
    assert!(log.lock().unwrap().is_empty());

    broker
        .publish("late", Bytes::new(), false, QoS::AtMostOnce)
        .await
        .unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["G>", "<G"]);
}

#[tokio::test]
async fn test_handler_errors_reach_error_handler() {
    let broker = Arc::new(EmbeddedBroker::new());
    let (on_error, mut errors) = errors_channel();
    let registrar = TopicRegistrar::for_broker(broker.clone())
        .error_handler(on_error)
        .build();

    registrar
        .handle("jobs", sync_handler(|_| Err(Error::Canceled)))
        .await
        .unwrap();
    broker
        .publish("jobs", Bytes::new(), false, QoS::AtMostOnce)
        .await
        .unwrap();
    assert_eq!(errors.recv().await.unwrap(), "context canceled");
}

#[tokio::test]
async fn test_default_error_handler_logs() {
    let broker = Arc::new(EmbeddedBroker::new());
    let registrar = TopicRegistrar::for_broker(broker.clone()).build();
    registrar
        .handle("jobs", sync_handler(|_| Err(Error::Canceled)))
        .await
        .unwrap();
    // only logs; must not panic or propagate
    broker
        .publish("jobs", Bytes::new(), false, QoS::AtMostOnce)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_timeout_sets_deadline_and_fails_invocation() {
    let seen = Arc::new(Mutex::new(None));
    let seen_in_handler = seen.clone();
    let slow = handler(move |ctx: Ctx| {
        let seen = seen_in_handler.clone();
        async move {
            ctx.done().await;
            *seen.lock().unwrap() = ctx.err().map(|e| e.to_string());
            Ok(())
        }
    });

    let wrapped = compose(
        slow,
        &[Timeout::new(Duration::from_millis(20)).into_middleware()],
    );
    let err = wrapped(test_ctx()).await.unwrap_err();

    assert!(matches!(err, Error::TopicHandlerTimeout(d) if d == Duration::from_millis(20)));
    assert_eq!(
        seen.lock().unwrap().as_deref(),
        Some("context deadline exceeded")
    );
}

#[tokio::test]
async fn test_timeout_with_disconnect_rejects_client() {
    let (tx, _rx) = mpsc::unbounded_channel::<Packet>();
    let client = Arc::new(Client::new(ConnectInfo::new("slowpoke"), tx));

    let slow = handler(|ctx: Ctx| async move {
        ctx.done().await;
        Ok(())
    });
    let wrapped = compose(
        slow,
        &[Timeout::new(Duration::from_millis(20))
            .with_disconnect()
            .into_middleware()],
    );

    let err = wrapped(test_ctx().with_client(client.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TopicHandlerTimeout(_)));
    assert!(matches!(
        client.stop_cause().as_deref(),
        Some(Error::TopicClientRejectedByHandler { .. })
    ));
}

#[tokio::test]
async fn test_timeout_passes_fast_results_through() {
    let wrapped = compose(
        sync_handler(|ctx| {
            assert!(ctx.context().deadline().is_some());
            Err(Error::Canceled)
        }),
        &[Timeout::new(Duration::from_secs(5)).into_middleware()],
    );
    assert!(matches!(wrapped(test_ctx()).await, Err(Error::Canceled)));
}

#[tokio::test]
async fn test_recover_converts_panic() {
    let wrapped = compose(
        sync_handler(|_| panic!("boom")),
        &[recover()],
    );
    let err = wrapped(test_ctx()).await.unwrap_err();
    assert!(matches!(err, Error::TopicHandlerPanic(message) if message == "boom"));

    let formatted = compose(
        handler(|ctx: Ctx| async move {
            let code = ctx.payload().len() + 5;
            if code > 0 {
                panic!("code {code}");
            }
            Ok(())
        }),
        &[recover()],
    );
    let err = formatted(test_ctx()).await.unwrap_err();
    assert!(matches!(err, Error::TopicHandlerPanic(message) if message == "code 7"));
}

#[test]
fn test_topic_context_cancellation() {
    let parent = TopicContext::background();
    let child = parent.with_cancel();
    assert!(child.err().is_none());

    parent.cancel();
    assert!(matches!(child.err(), Some(Error::Canceled)));

    let bounded = TopicContext::background().with_timeout(Duration::from_secs(60));
    let tighter = bounded.with_timeout(Duration::from_secs(120));
    assert_eq!(tighter.deadline(), bounded.deadline());
}

#[tokio::test]
async fn test_ctx_without_publisher_or_client() {
    let ctx = test_ctx();
    assert!(matches!(
        ctx.publish_string("reply", "x", false, QoS::AtMostOnce).await,
        Err(Error::TopicCtxNoPublisher)
    ));
    assert!(matches!(ctx.disconnect().await, Err(Error::TopicCtxNoClient)));
    assert!(matches!(ctx.reject("no").await, Err(Error::TopicCtxNoClient)));
    assert!(ctx.client_id().is_none());
}

#[tokio::test]
async fn test_ctx_disconnect_without_session_controller_stops_client() {
    let (tx, _rx) = mpsc::unbounded_channel::<Packet>();
    let client = Arc::new(Client::new(ConnectInfo::new("c1"), tx));

    test_ctx().with_client(client.clone()).disconnect().await.unwrap();
    assert!(matches!(
        client.stop_cause().as_deref(),
        Some(Error::TopicClientDisconnectedByHandler)
    ));
}

struct NoSessionControl;

#[async_trait]
impl crate::broker::SessionController for NoSessionControl {
    async fn disconnect_client(&self, _client_id: &str, _reason: &str) -> Result<()> {
        Err(Error::SessionControlUnsupported)
    }
}

#[tokio::test]
async fn test_ctx_translates_unsupported_session_control() {
    let (tx, _rx) = mpsc::unbounded_channel::<Packet>();
    let client = Arc::new(Client::new(ConnectInfo::new("c1"), tx));
    let ctx = test_ctx()
        .with_client(client.clone())
        .with_session_controller(Some(Arc::new(NoSessionControl)));

    assert!(matches!(
        ctx.reject("nope").await,
        Err(Error::TopicCtxSessionControlUnsupported)
    ));
    assert!(!client.is_stopped());
}

#[derive(Debug, Deserialize, PartialEq)]
struct Order {
    id: u32,
}

#[tokio::test]
async fn test_handler_replies_and_rejects_through_embedded_broker() {
    let broker = Arc::new(EmbeddedBroker::new());
    let registrar = TopicRegistrar::for_broker(broker.clone()).build();

    let (device, mut packets) = broker.connect(ConnectInfo::new("device-9"));
    broker
        .subscribe_client("device-9", "replies/#", QoS::AtMostOnce)
        .unwrap();

    registrar
        .handle(
            "orders",
            handler(|ctx: Ctx| async move {
                let order: Order = ctx.decode_json()?;
                let client_id = ctx.client_id().unwrap_or_default();
                ctx.publish_json(&format!("replies/{client_id}"), &order.id, false, QoS::AtMostOnce)
                    .await?;
                if order.id == 0 {
                    ctx.reject("invalid order").await?;
                }
                Ok::<(), Error>(())
            }),
        )
        .await
        .unwrap();

    broker
        .inject(&device, Message::new("orders", Bytes::from_static(br#"{"id":42}"#)))
        .await
        .unwrap();
    let Some(Packet::Publish(reply)) = packets.recv().await else {
        panic!("expected reply");
    };
    assert_eq!(reply.topic, "replies/device-9");
    assert_eq!(reply.payload, Bytes::from_static(b"42"));

    broker
        .inject(&device, Message::new("orders", Bytes::from_static(br#"{"id":0}"#)))
        .await
        .unwrap();
    assert!(matches!(
        device.stop_cause().as_deref(),
        Some(Error::SessionDisconnected { reason }) if reason == "invalid order"
    ));
    assert!(broker.client("device-9").is_none());
}

#[tokio::test]
async fn test_identity_and_connect_context_middleware() {
    let broker = Arc::new(EmbeddedBroker::new());
    let identities = Arc::new(IdentityStore::new());
    let contexts = Arc::new(ConnectContextStore::new());
    broker.add_hook(identities.clone());
    broker.add_hook(contexts.clone());

    let registrar = TopicRegistrar::for_broker(broker.clone())
        .identities(identities.clone())
        .build();
    registrar.use_middleware([identity(identities.clone()), connect_context(contexts.clone())]);

    let (tx, mut rx) = mpsc::unbounded_channel();
    registrar
        .handle(
            "whoami",
            sync_handler(move |ctx| {
                let username = ctx.identity().map(|i| i.username.clone());
                let keep_alive = ctx.connect_context().map(|c| c.keep_alive);
                let _ = tx.send((ctx.username(), username, keep_alive));
                Ok(())
            }),
        )
        .await
        .unwrap();

    let mut info = ConnectInfo::new("u1").with_username("carol");
    info.keep_alive = 60;
    let (client, _packets) = broker.connect(info);
    broker
        .inject(&client, Message::new("whoami", Bytes::new()))
        .await
        .unwrap();

    let (username, identity_username, keep_alive) = rx.recv().await.unwrap();
    assert_eq!(username.as_deref(), Some("carol"));
    assert_eq!(identity_username.as_deref(), Some("carol"));
    assert_eq!(keep_alive, Some(60));
}

#[tokio::test]
async fn test_stopped_registrar_removes_embedded_subscriptions() {
    let broker = Arc::new(EmbeddedBroker::new());
    let registrar = TopicRegistrar::for_broker(broker.clone()).build();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    registrar
        .handle(
            "ticks",
            sync_handler(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .await
        .unwrap();

    broker
        .publish("ticks", Bytes::new(), false, QoS::AtMostOnce)
        .await
        .unwrap();
    registrar.stop().await.unwrap();
    broker
        .publish("ticks", Bytes::new(), false, QoS::AtMostOnce)
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
