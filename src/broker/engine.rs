//! In-process broker engine
//!
//! This module contains the routing core used by the embedded broker:
//! - a registry of connected clients, keyed by client id
//! - client subscriptions (filter -> subscribers with their QoS)
//! - inline subscriptions: callbacks registered by in-process code
//! - connect/disconnect hooks for components whose state lives exactly as
//!   long as a client session
//!
//! The engine is synchronous and meant to sit behind a lock
//! (`Arc<Mutex<Engine>>`). It only *computes* routes; callers deliver
//! packets and await inline handlers after releasing the lock.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use super::topic::{SubscriberId, Topic};
use super::{Message, MessageHandler, Subscription};
use crate::client::Client;
use crate::protocol::QoS;
use crate::utils::Error;

/// Observer of client session lifetimes.
///
/// Hooks run synchronously while the session is being registered or removed,
/// so they must not block.
pub trait EngineHook: Send + Sync {
    fn on_connect(&self, _client: &Client) {}

    fn on_disconnect(&self, _client: &Client, _cause: Option<&Error>) {}
}

/// Where a published message has to go.
#[derive(Default)]
pub struct Route {
    pub clients: Vec<(Arc<Client>, QoS)>,
    pub handlers: Vec<(Subscription, MessageHandler)>,
}

#[derive(Default)]
pub struct Engine {
    pub topics: HashMap<String, Topic>,
    pub clients: HashMap<SubscriberId, Arc<Client>>,
    inline: BTreeMap<String, BTreeMap<u64, MessageHandler>>,
    hooks: Vec<Arc<dyn EngineHook>>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hook(&mut self, hook: Arc<dyn EngineHook>) {
        self.hooks.push(hook);
    }

    pub fn hooks(&self) -> Vec<Arc<dyn EngineHook>> {
        self.hooks.clone()
    }

    /// Registers a client, returning the session it replaced, if any.
    pub fn register_client(&mut self, client: Arc<Client>) -> Option<Arc<Client>> {
        self.clients.insert(client.id.clone(), client)
    }

    pub fn remove_client(&mut self, client_id: &str) -> Option<Arc<Client>> {
        self.clients.remove(client_id)
    }

    pub fn client(&self, client_id: &str) -> Option<Arc<Client>> {
        self.clients.get(client_id).cloned()
    }

    /// Subscribes a client to a filter. Automatically creates the topic entry.
    pub fn subscribe(&mut self, filter: &str, subscriber: SubscriberId, qos: QoS) {
        self.topics
            .entry(filter.to_string())
            .or_insert_with(|| Topic::new(filter))
            .subscribe(subscriber, qos);
    }

    /// Unsubscribes a client; empty topic entries are dropped.
    pub fn unsubscribe(&mut self, filter: &str, subscriber: &SubscriberId) {
        if let Some(topic) = self.topics.get_mut(filter) {
            topic.unsubscribe(subscriber);
            if topic.subscribers.is_empty() {
                self.topics.remove(filter);
            }
        }
    }

    /// Removes a client and all of its subscriptions.
    pub fn cleanup_client(&mut self, client_id: &SubscriberId) -> Option<Arc<Client>> {
        let removed = self.remove_client(client_id);

        self.topics.retain(|filter, topic| {
            if topic.subscribers.remove(client_id).is_some() {
                tracing::debug!(client_id = %client_id, filter = %filter, "unsubscribed client");
            }
            !topic.subscribers.is_empty()
        });

        removed
    }

    pub fn add_inline(&mut self, filter: &str, id: u64, handler: MessageHandler) {
        self.inline
            .entry(filter.to_string())
            .or_default()
            .insert(id, handler);
    }

    /// Returns whether a handler was registered under `filter`/`id`.
    pub fn remove_inline(&mut self, filter: &str, id: u64) -> bool {
        let Some(handlers) = self.inline.get_mut(filter) else {
            return false;
        };
        let removed = handlers.remove(&id).is_some();
        if handlers.is_empty() {
            self.inline.remove(filter);
        }
        removed
    }

    pub fn inline_count(&self) -> usize {
        self.inline.values().map(BTreeMap::len).sum()
    }

    /// Computes the recipients of `message`. A client subscribed through
    /// several matching filters receives it once, at the highest granted QoS.
    pub fn route(&self, message: &Message) -> Route {
        let mut granted: HashMap<&str, QoS> = HashMap::new();
        for topic in self.topics.values().filter(|t| t.matches(&message.topic)) {
            for (subscriber, qos) in &topic.subscribers {
                let qos = (*qos).min(message.qos);
                let entry = granted.entry(subscriber.as_str()).or_insert(qos);
                *entry = (*entry).max(qos);
            }
        }

        let clients = granted
            .into_iter()
            .filter_map(|(id, qos)| self.clients.get(id).map(|c| (c.clone(), qos)))
            .collect();

        let handlers = self
            .inline
            .iter()
            .filter(|(filter, _)| super::topic::matches(&message.topic, filter))
            .flat_map(|(filter, handlers)| {
                handlers
                    .iter()
                    .map(move |(id, h)| (Subscription::new(filter.clone(), *id), h.clone()))
            })
            .collect();

        Route { clients, handlers }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("topics", &self.topics)
            .field("clients", &self.clients.keys().collect::<Vec<_>>())
            .field("inline_subscriptions", &self.inline_count())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
