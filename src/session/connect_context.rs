use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::broker::EngineHook;
use crate::client::Client;
use crate::utils::Error;

/// Facts captured when a client connected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectContext {
    pub client_id: String,
    pub username: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub remote_addr: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl ConnectContext {
    pub fn from_client(client: &Client) -> Self {
        Self {
            client_id: client.id.clone(),
            username: client.username().to_string(),
            clean_session: client.connect.clean_session,
            keep_alive: client.connect.keep_alive,
            remote_addr: client.connect.remote_addr.clone(),
            connected_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectContextStore {
    contexts: RwLock<HashMap<String, Arc<ConnectContext>>>,
}

impl ConnectContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, context: ConnectContext) {
        self.contexts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(context.client_id.clone(), Arc::new(context));
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<ConnectContext>> {
        self.contexts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(client_id)
            .cloned()
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<ConnectContext>> {
        self.contexts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(client_id)
    }

    /// Attaches a metadata entry to a live session. Returns `false` if the
    /// client is unknown.
    pub fn set_metadata(&self, client_id: &str, key: impl Into<String>, value: impl Into<String>) -> bool {
        let mut contexts = self
            .contexts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(context) = contexts.get_mut(client_id) else {
            return false;
        };
        Arc::make_mut(context).metadata.insert(key.into(), value.into());
        true
    }

    pub fn len(&self) -> usize {
        self.contexts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EngineHook for ConnectContextStore {
    fn on_connect(&self, client: &Client) {
        self.insert(ConnectContext::from_client(client));
    }

    fn on_disconnect(&self, client: &Client, _cause: Option<&Error>) {
        self.remove(&client.id);
    }
}
