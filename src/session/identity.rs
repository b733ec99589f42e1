use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::broker::EngineHook;
use crate::client::{Client, ConnectInfo};
use crate::utils::Error;

/// Who a client is, as established when it connected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub client_id: String,
    pub username: String,
    #[serde(default)]
    pub claims: HashMap<String, serde_json::Value>,
}

impl ClientIdentity {
    pub fn new(client_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            username: username.into(),
            claims: HashMap::new(),
        }
    }

    pub fn with_claim(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.claims.insert(key.into(), value);
        self
    }

    pub fn claim(&self, key: &str) -> Option<&serde_json::Value> {
        self.claims.get(key)
    }
}

/// Builds the identity for a connecting client; `None` stores nothing.
pub type IdentityResolver = Arc<dyn Fn(&ConnectInfo) -> Option<ClientIdentity> + Send + Sync>;

pub struct IdentityStore {
    identities: RwLock<HashMap<String, Arc<ClientIdentity>>>,
    resolver: IdentityResolver,
}

impl Default for IdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityStore {
    /// A store whose identities carry the connect-time client id and
    /// username and no claims.
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(|info: &ConnectInfo| {
            Some(ClientIdentity::new(
                info.client_id.clone(),
                info.username.clone().unwrap_or_default(),
            ))
        }))
    }

    pub fn with_resolver(resolver: IdentityResolver) -> Self {
        Self {
            identities: RwLock::new(HashMap::new()),
            resolver,
        }
    }

    pub fn insert(&self, identity: ClientIdentity) {
        self.identities
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(identity.client_id.clone(), Arc::new(identity));
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<ClientIdentity>> {
        self.identities
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(client_id)
            .cloned()
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<ClientIdentity>> {
        self.identities
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(client_id)
    }

    pub fn len(&self) -> usize {
        self.identities
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EngineHook for IdentityStore {
    fn on_connect(&self, client: &Client) {
        match (self.resolver)(&client.connect) {
            Some(mut identity) => {
                // The store is keyed by the session's id, which may have been generated.
                identity.client_id = client.id.clone();
                self.insert(identity);
            }
            None => tracing::debug!(client_id = %client.id, "no identity resolved"),
        }
    }

    fn on_disconnect(&self, client: &Client, _cause: Option<&Error>) {
        self.remove(&client.id);
    }
}

impl fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityStore")
            .field("identities", &self.len())
            .finish()
    }
}
