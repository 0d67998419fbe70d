//! In-memory mirror of live credential handles.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::client::{ClientId, SharedClient};

#[derive(Default)]
pub struct ClientPool {
    clients: RwLock<HashMap<ClientId, SharedClient>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, client: SharedClient) {
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        clients.insert(client.client_id.clone(), client);
    }

    pub fn remove(&self, client_id: &str) -> Option<SharedClient> {
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        clients.remove(client_id)
    }

    pub fn get(&self, client_id: &str) -> Option<SharedClient> {
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        clients.get(client_id).cloned()
    }

    pub fn all(&self) -> Vec<SharedClient> {
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<SharedClient> = clients.values().cloned().collect();
        out.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        out
    }

    pub fn len(&self) -> usize {
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type SharedClientPool = Arc<ClientPool>;
