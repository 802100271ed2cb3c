//! Connected page clients of the background context.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::status::{StatusMessage, VmStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Handle used to post messages back to one client.
#[derive(Clone)]
pub struct Client {
    id: ClientId,
    tx: mpsc::UnboundedSender<String>,
    controlled: Arc<AtomicBool>,
}

impl Client {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether the background context has claimed routing authority over this client.
    pub fn is_controlled(&self) -> bool {
        self.controlled.load(Ordering::Acquire)
    }

    pub fn post_message(&self, message: String) -> bool {
        if self.tx.send(message).is_err() {
            tracing::warn!(client = %self.id, "client went away; dropping message");
            return false;
        }
        true
    }

    pub fn post_status(&self, status: &VmStatus) -> bool {
        tracing::debug!(client = %self.id, "vm status: {status}");
        self.post_message(StatusMessage::new(status).to_json())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("controlled", &self.is_controlled())
            .finish()
    }
}

/// Registry of clients keyed by id.
#[derive(Default)]
pub struct Clients {
    inner: Mutex<HashMap<ClientId, Client>>,
    next_id: AtomicU64,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client; the receiver yields every message posted to it.
    pub fn register(&self) -> (Client, mpsc::UnboundedReceiver<String>) {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Client {
            id,
            tx,
            controlled: Arc::new(AtomicBool::new(false)),
        };
        self.inner
            .lock()
            .expect("client registry poisoned")
            .insert(id, client.clone());
        (client, rx)
    }

    /// Resolve a client; `None` once it was removed or stopped listening.
    pub fn get(&self, id: ClientId) -> Option<Client> {
        let clients = self.inner.lock().expect("client registry poisoned");
        clients.get(&id).filter(|c| !c.is_closed()).cloned()
    }

    pub fn remove(&self, id: ClientId) -> Option<Client> {
        self.inner
            .lock()
            .expect("client registry poisoned")
            .remove(&id)
    }

    /// Claim routing authority over every current client.
    ///
    /// Returns the number of clients newly claimed by this call.
    pub fn claim(&self) -> usize {
        let clients = self.inner.lock().expect("client registry poisoned");
        let claimed = clients
            .values()
            .filter(|c| !c.controlled.swap(true, Ordering::AcqRel))
            .count();
        if claimed > 0 {
            tracing::debug!("claimed {claimed} client(s)");
        }
        claimed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("client registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
