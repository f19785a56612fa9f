// src/server/backend.rs

//! Pluggable message delivery for the coordinator runtime.
//!
//! The runtime talks to a [`MessageBackend`] instead of sockets. Production
//! uses [`TcpBackend`], which forwards each message to the writer task of
//! the peer's connection; tests can record the messages instead.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::errors::{GovernorError, Result};
use crate::protocol::{ToClient, ToWorker};
use crate::types::{ClientId, WorkerId};

pub type BackendFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// How the coordinator reaches its peers.
pub trait MessageBackend: Send {
    fn send_to_worker(&mut self, worker: WorkerId, message: ToWorker) -> BackendFuture<'_>;

    fn send_to_client(&mut self, client: ClientId, message: ToClient) -> BackendFuture<'_>;

    /// Close the connection of a worker that was declared dead.
    fn disconnect_worker(&mut self, worker: WorkerId) -> BackendFuture<'_>;
}

/// Outgoing queues of the live connections, keyed by peer id.
#[derive(Debug)]
pub struct ConnectionTable<K, M> {
    inner: Arc<Mutex<HashMap<K, mpsc::UnboundedSender<M>>>>,
}

impl<K, M> Clone for ConnectionTable<K, M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, M> Default for ConnectionTable<K, M> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash + Copy, M> ConnectionTable<K, M> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<K, mpsc::UnboundedSender<M>>>> {
        self.inner
            .lock()
            .map_err(|_| GovernorError::Protocol("connection table poisoned".into()))
    }

    pub fn insert(&self, id: K, tx: mpsc::UnboundedSender<M>) -> Result<()> {
        self.lock()?.insert(id, tx);
        Ok(())
    }

    pub fn remove(&self, id: K) -> Result<bool> {
        Ok(self.lock()?.remove(&id).is_some())
    }

    pub fn len(&self) -> usize {
        self.lock().map_or(0, |table| table.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue `message` for `id`. Fails if the peer is not connected.
    pub fn send(&self, id: K, message: M) -> Result<()> {
        let table = self.lock()?;
        let tx = table.get(&id).ok_or(GovernorError::ConnectionClosed)?;
        tx.send(message).map_err(|_| GovernorError::ConnectionClosed)
    }
}

/// Backend over the TCP connections accepted by the listener.
#[derive(Debug, Clone, Default)]
pub struct TcpBackend {
    pub workers: ConnectionTable<WorkerId, ToWorker>,
    pub clients: ConnectionTable<ClientId, ToClient>,
}

impl TcpBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageBackend for TcpBackend {
    fn send_to_worker(&mut self, worker: WorkerId, message: ToWorker) -> BackendFuture<'_> {
        let result = self.workers.send(worker, message);
        Box::pin(async move { result })
    }

    fn send_to_client(&mut self, client: ClientId, message: ToClient) -> BackendFuture<'_> {
        let result = self.clients.send(client, message);
        Box::pin(async move { result })
    }

    fn disconnect_worker(&mut self, worker: WorkerId) -> BackendFuture<'_> {
        // Dropping the sender ends the writer task, which shuts the socket.
        let result = self.workers.remove(worker).map(|_| ());
        Box::pin(async move { result })
    }
}
