use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::{Connection, PeerRole, TransportError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection {0} is not registered")]
    UnknownConnection(Uuid),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Live connections keyed by id.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<Uuid, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: Arc<Connection>) -> usize {
        debug!(
            connection_id = %connection.id(),
            role = %connection.role(),
            "registering connection"
        );
        self.connections.insert(connection.id(), connection);
        self.connections.len()
    }

    pub fn unregister(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.connections.remove(&id).map(|(_, connection)| connection)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn count_role(&self, role: PeerRole) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().role() == role)
            .count()
    }

    /// Unicast to one connection.
    pub async fn send_to<T: Serialize + ?Sized>(
        &self,
        id: Uuid,
        message: &T,
    ) -> Result<(), RegistryError> {
        let connection = self.get(id).ok_or(RegistryError::UnknownConnection(id))?;
        connection.send(message).await?;
        Ok(())
    }

    /// Broadcast to every open connection with `role`. Returns how many
    /// connections accepted the message.
    pub async fn send_to_all<T: Serialize + ?Sized>(&self, role: PeerRole, message: &T) -> usize {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to encode broadcast");
                return 0;
            }
        };

        // Collect first so no map guard is held across an await.
        let targets: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|entry| entry.value().role() == role)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut delivered = 0usize;
        for connection in targets {
            match connection.send_text(text.clone()).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    debug!(connection_id = %connection.id(), error = %err, "broadcast skipped")
                }
            }
        }
        delivered
    }

    /// Closes and forgets every connection.
    pub async fn close_all(&self) {
        let ids: Vec<Uuid> = self.connections.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some(connection) = self.unregister(id) {
                connection.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidewatch_proto::Status;

    #[test_timeout::tokio_timeout_test]
    async fn unicast_reaches_only_the_target() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = Connection::in_memory(PeerRole::Console);
        let (second, mut second_rx) = Connection::in_memory(PeerRole::Console);
        registry.register(Arc::clone(&first));
        registry.register(Arc::clone(&second));

        registry
            .send_to(first.id(), &Status::info("hi"))
            .await
            .unwrap();
        assert!(first_rx.recv().await.is_some());
        assert!(second_rx.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn unicast_to_unknown_id_fails() {
        let registry = ConnectionRegistry::new();
        let err = registry
            .send_to(Uuid::new_v4(), &Status::info("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownConnection(_)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn broadcast_filters_by_role_and_skips_closed() {
        let registry = ConnectionRegistry::new();
        let (console, mut console_rx) = Connection::in_memory(PeerRole::Console);
        let (closed, _closed_rx) = Connection::in_memory(PeerRole::Console);
        let (observer, mut observer_rx) = Connection::in_memory(PeerRole::Observer);
        registry.register(console);
        registry.register(Arc::clone(&closed));
        registry.register(observer);
        closed.close().await;

        let delivered = registry
            .send_to_all(PeerRole::Console, &Status::info("shutting down"))
            .await;
        assert_eq!(delivered, 1);
        assert!(console_rx.recv().await.is_some());
        assert!(observer_rx.try_recv().is_err());
        assert_eq!(registry.count_role(PeerRole::Observer), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_all_empties_registry() {
        let registry = ConnectionRegistry::new();
        let (connection, _rx) = Connection::in_memory(PeerRole::Console);
        registry.register(Arc::clone(&connection));
        registry.close_all().await;
        assert!(registry.is_empty());
        assert!(!connection.is_open());
    }
}
