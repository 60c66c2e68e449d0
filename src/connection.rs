//! Connection-management collaborator interface.
//!
//! Connections are owned elsewhere. This crate only sends requests over them
//! and reacts to the lifecycle notifications in [`ConnectionEvent`].

use crate::error::Result;
use crate::protocol::ClientMessage;
use crate::registration::DistributedObjectKey;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Identity of one live connection. Never reused by a connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection[{}]", self.0)
    }
}

/// A connection to one cluster member.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    fn id(&self) -> ConnectionId;

    /// Must turn `false` before the matching [`ConnectionEvent::Closed`] is
    /// emitted.
    fn is_alive(&self) -> bool;

    /// Send `request` (already stamped with its correlation id) and wait for
    /// the response carrying the same correlation id.
    async fn send(&self, request: ClientMessage) -> Result<ClientMessage>;
}

pub type ConnectionRef = Arc<dyn Connection>;

/// Lookup of currently open connections.
pub trait ConnectionRegistry: Send + Sync {
    fn active_connections(&self) -> Vec<ConnectionRef>;
}

/// Notifications from the connection manager.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Opened(ConnectionRef),
    Closed(ConnectionId),
    /// Heartbeats resumed on a connection that had stopped answering.
    HeartbeatRestored(ConnectionRef),
}

/// Notifications from the distributed-object lifecycle mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectLifecycleEvent {
    Created(DistributedObjectKey),
    Destroyed(DistributedObjectKey),
}
