//! Local event handler table.
//!
//! Each registration attempt gets its own correlation id. Members stamp the
//! events of a registration with that id, so routing an incoming event is a
//! single map lookup.

use crate::connection::ConnectionId;
use crate::protocol::ClientMessage;
use crate::registration::UserRegistrationId;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::trace;

/// Event delivered to a listener callback.
#[derive(Debug, Clone)]
pub struct ListenerEvent {
    pub registration_id: UserRegistrationId,
    /// Connection the event arrived on.
    pub connection: ConnectionId,
    pub message_type: u32,
    pub payload: Bytes,
}

/// Listener callback.
pub type EventHandler = Arc<dyn Fn(ListenerEvent) + Send + Sync>;

#[derive(Clone)]
struct Route {
    registration_id: UserRegistrationId,
    handler: EventHandler,
}

/// Correlation id allocation and event routing.
pub struct EventDispatcher {
    next_correlation_id: AtomicU64,
    routes: RwLock<HashMap<u64, Route>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            next_correlation_id: AtomicU64::new(1),
            routes: RwLock::new(HashMap::new()),
        }
    }

    pub fn next_correlation_id(&self) -> u64 {
        self.next_correlation_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add_event_handler(
        &self,
        correlation_id: u64,
        registration_id: UserRegistrationId,
        handler: EventHandler,
    ) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.insert(
            correlation_id,
            Route {
                registration_id,
                handler,
            },
        );
    }

    /// Returns whether a handler was installed for `correlation_id`.
    pub fn remove_event_handler(&self, correlation_id: u64) -> bool {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.remove(&correlation_id).is_some()
    }

    /// Route an event received on `connection`. Returns whether a handler ran.
    pub fn dispatch(&self, connection: ConnectionId, event: ClientMessage) -> bool {
        let route = {
            let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
            routes.get(&event.correlation_id).cloned()
        };
        match route {
            Some(route) => {
                // Called without the table lock so handlers may add or remove listeners.
                (route.handler)(ListenerEvent {
                    registration_id: route.registration_id,
                    connection,
                    message_type: event.message_type,
                    payload: event.payload,
                });
                true
            }
            None => {
                trace!(
                    "Dropping event {:#x} for unknown correlation id {} on {}",
                    event.message_type,
                    event.correlation_id,
                    connection
                );
                false
            }
        }
    }

    pub fn handler_count(&self) -> usize {
        self.routes.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handler_count())
            .finish()
    }
}
