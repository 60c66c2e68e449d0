//! Client facade.

use crate::codec::{EntryEvent, EntryListenerCodec, EntryListenerOptions, ListenerCodec};
use crate::config::Config;
use crate::connection::{ConnectionEvent, ConnectionRegistry, ObjectLifecycleEvent};
use crate::dispatch::{EventDispatcher, EventHandler, ListenerEvent};
use crate::error::{HzlinkError, Result};
use crate::listener::ListenerService;
use crate::loopback::LoopbackCluster;
use crate::protocol::message_type;
use crate::reference_id::{ReferenceId, ReferenceIdGenerator};
use crate::registration::{DistributedObjectKey, RegistrationState, UserRegistrationId};
use crate::time_unit::{self, TimeUnit, TimeValue};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Entry point of the invocation layer: listener registration plus
/// reference ids for lock-style operations.
#[derive(Debug, Clone)]
pub struct Client {
    config: Config,
    listeners: ListenerService,
    reference_ids: Arc<ReferenceIdGenerator>,
}

impl Client {
    /// Build a client on top of an existing connection manager. Call
    /// [`Client::start`] before adding listeners so connection changes are
    /// followed.
    pub fn new(
        config: Config,
        connections: Arc<dyn ConnectionRegistry>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Result<Self> {
        config.validate()?;
        let listeners = ListenerService::new(&config, connections, dispatcher);
        Ok(Self {
            config,
            listeners,
            reference_ids: Arc::new(ReferenceIdGenerator::new()),
        })
    }

    /// Build and start a client backed by an in-process [`LoopbackCluster`].
    /// Must be called inside a tokio runtime.
    pub fn with_loopback(config: Config) -> Result<(Self, Arc<LoopbackCluster>)> {
        let dispatcher = Arc::new(EventDispatcher::new());
        let cluster = LoopbackCluster::new(Arc::clone(&dispatcher));
        let client = Self::new(config, cluster.clone(), dispatcher)?;
        client.start(cluster.subscribe(), cluster.lifecycle_events());
        Ok((client, cluster))
    }

    pub fn start(
        &self,
        connection_events: broadcast::Receiver<ConnectionEvent>,
        lifecycle_events: broadcast::Receiver<ObjectLifecycleEvent>,
    ) {
        self.listeners.start(connection_events, lifecycle_events);
        info!("Client started");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn listeners(&self) -> &ListenerService {
        &self.listeners
    }

    /// Listen to entry events of a map-like object, waiting up to the
    /// configured registration timeout for a first confirmation.
    pub async fn add_entry_listener<F>(
        &self,
        key: DistributedObjectKey,
        options: EntryListenerOptions,
        handler: F,
    ) -> Result<UserRegistrationId>
    where
        F: Fn(EntryEvent) + Send + Sync + 'static,
    {
        let timeout = self.config.listener.registration_timeout()?;
        self.listeners
            .add_listener(
                key,
                Arc::new(EntryListenerCodec::new(options)),
                entry_handler(handler),
                timeout,
            )
            .await
    }

    /// Add a listener of any kind with an explicit `(value, unit)` timeout.
    pub async fn add_listener_with_timeout(
        &self,
        key: DistributedObjectKey,
        codec: Arc<dyn ListenerCodec>,
        handler: EventHandler,
        timeout: impl Into<TimeValue>,
        unit: TimeUnit,
    ) -> Result<UserRegistrationId> {
        let timeout = time_unit::to_duration(timeout, unit)?;
        self.listeners.add_listener(key, codec, handler, timeout).await
    }

    pub async fn remove_listener(
        &self,
        key: &DistributedObjectKey,
        id: UserRegistrationId,
    ) -> Result<bool> {
        self.listeners.remove_listener(key, id).await
    }

    pub fn registration_state(&self, id: UserRegistrationId) -> Option<RegistrationState> {
        self.listeners.registration_state(id)
    }

    /// Reference id for the next lock-style invocation.
    pub fn next_reference_id(&self) -> Result<ReferenceId> {
        if self.listeners.is_shutdown() {
            return Err(HzlinkError::ClientShutdown);
        }
        self.reference_ids.next()
    }

    pub fn shutdown(&self) {
        self.listeners.shutdown();
    }
}

/// Decode entry events before handing them to the user callback. Malformed
/// events are dropped.
fn entry_handler<F>(handler: F) -> EventHandler
where
    F: Fn(EntryEvent) + Send + Sync + 'static,
{
    Arc::new(move |event: ListenerEvent| {
        if event.message_type != message_type::ENTRY_EVENT {
            warn!(
                "Unexpected event type {:#x} for listener {}",
                event.message_type, event.registration_id
            );
            return;
        }
        match EntryEvent::decode(event.payload) {
            Ok(entry) => handler(entry),
            Err(e) => warn!(
                "Dropping malformed entry event for listener {}: {}",
                event.registration_id, e
            ),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_reference_ids_are_sequential() {
        let (client, _cluster) = Client::with_loopback(Config::default()).unwrap();
        assert_eq!(client.next_reference_id().unwrap().get(), 1);
        assert_eq!(client.next_reference_id().unwrap().get(), 2);

        client.shutdown();
        assert!(matches!(
            client.next_reference_id(),
            Err(HzlinkError::ClientShutdown)
        ));
    }

    #[tokio::test]
    async fn test_entry_listener_receives_decoded_events() {
        let (client, cluster) = Client::with_loopback(Config::default()).unwrap();
        let member = cluster.add_member("m1");
        cluster.connect(&member);
        let key = DistributedObjectKey::new("hz:impl:mapService", "orders");

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let id = client
            .add_entry_listener(
                key.clone(),
                EntryListenerOptions {
                    include_value: true,
                    key: None,
                },
                move |event| {
                    assert_eq!(event.value.as_deref(), Some(&b"v"[..]));
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await
            .unwrap();

        let event = EntryEvent {
            key: bytes::Bytes::from_static(b"k"),
            value: Some(bytes::Bytes::from_static(b"v")),
        };
        assert_eq!(cluster.publish(&member, &key, event), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert!(client.remove_listener(&key, id).await.unwrap());
        assert!(client.registration_state(id).is_none());
    }

    #[tokio::test]
    async fn test_invalid_timeout_rejected() {
        let (client, _cluster) = Client::with_loopback(Config::default()).unwrap();
        let result = client
            .add_listener_with_timeout(
                DistributedObjectKey::new("svc", "obj"),
                Arc::new(EntryListenerCodec::default()),
                Arc::new(|_: ListenerEvent| {}),
                "later",
                TimeUnit::Seconds,
            )
            .await;
        assert!(matches!(result, Err(HzlinkError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_add_after_shutdown_rejected() {
        let (client, _cluster) = Client::with_loopback(Config::default()).unwrap();
        client.shutdown();
        let result = client
            .add_entry_listener(
                DistributedObjectKey::new("svc", "obj"),
                EntryListenerOptions::default(),
                |_| {},
            )
            .await;
        assert!(matches!(result, Err(HzlinkError::ClientShutdown)));
    }
}
