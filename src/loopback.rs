//! In-process cluster for tests and the demo binary.
//!
//! [`LoopbackCluster`] plays the connection-management collaborator: it owns
//! connections to [`LoopbackMember`]s, reports them through
//! [`ConnectionRegistry`], and emits [`ConnectionEvent`]s and
//! [`ObjectLifecycleEvent`]s. Every request is framed and unframed on its
//! way through so the wire encoding is exercised.
//!
//! Members hold entry-listener subscriptions per connection and push events
//! straight into the client's [`EventDispatcher`]. Faults can be injected per
//! member to simulate rejected registrations, lost responses, malformed
//! responses and slow links.

use crate::codec::{AddEntryListenerRequest, EntryEvent, RemoveEntryListenerRequest};
use crate::connection::{
    Connection, ConnectionEvent, ConnectionId, ConnectionRef, ConnectionRegistry,
    ObjectLifecycleEvent,
};
use crate::dispatch::EventDispatcher;
use crate::error::{HzlinkError, Result};
use crate::protocol::{message_type, ClientMessage};
use crate::registration::{DistributedObjectKey, ServerRegistrationId};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Fault injection switches of one member.
#[derive(Debug, Default)]
struct Faults {
    reject_registrations: bool,
    /// Registrations that are applied but whose responses never arrive.
    lost_register_responses: usize,
    malformed_register_responses: usize,
    /// Answer fresh registrations with the "already registered" status.
    report_already_registered: bool,
    latency: Option<Duration>,
}

#[derive(Debug, Clone)]
struct Subscription {
    handle: ServerRegistrationId,
    key: DistributedObjectKey,
    key_filter: Option<Bytes>,
    include_value: bool,
    local_only: bool,
    correlation_id: u64,
}

/// A simulated cluster member.
#[derive(Debug)]
pub struct LoopbackMember {
    name: String,
    next_handle: AtomicU64,
    /// (connection, client registration id) -> subscription
    subscriptions: Mutex<HashMap<(ConnectionId, String), Subscription>>,
    faults: Mutex<Faults>,
    register_requests: AtomicUsize,
    deregister_requests: AtomicUsize,
}

impl LoopbackMember {
    fn new(name: String) -> Self {
        Self {
            name,
            next_handle: AtomicU64::new(1),
            subscriptions: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            register_requests: AtomicUsize::new(0),
            deregister_requests: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn subscriptions(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(ConnectionId, String), Subscription>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn reject_registrations(&self, reject: bool) {
        self.faults().reject_registrations = reject;
    }

    pub fn lose_register_responses(&self, count: usize) {
        self.faults().lost_register_responses = count;
    }

    pub fn send_malformed_register_responses(&self, count: usize) {
        self.faults().malformed_register_responses = count;
    }

    pub fn report_already_registered(&self, enabled: bool) {
        self.faults().report_already_registered = enabled;
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults().latency = latency;
    }

    fn latency(&self) -> Option<Duration> {
        self.faults().latency
    }

    /// Number of live subscriptions held for `connection`.
    pub fn subscription_count(&self, connection: ConnectionId) -> usize {
        self.subscriptions()
            .keys()
            .filter(|(c, _)| *c == connection)
            .count()
    }

    pub fn total_subscriptions(&self) -> usize {
        self.subscriptions().len()
    }

    pub fn register_requests(&self) -> usize {
        self.register_requests.load(Ordering::SeqCst)
    }

    pub fn deregister_requests(&self) -> usize {
        self.deregister_requests.load(Ordering::SeqCst)
    }

    fn handle(&self, connection: ConnectionId, request: ClientMessage) -> Result<ClientMessage> {
        match request.message_type {
            message_type::ADD_ENTRY_LISTENER_REQUEST => self.add_listener(connection, &request),
            message_type::REMOVE_ENTRY_LISTENER_REQUEST => {
                self.remove_listener(connection, &request)
            }
            other => Ok(ClientMessage::error(
                request.correlation_id,
                &format!("unsupported message type {:#x}", other),
            )),
        }
    }

    fn add_listener(
        &self,
        connection: ConnectionId,
        request: &ClientMessage,
    ) -> Result<ClientMessage> {
        self.register_requests.fetch_add(1, Ordering::SeqCst);
        let correlation_id = request.correlation_id;
        let decoded = match AddEntryListenerRequest::decode(request) {
            Ok(decoded) => decoded,
            Err(e) => return Ok(ClientMessage::error(correlation_id, &e.to_string())),
        };

        let (lose_response, malformed, force_already) = {
            let mut faults = self.faults();
            if faults.reject_registrations {
                return Ok(ClientMessage::error(
                    correlation_id,
                    &format!("{} rejects listener registrations", self.name),
                ));
            }
            let lose = faults.lost_register_responses > 0;
            if lose {
                faults.lost_register_responses -= 1;
            }
            let malformed = !lose && faults.malformed_register_responses > 0;
            if malformed {
                faults.malformed_register_responses -= 1;
            }
            (lose, malformed, faults.report_already_registered)
        };
        if malformed {
            return Ok(ClientMessage::new(
                message_type::ADD_ENTRY_LISTENER_RESPONSE,
                Bytes::from_static(&[7]),
            )
            .with_correlation_id(correlation_id));
        }

        let (handle, already_registered) = {
            let mut subscriptions = self.subscriptions();
            let slot = (connection, decoded.registration_id.clone());
            match subscriptions.get_mut(&slot) {
                Some(existing) => {
                    // Rebind the event stream to the latest attempt.
                    existing.correlation_id = correlation_id;
                    (existing.handle.clone(), true)
                }
                None => {
                    let handle = ServerRegistrationId::new(format!(
                        "{}-reg-{}",
                        self.name,
                        self.next_handle.fetch_add(1, Ordering::SeqCst)
                    ));
                    subscriptions.insert(
                        slot,
                        Subscription {
                            handle: handle.clone(),
                            key: decoded.key.clone(),
                            key_filter: decoded.key_filter.clone(),
                            include_value: decoded.include_value,
                            local_only: decoded.local_only,
                            correlation_id,
                        },
                    );
                    (handle, force_already)
                }
            }
        };
        trace!(
            "{} registered {} for {} on {}",
            self.name,
            handle,
            decoded.key,
            connection
        );

        if lose_response {
            return Err(HzlinkError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "response lost",
            )));
        }
        Ok(AddEntryListenerRequest::response(
            correlation_id,
            &handle,
            already_registered,
        ))
    }

    fn remove_listener(
        &self,
        connection: ConnectionId,
        request: &ClientMessage,
    ) -> Result<ClientMessage> {
        self.deregister_requests.fetch_add(1, Ordering::SeqCst);
        let correlation_id = request.correlation_id;
        let decoded = match RemoveEntryListenerRequest::decode(request) {
            Ok(decoded) => decoded,
            Err(e) => return Ok(ClientMessage::error(correlation_id, &e.to_string())),
        };
        let mut subscriptions = self.subscriptions();
        let before = subscriptions.len();
        subscriptions.retain(|(c, _), sub| {
            !(*c == connection && sub.handle == decoded.server_registration_id)
        });
        let removed = subscriptions.len() < before;
        Ok(RemoveEntryListenerRequest::response(correlation_id, removed))
    }

    fn drop_connection(&self, connection: ConnectionId) {
        self.subscriptions().retain(|(c, _), _| *c != connection);
    }

    fn drop_object(&self, key: &DistributedObjectKey) {
        self.subscriptions().retain(|_, sub| &sub.key != key);
    }

    /// Events this member sends for an entry change that happened on `origin`.
    fn events_for(
        &self,
        key: &DistributedObjectKey,
        event: &EntryEvent,
        is_origin: bool,
    ) -> Vec<(ConnectionId, ClientMessage)> {
        self.subscriptions()
            .iter()
            .filter(|(_, sub)| &sub.key == key)
            .filter(|(_, sub)| is_origin || !sub.local_only)
            .filter(|(_, sub)| {
                sub.key_filter
                    .as_ref()
                    .map_or(true, |filter| *filter == event.key)
            })
            .map(|((connection, _), sub)| {
                let payload = EntryEvent {
                    key: event.key.clone(),
                    value: if sub.include_value {
                        event.value.clone()
                    } else {
                        None
                    },
                };
                (*connection, payload.encode(sub.correlation_id))
            })
            .collect()
    }
}

/// A connection from the client to one [`LoopbackMember`].
#[derive(Debug)]
pub struct LoopbackConnection {
    id: ConnectionId,
    member: Arc<LoopbackMember>,
    alive: AtomicBool,
}

#[async_trait]
impl Connection for LoopbackConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn send(&self, request: ClientMessage) -> Result<ClientMessage> {
        if !self.is_alive() {
            return Err(HzlinkError::ConnectionClosed(self.id.0));
        }
        let request = ClientMessage::decode(request.encode())?;
        if let Some(latency) = self.member.latency() {
            tokio::time::sleep(latency).await;
        }
        if !self.is_alive() {
            return Err(HzlinkError::ConnectionClosed(self.id.0));
        }
        let response = self.member.handle(self.id, request)?;
        ClientMessage::decode(response.encode())
    }
}

/// Simulated cluster plus connection manager.
#[derive(Debug)]
pub struct LoopbackCluster {
    dispatcher: Arc<EventDispatcher>,
    next_connection_id: AtomicU64,
    members: RwLock<BTreeMap<String, Arc<LoopbackMember>>>,
    connections: RwLock<BTreeMap<ConnectionId, Arc<LoopbackConnection>>>,
    connection_events: broadcast::Sender<ConnectionEvent>,
    lifecycle_events: broadcast::Sender<ObjectLifecycleEvent>,
}

impl LoopbackCluster {
    /// Events are delivered into `dispatcher`, the client's handler table.
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Arc<Self> {
        Self::with_event_capacity(dispatcher, EVENT_CHANNEL_CAPACITY)
    }

    /// Like [`LoopbackCluster::new`], with bounded event streams of
    /// `capacity` notifications. Slow subscribers see `Lagged`.
    pub fn with_event_capacity(dispatcher: Arc<EventDispatcher>, capacity: usize) -> Arc<Self> {
        let (connection_events, _) = broadcast::channel(capacity);
        let (lifecycle_events, _) = broadcast::channel(capacity);
        Arc::new(Self {
            dispatcher,
            next_connection_id: AtomicU64::new(1),
            members: RwLock::new(BTreeMap::new()),
            connections: RwLock::new(BTreeMap::new()),
            connection_events,
            lifecycle_events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection_events.subscribe()
    }

    pub fn lifecycle_events(&self) -> broadcast::Receiver<ObjectLifecycleEvent> {
        self.lifecycle_events.subscribe()
    }

    pub fn add_member(&self, name: &str) -> Arc<LoopbackMember> {
        let member = Arc::new(LoopbackMember::new(name.to_string()));
        self.members
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Arc::clone(&member));
        member
    }

    /// Open a connection to `member` and announce it.
    pub fn connect(&self, member: &Arc<LoopbackMember>) -> ConnectionRef {
        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::SeqCst));
        let connection = Arc::new(LoopbackConnection {
            id,
            member: Arc::clone(member),
            alive: AtomicBool::new(true),
        });
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(&connection));
        debug!("Opened {} to {}", id, member.name());
        let connection: ConnectionRef = connection;
        let _ = self
            .connection_events
            .send(ConnectionEvent::Opened(Arc::clone(&connection)));
        connection
    }

    /// Close a connection: it stops answering, the member forgets its
    /// subscriptions, and the close is announced.
    pub fn close(&self, id: ConnectionId) -> bool {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        let Some(connection) = removed else {
            return false;
        };
        connection.alive.store(false, Ordering::SeqCst);
        connection.member.drop_connection(id);
        debug!("Closed {} to {}", id, connection.member.name());
        let _ = self.connection_events.send(ConnectionEvent::Closed(id));
        true
    }

    pub fn restore_heartbeat(&self, id: ConnectionId) -> bool {
        let connection = self
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned();
        match connection {
            Some(connection) => {
                let _ = self
                    .connection_events
                    .send(ConnectionEvent::HeartbeatRestored(connection));
                true
            }
            None => false,
        }
    }

    /// Destroy a distributed object cluster-wide.
    pub fn destroy_object(&self, key: &DistributedObjectKey) {
        for member in self.members.read().unwrap_or_else(|e| e.into_inner()).values() {
            member.drop_object(key);
        }
        let _ = self
            .lifecycle_events
            .send(ObjectLifecycleEvent::Destroyed(key.clone()));
    }

    /// Apply an entry change on `origin` and deliver the resulting events.
    /// Returns the number of events that reached a handler.
    pub fn publish(
        &self,
        origin: &Arc<LoopbackMember>,
        key: &DistributedObjectKey,
        event: EntryEvent,
    ) -> usize {
        let members: Vec<_> = self
            .members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut delivered = 0;
        for member in members {
            let is_origin = Arc::ptr_eq(&member, origin);
            for (connection_id, message) in member.events_for(key, &event, is_origin) {
                let alive = self
                    .connections
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&connection_id)
                    .map_or(false, |c| c.is_alive());
                if alive && self.dispatcher.dispatch(connection_id, message) {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

impl ConnectionRegistry for LoopbackCluster {
    fn active_connections(&self) -> Vec<ConnectionRef> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|c| c.is_alive())
            .map(|c| Arc::clone(c) as ConnectionRef)
            .collect()
    }
}
