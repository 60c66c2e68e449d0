//! Listener registration bookkeeping.
//!
//! A [`RegistrationRecord`] describes one logical listener: what to send to
//! a member to register it and which server-side handle each open connection
//! currently holds for it. The [`RegistrationTable`] stores the live records
//! per distributed object and is what the reconnection sweep walks.

use crate::codec::ListenerCodec;
use crate::connection::ConnectionId;
use crate::dispatch::EventHandler;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::watch;
use uuid::Uuid;

/// Identity of a distributed object: `(service name, object name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DistributedObjectKey {
    service_name: String,
    object_name: String,
}

impl DistributedObjectKey {
    pub fn new(service_name: impl Into<String>, object_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            object_name: object_name.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }
}

impl fmt::Display for DistributedObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_name, self.object_name)
    }
}

/// Id handed back to the caller of `add_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserRegistrationId(Uuid);

impl UserRegistrationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for UserRegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registration handle assigned by a member.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerRegistrationId(String);

impl ServerRegistrationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerRegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What one connection holds for a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRegistration {
    pub server_registration_id: ServerRegistrationId,
    /// Correlation id the member stamps on this registration's events.
    pub correlation_id: u64,
}

/// Progress of a record across the open connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// No open connection has acknowledged the registration.
    Pending,
    PartiallyRegistered,
    FullyRegistered,
    /// Terminal.
    Removed,
}

/// Whether a registration attempt on a connection may go ahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptPermit {
    Proceed,
    AlreadyRegistered,
    InFlight,
    Removed,
}

/// What became of a completed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptOutcome {
    Stored,
    /// Removal started while the request was in flight.
    Removed,
    /// The connection closed while the request was in flight.
    ConnectionClosed,
}

#[derive(Debug, Default)]
struct RecordState {
    handles: HashMap<ConnectionId, ConnectionRegistration>,
    in_flight: HashSet<ConnectionId>,
    removed: bool,
}

/// One logical listener registration.
pub struct RegistrationRecord {
    id: UserRegistrationId,
    key: DistributedObjectKey,
    codec: Arc<dyn ListenerCodec>,
    handler: EventHandler,
    state: Mutex<RecordState>,
    handle_count: watch::Sender<usize>,
}

impl RegistrationRecord {
    pub fn new(
        key: DistributedObjectKey,
        codec: Arc<dyn ListenerCodec>,
        handler: EventHandler,
    ) -> Self {
        let (handle_count, _) = watch::channel(0);
        Self {
            id: UserRegistrationId::generate(),
            key,
            codec,
            handler,
            state: Mutex::new(RecordState::default()),
            handle_count,
        }
    }

    pub fn id(&self) -> UserRegistrationId {
        self.id
    }

    pub fn key(&self) -> &DistributedObjectKey {
        &self.key
    }

    pub fn codec(&self) -> &Arc<dyn ListenerCodec> {
        &self.codec
    }

    pub fn handler(&self) -> &EventHandler {
        &self.handler
    }

    fn lock(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_count(&self, state: &RecordState) {
        self.handle_count.send_replace(state.handles.len());
    }

    /// Watch the number of connections holding a handle.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.handle_count.subscribe()
    }

    /// Connections currently holding a handle, in id order.
    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut connections: Vec<_> = self.lock().handles.keys().copied().collect();
        connections.sort();
        connections
    }

    pub fn is_removed(&self) -> bool {
        self.lock().removed
    }

    /// State relative to the given set of open connections.
    pub fn state(&self, open_connections: &[ConnectionId]) -> RegistrationState {
        let state = self.lock();
        if state.removed {
            return RegistrationState::Removed;
        }
        let confirmed = open_connections
            .iter()
            .filter(|c| state.handles.contains_key(c))
            .count();
        if confirmed == 0 {
            RegistrationState::Pending
        } else if confirmed < open_connections.len() {
            RegistrationState::PartiallyRegistered
        } else {
            RegistrationState::FullyRegistered
        }
    }

    pub(crate) fn begin_attempt(&self, connection: ConnectionId) -> AttemptPermit {
        let mut state = self.lock();
        if state.removed {
            AttemptPermit::Removed
        } else if state.handles.contains_key(&connection) {
            AttemptPermit::AlreadyRegistered
        } else if !state.in_flight.insert(connection) {
            AttemptPermit::InFlight
        } else {
            AttemptPermit::Proceed
        }
    }

    pub(crate) fn abort_attempt(&self, connection: ConnectionId) {
        self.lock().in_flight.remove(&connection);
    }

    /// Store the handle unless removal started or the connection died while
    /// the request was in flight. `is_alive` is evaluated under the record
    /// lock, so a racing close either sees the stored entry or prevents it.
    pub(crate) fn complete_attempt(
        &self,
        connection: ConnectionId,
        registration: ConnectionRegistration,
        is_alive: impl FnOnce() -> bool,
    ) -> AttemptOutcome {
        let mut state = self.lock();
        state.in_flight.remove(&connection);
        if state.removed {
            return AttemptOutcome::Removed;
        }
        if !is_alive() {
            return AttemptOutcome::ConnectionClosed;
        }
        state.handles.insert(connection, registration);
        self.publish_count(&state);
        AttemptOutcome::Stored
    }

    /// Remove and return the entry for `connection`.
    pub(crate) fn take_handle(&self, connection: ConnectionId) -> Option<ConnectionRegistration> {
        let mut state = self.lock();
        state.in_flight.remove(&connection);
        let taken = state.handles.remove(&connection);
        if taken.is_some() {
            self.publish_count(&state);
        }
        taken
    }

    /// Enter the terminal state. Returns `false` if it already was removed.
    pub(crate) fn mark_removed(&self) -> bool {
        let mut state = self.lock();
        !std::mem::replace(&mut state.removed, true)
    }
}

impl fmt::Debug for RegistrationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("RegistrationRecord")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("codec", &self.codec)
            .field("handles", &state.handles)
            .field("removed", &state.removed)
            .finish()
    }
}

type Records = HashMap<UserRegistrationId, Arc<RegistrationRecord>>;

/// Live records keyed by distributed object.
#[derive(Debug, Default)]
pub struct RegistrationTable {
    records: RwLock<HashMap<DistributedObjectKey, Records>>,
}

impl RegistrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: DistributedObjectKey, record: Arc<RegistrationRecord>) {
        debug_assert_eq!(&key, record.key());
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.entry(key).or_default().insert(record.id(), record);
    }

    pub fn get(&self, key: &DistributedObjectKey) -> Vec<Arc<RegistrationRecord>> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records
            .get(key)
            .map(|by_id| by_id.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn find(&self, id: UserRegistrationId) -> Option<Arc<RegistrationRecord>> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.values().find_map(|by_id| by_id.get(&id).cloned())
    }

    /// Remove one record. Absent records are not an error.
    pub fn remove(
        &self,
        key: &DistributedObjectKey,
        id: UserRegistrationId,
    ) -> Option<Arc<RegistrationRecord>> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let by_id = records.get_mut(key)?;
        let removed = by_id.remove(&id);
        if by_id.is_empty() {
            records.remove(key);
        }
        removed
    }

    /// Every live record, across all keys.
    pub fn all(&self) -> Vec<Arc<RegistrationRecord>> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records
            .values()
            .flat_map(|by_id| by_id.values().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
