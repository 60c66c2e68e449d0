//! Listener registration across cluster connections.
//!
//! [`ListenerService`] keeps every live [`RegistrationRecord`] registered on
//! every open connection:
//!
//! ```text
//!   add_listener ──► RegistrationTable ──► register_on(each open connection)
//!                          │
//!   connection opened ─────┤──► register_on(new connection, each record)
//!   connection closed ─────┤──► drop that connection's handles (no traffic)
//!   heartbeat restored ────┤──► retry registrations that failed there
//!   refresh tick ──────────┘──► register_on(any missing pair)
//!
//!   remove_listener ──► mark removed ──► deregister_from(each handle) ──► table
//! ```
//!
//! Removal wins over racing registrations: once a record is marked removed
//! no handle is stored for it again, and a registration that completes after
//! that point is undone on the member.

use crate::codec::ListenerCodec;
use crate::config::Config;
use crate::connection::{
    ConnectionEvent, ConnectionId, ConnectionRef, ConnectionRegistry, ObjectLifecycleEvent,
};
use crate::dispatch::{EventDispatcher, EventHandler, ListenerEvent};
use crate::error::{HzlinkError, Result};
use crate::protocol::ClientMessage;
use crate::registration::{
    AttemptOutcome, AttemptPermit, ConnectionRegistration, DistributedObjectKey,
    RegistrationRecord, RegistrationState, RegistrationTable, ServerRegistrationId,
    UserRegistrationId,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

/// Result of one `register_on` call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// The connection holds a handle for the record.
    Registered,
    /// Nothing was stored: the record was removed, another attempt for the
    /// same connection is in flight, or the connection closed meanwhile.
    Skipped,
}

struct Inner {
    table: RegistrationTable,
    dispatcher: Arc<EventDispatcher>,
    connections: Arc<dyn ConnectionRegistry>,
    smart_routing: bool,
    invocation_timeout: Duration,
    refresh_interval: Duration,
    /// Registrations whose last attempt on a connection failed.
    failed: Mutex<HashMap<ConnectionId, HashSet<UserRegistrationId>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Registration coordinator. Cheap to clone.
#[derive(Clone)]
pub struct ListenerService {
    inner: Arc<Inner>,
}

impl ListenerService {
    pub fn new(
        config: &Config,
        connections: Arc<dyn ConnectionRegistry>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                table: RegistrationTable::new(),
                dispatcher,
                connections,
                smart_routing: config.listener.smart_routing,
                invocation_timeout: config.invocation.timeout(),
                refresh_interval: config.listener.connection_refresh_interval(),
                failed: Mutex::new(HashMap::new()),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn table(&self) -> &RegistrationTable {
        &self.inner.table
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.inner.dispatcher
    }

    pub fn is_smart(&self) -> bool {
        self.inner.smart_routing
    }

    pub fn is_shutdown(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Spawn the notification loop and, for smart clients, the refresh sweep.
    pub fn start(
        &self,
        connection_events: broadcast::Receiver<ConnectionEvent>,
        lifecycle_events: broadcast::Receiver<ObjectLifecycleEvent>,
    ) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let service = self.clone();
        tasks.push(tokio::spawn(async move {
            service.run_event_loop(connection_events, lifecycle_events).await;
        }));
        if self.is_smart() {
            let service = self.clone();
            tasks.push(tokio::spawn(async move {
                service.run_refresh_loop().await;
            }));
        }
        info!(
            "Listener service started (smart_routing={}, refresh_interval={:?})",
            self.inner.smart_routing, self.inner.refresh_interval
        );
    }

    /// Stop background tasks and refuse new listeners. Existing registrations
    /// are left as they are.
    pub fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        let tasks = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            task.abort();
        }
        info!("Listener service shut down");
    }

    async fn run_event_loop(
        &self,
        mut connection_events: broadcast::Receiver<ConnectionEvent>,
        mut lifecycle_events: broadcast::Receiver<ObjectLifecycleEvent>,
    ) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut lifecycle_open = true;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = connection_events.recv() => match event {
                    Ok(ConnectionEvent::Opened(connection)) => {
                        self.on_connection_opened(connection)
                    }
                    Ok(ConnectionEvent::Closed(id)) => self.on_connection_closed(id),
                    Ok(ConnectionEvent::HeartbeatRestored(connection)) => {
                        self.on_heartbeat_restored(connection)
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} connection events, resynchronizing registrations", missed);
                        self.resync();
                    }
                    Err(RecvError::Closed) => {
                        debug!("Connection event stream closed");
                        break;
                    }
                },
                event = lifecycle_events.recv(), if lifecycle_open => match event {
                    Ok(ObjectLifecycleEvent::Destroyed(key)) => {
                        let service = self.clone();
                        tokio::spawn(async move {
                            service.on_object_destroyed(&key).await;
                        });
                    }
                    Ok(ObjectLifecycleEvent::Created(_)) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} object lifecycle events", missed);
                    }
                    Err(RecvError::Closed) => lifecycle_open = false,
                },
            }
        }
    }

    async fn run_refresh_loop(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.inner.refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.refresh().await,
            }
        }
    }

    async fn invoke(
        &self,
        connection: &ConnectionRef,
        request: ClientMessage,
    ) -> Result<ClientMessage> {
        let timeout = self.inner.invocation_timeout;
        match tokio::time::timeout(timeout, connection.send(request)).await {
            Ok(response) => response,
            Err(_) => Err(HzlinkError::InvocationTimeout {
                connection: connection.id().0,
                millis: timeout.as_millis() as u64,
            }),
        }
    }

    /// Register `record` on `connection` and store the server handle.
    pub async fn register_on(
        &self,
        connection: &ConnectionRef,
        record: &Arc<RegistrationRecord>,
    ) -> Result<RegisterOutcome> {
        let connection_id = connection.id();
        match record.begin_attempt(connection_id) {
            AttemptPermit::Proceed => {}
            AttemptPermit::AlreadyRegistered => return Ok(RegisterOutcome::Registered),
            AttemptPermit::InFlight | AttemptPermit::Removed => {
                return Ok(RegisterOutcome::Skipped)
            }
        }
        if !connection.is_alive() {
            record.abort_attempt(connection_id);
            return Err(HzlinkError::ConnectionClosed(connection_id.0));
        }

        let dispatcher = &self.inner.dispatcher;
        let correlation_id = dispatcher.next_correlation_id();
        let request = record
            .codec()
            .encode_add_request(record.key(), &record.id(), self.inner.smart_routing)
            .with_correlation_id(correlation_id);
        // Installed before sending: events may overtake the response.
        dispatcher.add_event_handler(correlation_id, record.id(), guarded_handler(record));

        trace!("Register attempt of {} to {}", record.id(), connection_id);
        let response = match self.invoke(connection, request).await {
            Ok(message) => record.codec().decode_add_response(message),
            Err(e) => Err(e),
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                dispatcher.remove_event_handler(correlation_id);
                record.abort_attempt(connection_id);
                if e.is_retryable() {
                    self.mark_failed(connection, record.id());
                }
                return Err(e);
            }
        };

        let handle = response.server_registration_id.clone();
        let registration = ConnectionRegistration {
            server_registration_id: handle.clone(),
            correlation_id,
        };
        match record.complete_attempt(connection_id, registration, || connection.is_alive()) {
            AttemptOutcome::Stored => {
                self.clear_failed(connection_id, record.id());
                debug!(
                    "Listener {} registered on {} as {}{}",
                    record.id(),
                    connection_id,
                    handle,
                    if response.already_registered {
                        " (already registered)"
                    } else {
                        ""
                    }
                );
                Ok(RegisterOutcome::Registered)
            }
            AttemptOutcome::Removed => {
                dispatcher.remove_event_handler(correlation_id);
                debug!(
                    "Listener {} was removed while registering on {}, undoing",
                    record.id(),
                    connection_id
                );
                if let Err(e) = self.send_deregistration(connection, record, &handle).await {
                    debug!("Undo of {} on {} failed: {}", record.id(), connection_id, e);
                }
                Ok(RegisterOutcome::Skipped)
            }
            AttemptOutcome::ConnectionClosed => {
                dispatcher.remove_event_handler(correlation_id);
                trace!(
                    "{} closed before registration of {} completed",
                    connection_id,
                    record.id()
                );
                Ok(RegisterOutcome::Skipped)
            }
        }
    }

    /// Drop the handle `record` holds on `connection` and ask the member to
    /// forget it. The local entry is gone even if the request fails.
    pub async fn deregister_from(
        &self,
        connection: &ConnectionRef,
        record: &Arc<RegistrationRecord>,
    ) -> Result<bool> {
        let Some(registration) = record.take_handle(connection.id()) else {
            return Ok(false);
        };
        self.inner
            .dispatcher
            .remove_event_handler(registration.correlation_id);
        self.send_deregistration(connection, record, &registration.server_registration_id)
            .await?;
        debug!("Listener {} unregistered from {}", record.id(), connection.id());
        Ok(true)
    }

    async fn send_deregistration(
        &self,
        connection: &ConnectionRef,
        record: &RegistrationRecord,
        handle: &ServerRegistrationId,
    ) -> Result<()> {
        let Some(request) = record.codec().encode_remove_request(record.key(), handle) else {
            return Ok(());
        };
        let request = request.with_correlation_id(self.inner.dispatcher.next_correlation_id());
        match self.invoke(connection, request).await.and_then(ClientMessage::into_result) {
            Ok(_) => Ok(()),
            // The member dropped the registration together with the connection.
            Err(HzlinkError::ConnectionClosed(_)) | Err(HzlinkError::Io(_)) => Ok(()),
            Err(e) => {
                warn!(
                    "Deregistration of listener {} has failed on {}: {}",
                    record.id(),
                    connection.id(),
                    e
                );
                Err(e)
            }
        }
    }

    /// Forget every handle held on a connection that has closed.
    pub fn on_connection_closed(&self, connection_id: ConnectionId) {
        self.inner
            .failed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&connection_id);
        let mut dropped = 0;
        for record in self.inner.table.all() {
            if let Some(registration) = record.take_handle(connection_id) {
                self.inner
                    .dispatcher
                    .remove_event_handler(registration.correlation_id);
                dropped += 1;
            }
        }
        debug!("{} closed, dropped {} registrations", connection_id, dropped);
    }

    /// Re-register every live record on a newly opened connection, in the
    /// background.
    pub fn on_connection_opened(&self, connection: ConnectionRef) {
        let service = self.clone();
        tokio::spawn(async move {
            service.reregister_listeners_on(&connection).await;
        });
    }

    /// Register every live record on `connection`, concurrently, and wait
    /// for all attempts. Failures are logged and recorded for retry.
    pub async fn reregister_listeners_on(&self, connection: &ConnectionRef) {
        let records = self.inner.table.all();
        if records.is_empty() {
            return;
        }
        self.register_records_on(connection, records).await;
    }

    /// Retry the registrations that failed on `connection`.
    pub fn on_heartbeat_restored(&self, connection: ConnectionRef) {
        let failed = self
            .inner
            .failed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&connection.id())
            .unwrap_or_default();
        if failed.is_empty() {
            return;
        }
        let records: Vec<_> = failed
            .into_iter()
            .filter_map(|id| self.inner.table.find(id))
            .collect();
        debug!(
            "Heartbeat restored on {}, retrying {} registrations",
            connection.id(),
            records.len()
        );
        let service = self.clone();
        tokio::spawn(async move {
            service.register_records_on(&connection, records).await;
        });
    }

    async fn register_records_on(
        &self,
        connection: &ConnectionRef,
        records: Vec<Arc<RegistrationRecord>>,
    ) {
        let mut attempts = JoinSet::new();
        for record in records {
            let service = self.clone();
            let connection = Arc::clone(connection);
            attempts.spawn(async move {
                if let Err(e) = service.register_on(&connection, &record).await {
                    warn!(
                        "Listener {} can not be added to {}, reason: {}",
                        record.id(),
                        connection.id(),
                        e
                    );
                }
            });
        }
        while let Some(joined) = attempts.join_next().await {
            if let Err(e) = joined {
                error!("Registration task failed: {}", e);
            }
        }
    }

    /// Register every live record on every active connection where it is
    /// missing.
    pub async fn refresh(&self) {
        let connections = self.inner.connections.active_connections();
        let mut sweeps = JoinSet::new();
        for connection in connections {
            let service = self.clone();
            sweeps.spawn(async move {
                service.reregister_listeners_on(&connection).await;
            });
        }
        while let Some(joined) = sweeps.join_next().await {
            if let Err(e) = joined {
                error!("Refresh task failed: {}", e);
            }
        }
    }

    /// Drop handles and retry bookkeeping of connections that are no longer
    /// active, then refresh.
    fn resync(&self) {
        let active: HashSet<ConnectionId> = self
            .inner
            .connections
            .active_connections()
            .iter()
            .map(|c| c.id())
            .collect();
        for record in self.inner.table.all() {
            for connection_id in record.connections() {
                if !active.contains(&connection_id) {
                    if let Some(registration) = record.take_handle(connection_id) {
                        self.inner
                            .dispatcher
                            .remove_event_handler(registration.correlation_id);
                    }
                }
            }
        }
        self.inner
            .failed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|connection_id, _| active.contains(connection_id));
        let service = self.clone();
        tokio::spawn(async move {
            service.refresh().await;
        });
    }

    /// Add a listener for `key` and register it on every open connection.
    ///
    /// Resolves once one connection confirmed. On timeout, or when every
    /// connection rejected it, an error is returned but the record stays
    /// in the table and later connection events may still register it.
    pub async fn add_listener(
        &self,
        key: DistributedObjectKey,
        codec: Arc<dyn ListenerCodec>,
        handler: EventHandler,
        timeout: Duration,
    ) -> Result<UserRegistrationId> {
        if self.is_shutdown() {
            return Err(HzlinkError::ClientShutdown);
        }
        let record = Arc::new(RegistrationRecord::new(key.clone(), codec, handler));
        let id = record.id();
        let mut handle_count = record.subscribe();
        self.inner.table.add(key, Arc::clone(&record));

        let connections = self.inner.connections.active_connections();
        let attempted = connections.len();
        let (results_tx, mut results) = mpsc::unbounded_channel();
        for connection in connections {
            let service = self.clone();
            let record = Arc::clone(&record);
            let results_tx = results_tx.clone();
            // Detached so slower connections keep registering after we return.
            tokio::spawn(async move {
                let result = service.register_on(&connection, &record).await;
                if let Err(e) = &result {
                    warn!(
                        "Listener {} can not be added to {}, reason: {}",
                        record.id(),
                        connection.id(),
                        e
                    );
                }
                let _ = results_tx.send(result);
            });
        }
        drop(results_tx);

        let confirmation = async {
            let mut pending = attempted;
            let mut failures = 0;
            let mut last_error = None;
            loop {
                if *handle_count.borrow_and_update() > 0 {
                    return Ok(());
                }
                if record.is_removed() {
                    return Err(HzlinkError::RegistrationFailed {
                        registration_id: id.to_string(),
                        reason: "listener was removed".to_string(),
                    });
                }
                if attempted > 0 && failures == attempted {
                    let reason = last_error
                        .map(|e: HzlinkError| e.to_string())
                        .unwrap_or_default();
                    return Err(HzlinkError::RegistrationFailed {
                        registration_id: id.to_string(),
                        reason,
                    });
                }
                tokio::select! {
                    Ok(()) = handle_count.changed() => {}
                    result = results.recv(), if pending > 0 => match result {
                        Some(Ok(RegisterOutcome::Registered)) => return Ok(()),
                        Some(Ok(RegisterOutcome::Skipped)) => pending -= 1,
                        Some(Err(e)) => {
                            pending -= 1;
                            failures += 1;
                            last_error = Some(e);
                        }
                        None => pending = 0,
                    },
                    else => std::future::pending::<()>().await,
                }
            }
        };

        match tokio::time::timeout(timeout, confirmation).await {
            Ok(Ok(())) => {
                debug!("Listener {} added for {}", id, record.key());
                Ok(id)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(HzlinkError::RegistrationTimeout {
                registration_id: id.to_string(),
                millis: timeout.as_millis() as u64,
            }),
        }
    }

    /// Remove a listener. Returns `false` if no such listener exists.
    pub async fn remove_listener(
        &self,
        key: &DistributedObjectKey,
        id: UserRegistrationId,
    ) -> Result<bool> {
        let Some(record) = self.inner.table.get(key).into_iter().find(|r| r.id() == id) else {
            return Ok(false);
        };
        if !record.mark_removed() {
            // A concurrent removal owns the deregistration.
            return Ok(false);
        }

        let active = self.inner.connections.active_connections();
        let mut deregistrations = JoinSet::new();
        for connection_id in record.connections() {
            match active.iter().find(|c| c.id() == connection_id) {
                Some(connection) => {
                    let service = self.clone();
                    let connection = Arc::clone(connection);
                    let record = Arc::clone(&record);
                    deregistrations.spawn(async move {
                        service.deregister_from(&connection, &record).await
                    });
                }
                None => {
                    if let Some(registration) = record.take_handle(connection_id) {
                        self.inner
                            .dispatcher
                            .remove_event_handler(registration.correlation_id);
                    }
                }
            }
        }
        while let Some(joined) = deregistrations.join_next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!("Deregistration of {} incomplete: {}", id, e),
                Err(e) => error!("Deregistration task failed: {}", e),
            }
        }

        self.inner.table.remove(key, id);
        self.forget_failed(id);
        debug!("Listener {} removed from {}", id, key);
        Ok(true)
    }

    /// Remove every listener of a destroyed object. Returns how many were removed.
    pub async fn on_object_destroyed(&self, key: &DistributedObjectKey) -> usize {
        let mut removed = 0;
        for record in self.inner.table.get(key) {
            match self.remove_listener(key, record.id()).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!("Listener {} of destroyed {} not removed: {}", record.id(), key, e),
            }
        }
        if removed > 0 {
            info!("Removed {} listeners of destroyed object {}", removed, key);
        }
        removed
    }

    /// State of a listener relative to the currently active connections.
    pub fn registration_state(&self, id: UserRegistrationId) -> Option<RegistrationState> {
        let record = self.inner.table.find(id)?;
        let open: Vec<ConnectionId> = self
            .inner
            .connections
            .active_connections()
            .iter()
            .map(|c| c.id())
            .collect();
        Some(record.state(&open))
    }

    /// Registrations currently waiting for a retry on `connection_id`.
    pub fn failed_registrations(&self, connection_id: ConnectionId) -> Vec<UserRegistrationId> {
        let failed = self.inner.failed.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<_> = failed
            .get(&connection_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Record a failed attempt for retry. Closed connections are skipped:
    /// liveness is read under the lock `on_connection_closed` clears with,
    /// and connections turn dead before their close is announced.
    fn mark_failed(&self, connection: &ConnectionRef, id: UserRegistrationId) {
        let mut failed = self.inner.failed.lock().unwrap_or_else(|e| e.into_inner());
        if connection.is_alive() {
            failed.entry(connection.id()).or_default().insert(id);
        }
    }

    fn clear_failed(&self, connection_id: ConnectionId, id: UserRegistrationId) {
        let mut failed = self.inner.failed.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ids) = failed.get_mut(&connection_id) {
            ids.remove(&id);
            if ids.is_empty() {
                failed.remove(&connection_id);
            }
        }
    }

    fn forget_failed(&self, id: UserRegistrationId) {
        let mut failed = self.inner.failed.lock().unwrap_or_else(|e| e.into_inner());
        failed.retain(|_, ids| {
            ids.remove(&id);
            !ids.is_empty()
        });
    }
}

/// Wrap the user handler so nothing is delivered once the record is removed.
fn guarded_handler(record: &Arc<RegistrationRecord>) -> EventHandler {
    let record = Arc::clone(record);
    Arc::new(move |event: ListenerEvent| {
        if !record.is_removed() {
            (record.handler())(event);
        }
    })
}

impl std::fmt::Debug for ListenerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerService")
            .field("registrations", &self.inner.table.len())
            .field("smart_routing", &self.inner.smart_routing)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackCluster;

    fn setup() -> (ListenerService, Arc<LoopbackCluster>) {
        let dispatcher = Arc::new(EventDispatcher::new());
        let cluster = LoopbackCluster::new(Arc::clone(&dispatcher));
        let service = ListenerService::new(&Config::default(), cluster.clone(), dispatcher);
        (service, cluster)
    }

    #[tokio::test]
    async fn test_failure_on_closed_connection_is_not_recorded() {
        let (service, cluster) = setup();
        let member = cluster.add_member("m1");
        let connection = cluster.connect(&member);
        let id = UserRegistrationId::generate();

        // Close handled before the failed attempt reports back.
        cluster.close(connection.id());
        service.on_connection_closed(connection.id());
        service.mark_failed(&connection, id);

        assert!(service.failed_registrations(connection.id()).is_empty());
    }

    #[tokio::test]
    async fn test_resync_prunes_failures_of_inactive_connections() {
        let (service, cluster) = setup();
        let member = cluster.add_member("m1");
        let closed = cluster.connect(&member);
        let open = cluster.connect(&member);
        let id = UserRegistrationId::generate();
        service.mark_failed(&closed, id);
        service.mark_failed(&open, id);

        // The close notification never reaches the service.
        cluster.close(closed.id());
        service.resync();

        assert!(service.failed_registrations(closed.id()).is_empty());
        assert_eq!(service.failed_registrations(open.id()), vec![id]);
    }

    #[tokio::test]
    async fn test_rejected_registration_is_queued_for_retry() {
        let (service, cluster) = setup();
        let member = cluster.add_member("m1");
        let connection = cluster.connect(&member);
        member.reject_registrations(true);
        let record = Arc::new(RegistrationRecord::new(
            DistributedObjectKey::new("hz:impl:mapService", "m"),
            Arc::new(crate::codec::EntryListenerCodec::default()),
            Arc::new(|_: ListenerEvent| {}),
        ));

        assert!(matches!(
            service.register_on(&connection, &record).await,
            Err(HzlinkError::Remote(_))
        ));
        assert_eq!(service.failed_registrations(connection.id()), vec![record.id()]);
        assert!(record.connections().is_empty());
    }
}
