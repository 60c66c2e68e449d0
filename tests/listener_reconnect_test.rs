//! Listener registration against the loopback cluster: reconnects, removal
//! races, failures and recovery.

use bytes::Bytes;
use hzlink::connection::{ConnectionId, ConnectionRef};
use hzlink::dispatch::EventDispatcher;
use hzlink::loopback::{LoopbackCluster, LoopbackMember};
use hzlink::{
    Client, Config, DistributedObjectKey, EntryEvent, EntryListenerOptions, HzlinkError,
    RegistrationState, UserRegistrationId,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn config(refresh_ms: u64, timeout_ms: u64, smart: bool) -> Config {
    Config::from_toml_str(&format!(
        "[listener]\nsmart_routing = {}\nregistration_timeout = {}\nregistration_timeout_unit = \"MILLISECONDS\"\nconnection_refresh_interval_ms = {}\n\n[invocation]\ntimeout_ms = 1000\n",
        smart, timeout_ms, refresh_ms
    ))
    .unwrap()
}

fn map_key(name: &str) -> DistributedObjectKey {
    DistributedObjectKey::new("hz:impl:mapService", name)
}

fn entry(key: &'static [u8]) -> EntryEvent {
    EntryEvent {
        key: Bytes::from_static(key),
        value: Some(Bytes::from_static(b"value")),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn counting_listener(
    client: &Client,
    key: &DistributedObjectKey,
) -> hzlink::Result<(UserRegistrationId, Arc<AtomicUsize>)> {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let id = client
        .add_entry_listener(key.clone(), EntryListenerOptions::default(), move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .await?;
    Ok((id, count))
}

fn handles(client: &Client, id: UserRegistrationId) -> Vec<ConnectionId> {
    client
        .listeners()
        .table()
        .find(id)
        .map(|record| record.connections())
        .unwrap_or_default()
}

/// Open a connection and let the client process the announcement.
async fn connect_settled(cluster: &LoopbackCluster, member: &Arc<LoopbackMember>) -> ConnectionRef {
    let connection = cluster.connect(member);
    sleep(Duration::from_millis(20)).await;
    connection
}

fn setup(config: Config) -> (Client, Arc<LoopbackCluster>, Arc<LoopbackMember>) {
    let (client, cluster) = Client::with_loopback(config).unwrap();
    let member = cluster.add_member("member-1");
    (client, cluster, member)
}

#[tokio::test]
async fn registration_follows_reconnect() {
    let (client, cluster, member) = setup(config(60_000, 2_000, true));
    let key = map_key("reconnect");
    let c1 = cluster.connect(&member);

    let (id, count) = counting_listener(&client, &key).await.unwrap();
    assert_eq!(handles(&client, id), vec![c1.id()]);
    assert_eq!(cluster.publish(&member, &key, entry(b"a")), 1);

    cluster.close(c1.id());
    assert!(wait_until(|| handles(&client, id).is_empty()).await);
    assert_eq!(client.registration_state(id), Some(RegistrationState::Pending));
    assert_eq!(member.deregister_requests(), 0);

    let c2 = cluster.connect(&member);
    assert!(wait_until(|| handles(&client, id) == vec![c2.id()]).await);
    assert_eq!(
        client.registration_state(id),
        Some(RegistrationState::FullyRegistered)
    );
    assert_eq!(member.subscription_count(c1.id()), 0);
    assert_eq!(member.subscription_count(c2.id()), 1);

    assert_eq!(cluster.publish(&member, &key, entry(b"b")), 1);
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn registered_on_every_member() {
    let (client, cluster, m1) = setup(config(60_000, 2_000, true));
    let m2 = cluster.add_member("member-2");
    let c1 = cluster.connect(&m1);
    let c2 = cluster.connect(&m2);
    let key = map_key("everywhere");

    let (id, count) = counting_listener(&client, &key).await.unwrap();
    assert!(wait_until(|| handles(&client, id) == vec![c1.id(), c2.id()]).await);

    // Smart clients ask for local events, so each change arrives once.
    assert_eq!(cluster.publish(&m1, &key, entry(b"a")), 1);
    assert_eq!(cluster.publish(&m2, &key, entry(b"b")), 1);
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unisocket_client_receives_cluster_wide_events() {
    let (client, cluster, m1) = setup(config(60_000, 2_000, false));
    let m2 = cluster.add_member("member-2");
    cluster.connect(&m1);
    let key = map_key("unisocket");

    let (_, count) = counting_listener(&client, &key).await.unwrap();
    assert_eq!(cluster.publish(&m2, &key, entry(b"remote")), 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn removal_wins_over_reconnection_sweep() {
    let (client, cluster, member) = setup(config(60_000, 2_000, true));
    let key = map_key("race");
    cluster.connect(&member);
    let (id, count) = counting_listener(&client, &key).await.unwrap();

    // Slow link: registrations triggered by the new connections are still
    // in flight when removal starts.
    member.set_latency(Some(Duration::from_millis(50)));
    cluster.connect(&member);
    cluster.connect(&member);
    sleep(Duration::from_millis(10)).await;

    assert!(client.remove_listener(&key, id).await.unwrap());
    assert!(client.listeners().table().find(id).is_none());
    assert_eq!(client.registration_state(id), None);

    // Late registrations are undone on the member.
    assert!(wait_until(|| member.total_subscriptions() == 0).await);
    assert_eq!(cluster.publish(&member, &key, entry(b"late")), 0);
    assert_eq!(count.load(Ordering::SeqCst), 0);

    // A second removal finds nothing.
    assert!(!client.remove_listener(&key, id).await.unwrap());
}

#[tokio::test]
async fn listeners_on_one_key_are_independent() {
    let (client, cluster, member) = setup(config(60_000, 2_000, true));
    let key = map_key("shared");
    cluster.connect(&member);

    let (first, first_count) = counting_listener(&client, &key).await.unwrap();
    let (second, second_count) = counting_listener(&client, &key).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(client.listeners().table().get(&key).len(), 2);

    assert_eq!(cluster.publish(&member, &key, entry(b"a")), 2);
    assert!(client.remove_listener(&key, first).await.unwrap());
    assert_eq!(cluster.publish(&member, &key, entry(b"b")), 1);

    assert_eq!(first_count.load(Ordering::SeqCst), 1);
    assert_eq!(second_count.load(Ordering::SeqCst), 2);
    assert_eq!(
        client.registration_state(second),
        Some(RegistrationState::FullyRegistered)
    );
}

#[tokio::test]
async fn already_registered_counts_as_success() {
    let (client, cluster, member) = setup(config(60_000, 2_000, true));
    let key = map_key("idempotent");
    let connection = cluster.connect(&member);
    member.report_already_registered(true);

    let (id, count) = counting_listener(&client, &key).await.unwrap();
    assert_eq!(handles(&client, id), vec![connection.id()]);
    assert_eq!(
        client.registration_state(id),
        Some(RegistrationState::FullyRegistered)
    );
    assert_eq!(cluster.publish(&member, &key, entry(b"a")), 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn timeout_keeps_record_for_later_connections() {
    let (client, cluster, member) = setup(config(60_000, 100, true));
    let key = map_key("no-connections");

    let err = counting_listener(&client, &key).await.unwrap_err();
    assert!(matches!(err, HzlinkError::RegistrationTimeout { .. }));

    let records = client.listeners().table().get(&key);
    assert_eq!(records.len(), 1);
    let id = records[0].id();
    assert_eq!(client.registration_state(id), Some(RegistrationState::Pending));

    let connection = cluster.connect(&member);
    assert!(wait_until(|| handles(&client, id) == vec![connection.id()]).await);
}

#[tokio::test]
async fn rejected_registration_retried_on_heartbeat() {
    let (client, cluster, member) = setup(config(60_000, 2_000, true));
    let key = map_key("rejected");
    let connection = connect_settled(&cluster, &member).await;
    member.reject_registrations(true);

    let err = counting_listener(&client, &key).await.unwrap_err();
    assert!(matches!(err, HzlinkError::RegistrationFailed { .. }));

    let id = client.listeners().table().get(&key)[0].id();
    assert_eq!(
        client.listeners().failed_registrations(connection.id()),
        vec![id]
    );

    member.reject_registrations(false);
    cluster.restore_heartbeat(connection.id());
    assert!(wait_until(|| handles(&client, id) == vec![connection.id()]).await);
    assert!(client
        .listeners()
        .failed_registrations(connection.id())
        .is_empty());
}

#[tokio::test]
async fn lost_response_recovers_through_existing_registration() {
    let (client, cluster, member) = setup(config(60_000, 2_000, true));
    let key = map_key("lost");
    let connection = connect_settled(&cluster, &member).await;
    member.lose_register_responses(1);

    assert!(counting_listener(&client, &key).await.is_err());
    let id = client.listeners().table().get(&key)[0].id();
    assert_eq!(member.total_subscriptions(), 1);

    cluster.restore_heartbeat(connection.id());
    assert!(wait_until(|| handles(&client, id) == vec![connection.id()]).await);
    assert_eq!(member.total_subscriptions(), 1);
    assert_eq!(member.register_requests(), 2);

    // Events follow the correlation id of the attempt that succeeded.
    assert_eq!(cluster.publish(&member, &key, entry(b"a")), 1);
}

#[tokio::test]
async fn malformed_response_is_retried_by_refresh() {
    let (client, cluster, m1) = setup(config(50, 2_000, true));
    let m2 = cluster.add_member("member-2");
    let c1 = cluster.connect(&m1);
    let c2 = connect_settled(&cluster, &m2).await;
    m1.send_malformed_register_responses(1);
    let key = map_key("malformed");

    let (id, _) = counting_listener(&client, &key).await.unwrap();
    assert!(wait_until(|| handles(&client, id) == vec![c1.id(), c2.id()]).await);
    assert!(c1.is_alive());
    assert_eq!(
        client.registration_state(id),
        Some(RegistrationState::FullyRegistered)
    );
}

#[tokio::test]
async fn close_during_registration_leaves_no_handle() {
    let (client, cluster, member) = setup(config(60_000, 2_000, true));
    let key = map_key("closing");
    let connection = connect_settled(&cluster, &member).await;
    member.set_latency(Some(Duration::from_millis(100)));

    let adding = {
        let client = client.clone();
        let key = key.clone();
        tokio::spawn(async move { counting_listener(&client, &key).await })
    };
    sleep(Duration::from_millis(20)).await;
    cluster.close(connection.id());

    let err = adding.await.unwrap().unwrap_err();
    assert!(matches!(err, HzlinkError::RegistrationFailed { .. }));
    let id = client.listeners().table().get(&key)[0].id();
    assert!(handles(&client, id).is_empty());
    assert_eq!(member.total_subscriptions(), 0);
    assert!(client
        .listeners()
        .failed_registrations(connection.id())
        .is_empty());
}

#[tokio::test]
async fn destroyed_object_drops_its_listeners() {
    let (client, cluster, member) = setup(config(60_000, 2_000, true));
    let key = map_key("destroyed");
    let other = map_key("kept");
    cluster.connect(&member);

    let (first, _) = counting_listener(&client, &key).await.unwrap();
    let (second, _) = counting_listener(&client, &key).await.unwrap();
    let (kept, _) = counting_listener(&client, &other).await.unwrap();

    cluster.destroy_object(&key);
    assert!(wait_until(|| client.listeners().table().get(&key).is_empty()).await);
    assert_eq!(client.registration_state(first), None);
    assert_eq!(client.registration_state(second), None);
    assert_eq!(
        client.registration_state(kept),
        Some(RegistrationState::FullyRegistered)
    );
}

#[tokio::test]
async fn shutdown_stops_following_connections() {
    let (client, cluster, member) = setup(config(60_000, 2_000, true));
    let key = map_key("shutdown");
    cluster.connect(&member);
    let (id, _) = counting_listener(&client, &key).await.unwrap();

    client.shutdown();
    let late = cluster.connect(&member);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(member.subscription_count(late.id()), 0);
    assert_eq!(
        client.registration_state(id),
        Some(RegistrationState::PartiallyRegistered)
    );
}

#[tokio::test]
async fn lagged_connection_events_resynchronize() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let cluster = LoopbackCluster::with_event_capacity(Arc::clone(&dispatcher), 2);
    let client = Client::new(config(60_000, 2_000, true), cluster.clone(), dispatcher).unwrap();
    client.start(cluster.subscribe(), cluster.lifecycle_events());
    let member = cluster.add_member("member-1");
    let key = map_key("lagged");

    let c1 = connect_settled(&cluster, &member).await;
    let (id, count) = counting_listener(&client, &key).await.unwrap();
    assert_eq!(handles(&client, id), vec![c1.id()]);

    // More notifications than the stream holds arrive before the client runs.
    cluster.close(c1.id());
    let c2 = cluster.connect(&member);
    let c3 = cluster.connect(&member);
    let c4 = cluster.connect(&member);

    assert!(wait_until(|| handles(&client, id) == vec![c2.id(), c3.id(), c4.id()]).await);
    assert_eq!(member.subscription_count(c1.id()), 0);
    assert_eq!(member.deregister_requests(), 0);
    assert!(client.listeners().failed_registrations(c1.id()).is_empty());

    assert_eq!(cluster.publish(&member, &key, entry(b"a")), 3);
    assert_eq!(count.load(Ordering::SeqCst), 3);
}
