use anyhow::{bail, Context};
use bytes::Bytes;
use clap::Parser;
use hzlink::{
    logging, Client, Config, DistributedObjectKey, EntryEvent, EntryListenerOptions,
    RegistrationState, UserRegistrationId,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Replays a listener reconnect against an in-process cluster.
#[derive(Parser, Debug)]
#[command(name = "hzlink", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(Config::default()),
    }
}

async fn wait_for_state(
    client: &Client,
    id: UserRegistrationId,
    expected: RegistrationState,
) -> anyhow::Result<()> {
    for _ in 0..100 {
        if client.registration_state(id) == Some(expected) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("listener {} never reached {:?}", id, expected)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    logging::init(&config.logging)?;

    let (client, cluster) = Client::with_loopback(config)?;
    let member = cluster.add_member("member-1");
    let first = cluster.connect(&member);
    let key = DistributedObjectKey::new("hz:impl:mapService", "demo");

    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let id = client
        .add_entry_listener(
            key.clone(),
            EntryListenerOptions {
                include_value: true,
                key: None,
            },
            move |event| {
                counter.fetch_add(1, Ordering::SeqCst);
                info!(
                    "Entry event: key={} value={:?}",
                    String::from_utf8_lossy(&event.key),
                    event.value.as_deref().map(String::from_utf8_lossy)
                );
            },
        )
        .await?;
    info!("Listener {} registered on {}", id, first.id());

    let event = |value: &'static [u8]| EntryEvent {
        key: Bytes::from_static(b"greeting"),
        value: Some(Bytes::from_static(value)),
    };
    cluster.publish(&member, &key, event(b"before reconnect"));

    cluster.close(first.id());
    let second = cluster.connect(&member);
    wait_for_state(&client, id, RegistrationState::FullyRegistered).await?;
    info!("Listener {} re-registered on {}", id, second.id());
    cluster.publish(&member, &key, event(b"after reconnect"));

    client.remove_listener(&key, id).await?;
    let delivered = cluster.publish(&member, &key, event(b"after removal"));
    info!(
        "Received {} events, {} delivered after removal",
        received.load(Ordering::SeqCst),
        delivered
    );

    let reference = client.next_reference_id()?;
    info!("Next lock reference id: {}", reference);

    client.shutdown();
    Ok(())
}
