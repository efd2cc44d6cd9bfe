// Composite demo: two devices meet in one session on the in-memory broker,
// the host starts the app and the guest sends it a data message.

use composite_client::{config, CompositeClient, MemoryBroker};
use composite_core::{Credentials, Event, EventKind};
use serde_json::{json, Map};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<(), Box<dyn std::error::Error>> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("composite-client {}", VERSION);
            return Ok(());
        }
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> Result<(), Box<dyn std::error::Error>> {
    let credentials = Credentials {
        login: cfg.login.clone(),
        passcode: cfg.passcode.clone(),
    };
    let broker = MemoryBroker::with_credentials(cfg.coordinator_encoding, credentials);

    let mut coordinator = cfg.coordinator_config();
    let encoding = broker.encoding();
    if coordinator.adapter.encoding != encoding || coordinator.encoding != encoding {
        tracing::info!(
            ?encoding,
            adapter = ?coordinator.adapter.encoding,
            coordinator = ?coordinator.encoding,
            "in-memory broker uses one body encoding; overriding both layers"
        );
        coordinator.adapter.encoding = encoding;
        coordinator.encoding = encoding;
    }

    let host = CompositeClient::spawn(coordinator.clone(), broker.client());
    let guest = CompositeClient::spawn(coordinator, broker.client());

    for (role, client) in [("host", &host), ("guest", &guest)] {
        let mut init = client.events(EventKind::Init).await?;
        let mut joined = client.events(EventKind::SessionJoined).await?;
        client.connect(&cfg.endpoint).await?;
        if init.recv().await.is_none() {
            return Err(format!("{} never registered", role).into());
        }
        client.set_location(cfg.location())?;
        client.join(None).await?;
        if let Some(Event::SessionJoined(session)) = joined.recv().await {
            tracing::info!(role, session = %session.id, player = ?session.player, "joined");
        }
    }

    let mut started = guest.events(EventKind::AppStart).await?;
    let mut data = host.events(EventKind::Data).await?;
    let mut ended = guest.events(EventKind::AppEnd).await?;

    host.start_app()?;
    if let Some(Event::AppStart { latency }) = started.recv().await {
        tracing::info!(?latency, "guest saw app start");
    }

    let mut payload = Map::new();
    payload.insert("greeting".into(), json!("hello from the guest"));
    guest.send_data(payload)?;
    if let Some(Event::Data(message)) = data.recv().await {
        tracing::info!(?message, "host received data");
    }

    host.end_app()?;
    if let Some(Event::AppEnd { latency }) = ended.recv().await {
        tracing::info!(?latency, "guest saw app end");
    }

    let state = guest.state().await?;
    tracing::info!(
        time_difference = ?state.time_difference,
        latency = ?state.latency,
        device_index = ?state.device_index,
        "guest session state"
    );

    guest.disconnect().await?;
    host.disconnect().await?;
    guest.shutdown().await;
    host.shutdown().await;
    Ok(())
}
