use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use tankmon::config::{self, ConfigStore, MAX_TANKS};
use tankmon::net::{InboundMessage, MessageHandler, MqttSession};
use tankmon::node::{Exit, Node};
use tankmon::simulate::{SimulatedLink, SimulatedSonar};
use tankmon::storage::PersistStore;
use tankmon::timesync::{UdpTimeTransport, LOCAL_PORT};

/// Exit status asking the service manager to start us again.
const RESTART_EXIT_CODE: i32 = 3;

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let json = env::var("TANKMON_LOG_JSON").map(|v| v == "1").unwrap_or(false);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let store = ConfigStore::from_env();
    let loaded = store.load();
    init_logging(loaded.as_ref().map(|(site, _)| site.debug).unwrap_or(false));

    let (site, tanks) = loaded.with_context(|| {
        format!("loading site configuration from {}", store.config_path().display())
    })?;
    if site.debug {
        log::debug!("Site config: {}", serde_json::to_string(&site)?);
        config::dump_tanks(&tanks);
    }

    let persist = PersistStore::new(store.root(), MAX_TANKS);

    let (tx, rx) = mpsc::channel::<InboundMessage>(32);
    let handler: MessageHandler = Arc::new(move |msg| {
        if let Err(e) = tx.try_send(msg) {
            log::warn!("Dropping inbound message: {}", e);
        }
    });
    let client_id = format!("{}-{}", site.sitename, &Uuid::new_v4().simple().to_string()[..8]);
    let session = MqttSession::new(&site.broker, &client_id, handler);

    let sonar = SimulatedSonar::new(&tanks);
    let node = Node::boot(
        site,
        tanks,
        persist,
        SimulatedLink::from_env(),
        session,
        UdpTimeTransport::new(LOCAL_PORT),
        sonar,
    );

    match node.run(rx).await {
        Exit::RestartRequested => {
            log::error!("Rebooting...");
            // The service manager restarts the process, like a device reset.
            std::process::exit(RESTART_EXIT_CODE);
        }
    }
}
