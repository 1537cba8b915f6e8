//! Relaypoint Router Node
//!
//! Runs a message router with in-process delivery. Configuration comes from
//! the TOML file named by `RELAYPOINT_CONFIG`, or from defaults, with
//! `RELAYPOINT_*` environment overrides applied on top.
//!
//! Participants listed in `RELAYPOINT_LOCAL_PARTICIPANTS` (comma separated)
//! are registered as sticky in-process routes; messages routed to them are
//! logged on arrival.

use std::sync::Arc;

use anyhow::Result;
use rp_common::{Address, AddressKind};
use rp_config::RouterSettings;
use rp_queue::{MessageQueue, NoOpMessagePersister};
use rp_router::{
    InProcessMessagingStubFactory, MessageProcessedListener, MessageRouter, MessagingStubRegistry,
    RouterComponents, ShutdownNotifier,
};
use rp_routing::{AddressManager, DefaultAddressValidator, InMemoryMulticastReceiverRegistry, RoutingTable, RoutingTableImpl};
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

struct LoggingListener;

impl MessageProcessedListener for LoggingListener {
    fn message_processed(&self, message_id: &str) {
        debug!(message_id = %message_id, "Message processed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting Relaypoint Router");

    // 1. Settings
    let settings = match std::env::var("RELAYPOINT_CONFIG") {
        Ok(path) => RouterSettings::load(&path)?,
        Err(_) => RouterSettings::from_env()?,
    };
    info!(?settings, "Router settings");

    // 2. Routing state
    let routing_table: Arc<dyn RoutingTable> = Arc::new(RoutingTableImpl::new(
        Arc::new(DefaultAddressValidator::default()),
        settings.routing_table_grace_period_ms,
    ));
    let address_manager = Arc::new(AddressManager::new(
        routing_table.clone(),
        Vec::new(),
        Arc::new(InMemoryMulticastReceiverRegistry::new()),
    ));
    let message_queue = Arc::new(MessageQueue::new(
        settings.message_queue_id.clone(),
        Arc::new(NoOpMessagePersister),
        routing_table.clone(),
    ));

    // 3. Local participants
    let in_process = Arc::new(InProcessMessagingStubFactory::new());
    let participants: Vec<String> = std::env::var("RELAYPOINT_LOCAL_PARTICIPANTS")
        .ok()
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    for participant_id in &participants {
        routing_table.put(
            participant_id,
            Address::in_process(participant_id.clone()),
            false,
            i64::MAX,
            true,
        );
        let mut inbox = in_process.register_receiver(participant_id.clone());
        let participant_id = participant_id.clone();
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                info!(
                    participant_id = %participant_id,
                    message_id = %message.id,
                    message_type = %message.message_type,
                    sender = %message.sender,
                    bytes = message.payload.len(),
                    "Message received"
                );
            }
        });
    }

    // 4. Router
    let stub_registry = MessagingStubRegistry::new().with_factory(AddressKind::InProcess, in_process);
    let router = MessageRouter::new(
        settings,
        RouterComponents {
            routing_table,
            address_manager,
            message_queue,
            stub_registry,
            access_controller: None,
        },
    )?;
    router.register_message_processed_listener(Arc::new(LoggingListener));
    router.start().await;

    let notifier = ShutdownNotifier::new();
    notifier.register(router.clone());

    info!(local_participants = participants.len(), "Relaypoint Router started. Press Ctrl+C to shutdown.");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    notifier.shutdown().await;

    info!("Relaypoint Router shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
