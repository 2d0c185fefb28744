use aerlink::domain::models::{ConnectionState, PeripheralId, SessionEvent};
use aerlink::domain::settings::SettingsService;
use aerlink::infrastructure::bluetooth::btleplug_transport::BtleplugTransport;
use aerlink::infrastructure::bluetooth::service::{self, LinkService};
use aerlink::infrastructure::logging::init_logger;
use aerlink::services::default_contracts;
use aerlink::services::notifications::NotificationUpdate;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings = SettingsService::new()?;
    let _logging = init_logger(&settings.get().log_settings)?;
    info!("Starting Aerlink");
    if let Some(peripheral) = &settings.get().last_connected_peripheral {
        info!(%peripheral, "Last connected peripheral");
    }

    let (handle, inbox) = service::channel();
    let transport = BtleplugTransport::new(handle.clone()).await?;

    let (notification_tx, mut notifications) = mpsc::unbounded_channel();
    let mut link = LinkService::new(
        transport,
        inbox,
        &settings.get().link,
        default_contracts(Some(notification_tx)),
    );

    let (session_tx, mut session_events) = mpsc::unbounded_channel();
    link.add_observer(Box::new(session_tx));

    let shutdown = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutting down");
        shutdown.close();
    });

    tokio::spawn(async move {
        while let Some(update) = notifications.recv().await {
            match update {
                NotificationUpdate::Posted { event, attributes } => {
                    info!(uid = event.uid_value(), ?attributes, "Notification posted")
                }
                NotificationUpdate::Removed { uid } => {
                    info!(uid = u32::from_le_bytes(uid), "Notification removed")
                }
            }
        }
    });

    let session = tokio::spawn(async move {
        let mut candidate: Option<PeripheralId> = None;
        while let Some(event) = session_events.recv().await {
            match event {
                SessionEvent::DeviceFound(peripheral) => candidate = Some(peripheral),
                SessionEvent::StateChanged(ConnectionState::Ready) => {
                    info!("Link ready");
                    if let Some(peripheral) = &candidate {
                        if let Err(e) = settings.remember_peripheral(peripheral.as_str()) {
                            warn!("Failed to save settings: {}", e);
                        }
                    }
                }
                SessionEvent::StateChanged(state) => info!(%state, "Link state"),
                SessionEvent::ConnectionError {
                    consecutive_failures,
                } => warn!(consecutive_failures, "Connection attempt failed"),
                other => info!(?other, "Session event"),
            }
        }
    });

    link.run().await;
    drop(handle);
    let _ = session.await;
    Ok(())
}
