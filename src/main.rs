use klavier_remote::domain::settings::{SettingsService, TransportKind};
use klavier_remote::infrastructure::logging;
use klavier_remote::infrastructure::transport::{MemoryTransport, TcpTransport, Transport};
use klavier_remote::presentation::console::Console;
use klavier_remote::{CoordinateAggregator, SessionManager, TouchSurface};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;

    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging, running without logs: {}", e))
        .ok();

    tracing::info!(
        "Starting Klavier Remote (settings at {})",
        settings_service.path().display()
    );

    let settings = settings_service.get().clone();
    let transport: Arc<dyn Transport> = match settings.transport.kind {
        TransportKind::Tcp => Arc::new(TcpTransport::new(
            Duration::from_millis(settings.transport.connect_timeout_ms),
            Duration::from_millis(settings.transport.write_timeout_ms),
        )),
        TransportKind::Memory => Arc::new(MemoryTransport::new()),
    };

    let aggregator = Arc::new(CoordinateAggregator::new(
        settings.channel_count,
        settings.channel_max,
    ));
    let surface = TouchSurface::new(
        Arc::clone(&aggregator),
        settings.surface_width,
        settings.surface_inset,
    );
    let manager = SessionManager::new(transport, aggregator, settings.session_config());

    Console::new(manager, surface, settings_service).run().await
}
