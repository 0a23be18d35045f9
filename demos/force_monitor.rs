use activ5::{
    inbox, BtleplugTransport, ConnectionState, DeviceEvent, DeviceInfo, DeviceObserver, ManagerOptions, Result,
    SessionManager, SqueezeState,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

struct ForceLogger;

impl DeviceObserver for ForceLogger {
    fn device_found(&self, device: &DeviceInfo) {
        info!("🔍 Found {} (RSSI {:.0})", device.name, device.rssi);
    }

    fn device_connected(&self, device: &DeviceInfo) {
        info!("✅ Connected to {}", device.name);
    }

    fn device_disconnected(&self, device: &DeviceInfo) {
        warn!("🔌 {} disconnected", device.name);
    }

    fn device_initialized(&self, device: &DeviceInfo) {
        info!(
            "🆔 {} ready: serial {}, firmware {}",
            device.name,
            device.serial_number.as_deref().unwrap_or("-"),
            device.device_version.as_deref().unwrap_or("-")
        );
    }

    fn isometric_received(&self, device: &DeviceInfo, value: f64) {
        println!("{:>12} {:8.2} N", device.name, value);
    }

    fn squeeze_state_changed(&self, device: &DeviceInfo, state: SqueezeState) {
        info!("✊ {} {:?}", device.name, state);
    }

    fn double_squeeze_detected(&self, device: &DeviceInfo) {
        info!("🎉 Double squeeze on {}", device.name);
    }

    fn radio_switched_off(&self) {
        error!("❌ Bluetooth is switched off");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("💪 Activ5 Force Monitor Example");

    let (sink, inbox) = inbox();
    let transport = BtleplugTransport::new(sink.clone()).await?;
    let options = ManagerOptions {
        scan_timeout_ms: 10_000,
        ..ManagerOptions::default()
    };
    let (manager, queue) = SessionManager::new(transport, options, sink);

    let observer = Arc::new(ForceLogger);
    manager.set_observer(&observer).await;
    tokio::spawn(manager.clone().run(inbox));
    tokio::spawn(queue.run());

    // Give the adapter a moment to report its power state
    tokio::time::sleep(Duration::from_millis(500)).await;

    info!("Searching for Activ5 devices...");
    let completed = manager.scan().await?;
    let _ = completed.await;

    let Some(device) = manager.devices().await.into_iter().next() else {
        error!("❌ No Activ5 device found");
        return Ok(());
    };

    // Subscribe first so the init signal cannot slip past
    let mut signals = manager.subscribe();
    manager.connect(&device.peripheral).await?;

    // Wait for the handshake to settle before streaming
    loop {
        match signals.recv().await {
            Ok(DeviceEvent::DeviceInitialized(ready)) if ready.name == device.name => break,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => {
                error!("❌ Manager stopped before {} was ready", device.name);
                return Ok(());
            }
        }
    }

    manager.set_evergreen(&device.name, true).await?;
    manager.start_force_streaming(&device.name).await?;
    info!("📈 Streaming force from {}. Press Ctrl+C to stop", device.name);

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Unable to listen for Ctrl+C: {}", e);
    }

    if manager.device(&device.name).await.map(|d| d.state) == Some(ConnectionState::Isometric) {
        manager.stop(&device.name).await?;
    }
    manager.disconnect_all().await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    info!("👋 Done");
    Ok(())
}
