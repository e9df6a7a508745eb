use std::time::Duration;
use tokio::time::{interval, Instant};
use tracing::{error, info};
use wheelers::{BikeWorker, ClientConfig, SessionRecorder};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let host = std::env::args()
        .nth(1)
        .unwrap_or_else(|| wheelers::DEFAULT_P2P_HOST.to_string());

    info!("🚴 Wheelers Live Monitor Example");
    info!("Connecting to bike at {host}:{}...", wheelers::PORT);

    let (bike, worker) =
        match BikeWorker::spawn(&host, wheelers::PORT, ClientConfig::default()).await {
            Ok(session) => session,
            Err(e) => {
                error!("❌ Failed to connect: {e}");
                return Err(e.into());
            }
        };

    let info = bike.device_info();
    info!("✅ Connected to bike {}", info.mac_address);
    info!(
        "   Resistance {}-{}, wheel {:.1}\"",
        info.resistance_min, info.resistance_max, info.wheel_diameter_in
    );

    let mut recorder = SessionRecorder::create("activity_logs", "manual")?;
    info!("📝 Logging to {}", recorder.path().display());

    bike.start_sport().await?;
    info!("Press Ctrl+C to stop");

    let mut display_interval = interval(Duration::from_secs(1));
    let start_time = Instant::now();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = worker_watch(&bike) => {
                error!("❌ Session lost");
                break;
            }
            _ = display_interval.tick() => {
                let snap = bike.snapshot();
                recorder.record(&snap)?;

                let elapsed = start_time.elapsed();
                let minutes = elapsed.as_secs() / 60;
                let seconds = elapsed.as_secs() % 60;

                println!("\n🚴 Ride Update ({minutes:02}:{seconds:02})");
                println!("┌─────────────────────────────────┐");
                println!("│ Distance: {:8.2} km           │", snap.distance_km);
                println!("│ Speed:    {:8.1} km/h         │", snap.speed_kmh);
                println!("│ Cadence:  {:8} rpm          │", snap.rpm);
                println!("│ Pulse:    {:8} bpm          │", snap.heart_rate_bpm);
                println!("│ Level:    {:8}              │", snap.level);
                println!("│ Calories: {:8.1} kcal         │", snap.calories_kcal);
                println!("│ Power:    {:8} W            │", snap.power_watts);
                println!("└─────────────────────────────────┘");
            }
        }
    }

    info!("Shutting down...");
    bike.pause_sport().await.ok();
    bike.shutdown().await;
    worker.await.ok();
    info!("👋 Ride saved to {}", recorder.path().display());
    Ok(())
}

// Resolves only when the worker has exited and its snapshot channel closed
async fn worker_watch(bike: &wheelers::BikeHandle) {
    let mut watcher = bike.clone();
    while watcher.next_snapshot().await.is_ok() {}
}
