use std::time::Duration;
use tokio::time::{interval, Instant};
use tracing::{error, info};
use wheelers::{BikeWorker, ClientConfig, SessionRecorder, SportProgram};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let Some(program_path) = args.next() else {
        eprintln!("Usage: program_workout <program.txt> <minutes> [host]");
        std::process::exit(2);
    };
    let minutes: u32 = args.next().as_deref().unwrap_or("20").parse()?;
    let host = args
        .next()
        .unwrap_or_else(|| wheelers::DEFAULT_P2P_HOST.to_string());

    let text = std::fs::read_to_string(&program_path)?;
    let name = std::path::Path::new(&program_path)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("program");
    let program = SportProgram::parse(name, &text)?.with_duration(minutes);
    info!(
        "📋 Program {} loaded: {} segments over {minutes} minutes",
        program.name(),
        program.total_segments()
    );

    info!("🚴 Connecting to bike at {host}:{}...", wheelers::PORT);
    let (bike, worker) =
        match BikeWorker::spawn(&host, wheelers::PORT, ClientConfig::default()).await {
            Ok(session) => session,
            Err(e) => {
                error!("❌ Failed to connect: {e}");
                return Err(e.into());
            }
        };
    info!("✅ Connected to bike {}", bike.device_info().mac_address);

    let mut recorder = SessionRecorder::create("activity_logs", "program")?;
    bike.clear_data().await?;
    bike.start_sport().await?;

    let start_time = Instant::now();
    let mut step_interval = interval(Duration::from_secs(1));
    let mut current_level: Option<u8> = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, ending ride early");
                break;
            }
            _ = step_interval.tick() => {
                let elapsed = start_time.elapsed();
                if program.is_complete(elapsed) {
                    info!("🏁 Program complete!");
                    break;
                }

                if let Some(level) = program.level_at(elapsed) {
                    if current_level != Some(level) {
                        info!("💪 Segment change: level {level}");
                        bike.set_level(i32::from(level)).await?;
                        current_level = Some(level);
                    }
                }

                let snap = bike.snapshot();
                recorder.record(&snap)?;

                let progress = program.progress(elapsed);
                println!(
                    "[{:5.1}%] segment {}/{} | {:.2} km | {:.1} km/h | {} rpm | level {}",
                    progress.percent,
                    progress.segment,
                    program.total_segments(),
                    snap.distance_km,
                    snap.speed_kmh,
                    snap.rpm,
                    snap.level,
                );
            }
        }
    }

    bike.pause_sport().await.ok();
    bike.shutdown().await;
    worker.await.ok();
    info!("👋 Ride saved to {}", recorder.path().display());
    Ok(())
}
