//! Background worker that owns a bike session end to end
//!
//! The wire protocol is strictly request–response, so a [`crate::BikeClient`]
//! must be driven by exactly one caller. Applications that want telemetry
//! without structuring themselves around that constraint spawn a
//! [`BikeWorker`] instead: a dedicated tokio task owns the client, polls on a
//! fixed cadence, and publishes each decoded snapshot over a watch channel.
//! Any number of [`BikeHandle`] clones read the latest snapshot without
//! blocking and submit control commands over an mpsc channel, each answered
//! through its own oneshot.
//!
//! The worker never reconnects. When the session is lost (liveness
//! saturation or an I/O failure) the task exits, the channels close, and
//! every pending or future handle call fails with
//! [`BikeError::WorkerGone`]. Recovery means spawning a fresh worker.

use crate::{
    device::BikeClient,
    error::{BikeError, CommandError},
    types::{ClientConfig, DeviceInfo, SessionPhase, SportSnapshot},
};
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info};

/// Control requests crossing from handles into the worker task
enum Command {
    SetLevel {
        level: i32,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    StartSport {
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    PauseSport {
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    ClearData {
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Dedicated task that exclusively owns one bike session
///
/// Constructed only through [`BikeWorker::spawn`], which connects and runs
/// the initialization handshake before the task starts, so a returned worker
/// is always ready to poll.
pub struct BikeWorker {
    client: BikeClient,
    commands: mpsc::Receiver<Command>,
    snapshots: watch::Sender<SportSnapshot>,
    poll_interval: Duration,
}

/// Cheap, cloneable front for a running [`BikeWorker`]
///
/// Reading the latest snapshot never blocks on the device; command methods
/// resolve when the worker has executed them on the wire.
///
/// # Examples
///
/// ```no_run
/// use wheelers::{BikeWorker, ClientConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (handle, _task) =
///         BikeWorker::spawn(wheelers::DEFAULT_P2P_HOST, wheelers::PORT, ClientConfig::default())
///             .await?;
///
///     handle.start_sport().await?;
///     handle.set_level(5).await?;
///
///     let mut watcher = handle.clone();
///     loop {
///         let snap = watcher.next_snapshot().await?;
///         println!("{:.2} km at {:.1} km/h", snap.distance_km, snap.speed_kmh);
///     }
/// }
/// ```
#[derive(Clone)]
pub struct BikeHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SportSnapshot>,
    device_info: DeviceInfo,
}

impl BikeWorker {
    /// Connect, initialize, and hand the session to a background task
    ///
    /// Connection and handshake run in the caller's context so failures
    /// surface here instead of inside a detached task. On success the
    /// returned handle is immediately usable; the join handle resolves when
    /// the worker exits (shutdown, all handles dropped, or session loss).
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Connect`] or [`BikeError::Handshake`] when the
    /// session cannot be established.
    pub async fn spawn(
        host: &str,
        port: u16,
        config: ClientConfig,
    ) -> Result<(BikeHandle, JoinHandle<()>), BikeError> {
        let poll_interval = Duration::from_millis(config.timeouts.poll_interval_ms);
        let mut client = BikeClient::with_config(config);
        client.connect_to(host, port).await?;
        let device_info = client.initialize().await?;

        let (command_tx, command_rx) = mpsc::channel(16);
        let (snapshot_tx, snapshot_rx) = watch::channel(SportSnapshot::default());

        let worker = Self {
            client,
            commands: command_rx,
            snapshots: snapshot_tx,
            poll_interval,
        };
        let task = tokio::spawn(worker.run());

        Ok((
            BikeHandle {
                commands: command_tx,
                snapshots: snapshot_rx,
                device_info,
            },
            task,
        ))
    }

    async fn run(mut self) {
        info!("Bike worker started");
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => {
                        info!("All handles dropped, worker shutting down");
                        self.client.disconnect().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    match self.client.poll().await {
                        Ok(Some(snap)) => {
                            self.snapshots.send_replace(snap);
                        }
                        Ok(None) => debug!("Poll unanswered"),
                        Err(e) => {
                            error!("Worker stopping, session lost: {}", e);
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Execute one command; returns true when the worker should exit
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SetLevel { level, reply } => {
                let _ = reply.send(self.client.set_level(level).await);
            }
            Command::StartSport { reply } => {
                let _ = reply.send(self.client.start_sport().await);
            }
            Command::PauseSport { reply } => {
                let _ = reply.send(self.client.pause_sport().await);
            }
            Command::ClearData { reply } => {
                let _ = reply.send(self.client.clear_data().await);
            }
            Command::Shutdown { reply } => {
                info!("Worker shutdown requested");
                self.client.disconnect().await;
                let _ = reply.send(());
                return true;
            }
        }
        // A command that killed the session kills the worker with it
        if self.client.phase() == SessionPhase::Error {
            error!("Worker stopping, session entered error state");
            return true;
        }
        false
    }
}

impl BikeHandle {
    /// Device identity captured during the worker's handshake
    #[must_use]
    pub const fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }

    /// Latest published snapshot, without waiting
    ///
    /// Returns the default (all-zero) snapshot until the first poll decodes.
    #[must_use]
    pub fn snapshot(&self) -> SportSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Wait for the next snapshot the worker publishes
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::WorkerGone`] once the worker has exited.
    pub async fn next_snapshot(&mut self) -> Result<SportSnapshot, BikeError> {
        self.snapshots
            .changed()
            .await
            .map_err(|_| BikeError::WorkerGone)?;
        Ok(self.snapshots.borrow_and_update().clone())
    }

    /// Set the resistance level (display numbering, clamped by the device range)
    ///
    /// # Errors
    ///
    /// Returns the underlying [`CommandError`] from the worker, or
    /// [`BikeError::WorkerGone`] if the worker has exited.
    pub async fn set_level(&self, level: i32) -> Result<(), BikeError> {
        self.request(|reply| Command::SetLevel { level, reply }).await
    }

    /// Enter sport mode
    ///
    /// # Errors
    ///
    /// Same failure modes as [`set_level`](Self::set_level).
    pub async fn start_sport(&self) -> Result<(), BikeError> {
        self.request(|reply| Command::StartSport { reply }).await
    }

    /// Pause sport mode
    ///
    /// # Errors
    ///
    /// Same failure modes as [`set_level`](Self::set_level).
    pub async fn pause_sport(&self) -> Result<(), BikeError> {
        self.request(|reply| Command::PauseSport { reply }).await
    }

    /// Clear the bike's accumulated data and distance history
    ///
    /// # Errors
    ///
    /// Same failure modes as [`set_level`](Self::set_level).
    pub async fn clear_data(&self) -> Result<(), BikeError> {
        self.request(|reply| Command::ClearData { reply }).await
    }

    /// Ask the worker to tear the session down and exit
    ///
    /// Resolves once the worker has disconnected. Calling this on an
    /// already-gone worker is not an error; the goal state holds either way.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    async fn request<F>(&self, build: F) -> Result<(), BikeError>
    where
        F: FnOnce(oneshot::Sender<Result<(), CommandError>>) -> Command,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| BikeError::WorkerGone)?;
        let result = reply_rx.await.map_err(|_| BikeError::WorkerGone)?;
        result.map_err(BikeError::from)
    }
}
