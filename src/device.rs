use crate::{
    error::{CommandError, ConnectError, HandshakeError, HandshakeStep, PollError},
    net::BikeConnection,
    protocol::{self, encode_level, parse_sport_record, Frame},
    types::{
        calories_from_raw, counts_to_km, speed_from_rpm, ClientConfig, DeviceInfo,
        DistanceTracker, SessionPhase, SportSnapshot,
    },
    AUTH_PASSWORD, PORT,
};
use std::{sync::Arc, time::SystemTime};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Consecutive unanswered requests after which the session is considered lost
pub const MAX_MISSED_RESPONSES: u32 = 30;

/// One bike session: a TCP connection plus a typed snapshot of device state
///
/// `BikeClient` owns the socket exclusively and must be driven by one caller
/// at a time — the wire protocol is strictly request–response and overlapping
/// requests is undefined by the device. The published [`SportSnapshot`] is
/// the only shared state: readers take a scoped lock and get a value copy,
/// never a live reference, so a slow device cannot block them.
///
/// Multiple bikes are simply multiple `BikeClient` instances; no state is
/// shared between sessions.
///
/// # Examples
///
/// ```no_run
/// use wheelers::BikeClient;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut bike = BikeClient::new();
///     bike.connect(wheelers::DEFAULT_P2P_HOST).await?;
///     bike.initialize().await?;
///     bike.start_sport().await?;
///     bike.set_level(5).await?;
///
///     loop {
///         if let Some(snap) = bike.poll().await? {
///             println!("{:.2} km, {} rpm", snap.distance_km, snap.rpm);
///         }
///         tokio::time::sleep(std::time::Duration::from_millis(200)).await;
///     }
/// }
/// ```
pub struct BikeClient {
    conn: Option<BikeConnection>,
    phase: SessionPhase,
    missed_responses: u32,
    device_info: DeviceInfo,
    tracker: DistanceTracker,
    snapshot: Arc<RwLock<SportSnapshot>>,
    config: ClientConfig,
}

impl Default for BikeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BikeClient {
    /// Create a disconnected session with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Create a disconnected session with explicit timeouts and frame layout
    #[must_use]
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            conn: None,
            phase: SessionPhase::Disconnected,
            missed_responses: 0,
            device_info: DeviceInfo::default(),
            tracker: DistanceTracker::new(),
            snapshot: Arc::new(RwLock::new(SportSnapshot::default())),
            config,
        }
    }

    /// Current session phase
    #[must_use]
    pub const fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Device identity; defaults until `initialize` succeeds
    #[must_use]
    pub const fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }

    /// Consecutive unanswered requests so far (0..=30)
    #[must_use]
    pub const fn missed_responses(&self) -> u32 {
        self.missed_responses
    }

    /// Value copy of the latest published snapshot
    pub async fn snapshot(&self) -> SportSnapshot {
        self.snapshot.read().await.clone()
    }

    /// Open the TCP connection on the standard port (1971)
    ///
    /// Success moves the session to `Initializing`; failure leaves it
    /// `Disconnected`. No retry is performed — retry policy belongs to the
    /// caller.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectError`] classifying the failure (unreachable,
    /// refused, timed out).
    pub async fn connect(&mut self, host: &str) -> Result<(), ConnectError> {
        self.connect_to(host, PORT).await
    }

    /// Open the TCP connection on an explicit port
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectError`] classifying the failure.
    pub async fn connect_to(&mut self, host: &str, port: u16) -> Result<(), ConnectError> {
        let conn =
            BikeConnection::connect(host, port, self.config.timeouts.connect_timeout_ms).await?;

        self.conn = Some(conn);
        self.phase = SessionPhase::Initializing;
        self.missed_responses = 0;
        self.tracker = DistanceTracker::new();
        *self.snapshot.write().await = SportSnapshot::default();
        Ok(())
    }

    /// Run the fixed, ordered initialization handshake
    ///
    /// Must follow a successful [`connect`](Self::connect). The bike streams
    /// its identity frames in a fixed order; each is acknowledged in turn and
    /// the sequence ends with the bike paused. On success the session is
    /// `Idle` and the returned [`DeviceInfo`] is frozen for the session.
    ///
    /// A credential mismatch in the password step is logged and tolerated —
    /// some firmware revisions omit or alter the field.
    ///
    /// # Errors
    ///
    /// Returns a step-identified [`HandshakeError`] on timeout or an
    /// out-of-order/unparseable frame; the socket is closed and the session
    /// returns to `Disconnected`. Callers may retry the whole sequence from
    /// `connect`, never resume mid-handshake.
    pub async fn initialize(&mut self) -> Result<DeviceInfo, HandshakeError> {
        if self.phase != SessionPhase::Initializing || self.conn.is_none() {
            return Err(HandshakeError::NotConnected);
        }
        info!("Starting initialization handshake");

        self.send_handshake(HandshakeStep::InitAck, &Frame::start_init())
            .await?;

        // 1. Init acknowledgment
        let frame = self.expect_step(HandshakeStep::InitAck).await?;
        if frame.tag != protocol::TAG_INIT || !frame.is_ok() {
            return Err(self.reject_step(HandshakeStep::InitAck, &frame));
        }

        // 2. Password — verify but never fail on mismatch
        let frame = self.expect_step(HandshakeStep::Password).await?;
        if frame.tag != protocol::TAG_PASSWORD {
            return Err(self.reject_step(HandshakeStep::Password, &frame));
        }
        if frame.payload_str() == AUTH_PASSWORD {
            debug!("Credential verified");
        } else {
            warn!(
                "Credential mismatch (got {:?}), continuing anyway",
                frame.payload_str()
            );
        }
        self.send_handshake(HandshakeStep::Password, &Frame::ok(protocol::TAG_PASSWORD))
            .await?;

        // 3. Resistance range MIN-MAX; a range with no display level at 1 or
        // above leaves set_level with nothing to encode, so it is rejected
        // here rather than trusted until the first command
        let frame = self.expect_step(HandshakeStep::ResistanceRange).await?;
        let range = (frame.tag == protocol::TAG_RESISTANCE_RANGE)
            .then(|| frame.payload_str().split_once('-'))
            .flatten()
            .and_then(|(lo, hi)| Some((lo.parse::<u8>().ok()?, hi.parse::<u8>().ok()?)))
            .filter(|&(min, max)| min >= 1 && min <= max);
        let Some((min, max)) = range else {
            return Err(self.reject_step(HandshakeStep::ResistanceRange, &frame));
        };
        self.send_handshake(
            HandshakeStep::ResistanceRange,
            &Frame::ok(protocol::TAG_RESISTANCE_RANGE),
        )
        .await?;

        // 4. Wheel diameter, inches ×100
        let frame = self.expect_step(HandshakeStep::WheelDiameter).await?;
        let diameter = (frame.tag == protocol::TAG_WHEEL_DIAMETER)
            .then(|| frame.payload_str().parse::<u32>().ok())
            .flatten();
        let Some(diameter_x100) = diameter else {
            return Err(self.reject_step(HandshakeStep::WheelDiameter, &frame));
        };
        self.send_handshake(
            HandshakeStep::WheelDiameter,
            &Frame::ok(protocol::TAG_WHEEL_DIAMETER),
        )
        .await?;

        // 5. MAC address, stored verbatim
        let frame = self.expect_step(HandshakeStep::MacAddress).await?;
        if frame.tag != protocol::TAG_MAC_ADDRESS {
            return Err(self.reject_step(HandshakeStep::MacAddress, &frame));
        }
        let mac = frame.payload_str().to_string();
        self.send_handshake(
            HandshakeStep::MacAddress,
            &Frame::ok(protocol::TAG_MAC_ADDRESS),
        )
        .await?;

        // 6/7. Optional informational frames, then the end-of-init marker
        loop {
            let frame = self.expect_step(HandshakeStep::Memory).await?;
            match frame.tag.as_str() {
                protocol::TAG_MEMORY => {
                    debug!("Memory frame: {:?}", frame.payload_str());
                    self.send_handshake(HandshakeStep::Memory, &Frame::ok(protocol::TAG_MEMORY))
                        .await?;
                }
                protocol::TAG_EQUIPMENT | protocol::TAG_VENDOR => {
                    debug!("Info frame {}: {:?}", frame.tag, frame.payload_str());
                    self.send_handshake(HandshakeStep::Memory, &Frame::ok(&frame.tag))
                        .await?;
                }
                protocol::TAG_END_OF_INIT => {
                    self.send_handshake(
                        HandshakeStep::EndOfInit,
                        &Frame::ok(protocol::TAG_END_OF_INIT),
                    )
                    .await?;
                    // The bike comes up running; park it until start_sport
                    self.send_handshake(HandshakeStep::EndOfInit, &Frame::pause())
                        .await?;
                    break;
                }
                _ => return Err(self.reject_step(HandshakeStep::EndOfInit, &frame)),
            }
        }

        self.device_info = DeviceInfo {
            resistance_min: min,
            resistance_max: max,
            wheel_diameter_in: f64::from(diameter_x100) / 100.0,
            mac_address: mac,
        };
        self.phase = SessionPhase::Idle;
        info!(
            "Initialized: levels {}-{}, wheel {:.2}\", MAC {}",
            min, max, self.device_info.wheel_diameter_in, self.device_info.mac_address
        );
        Ok(self.device_info.clone())
    }

    /// Enter sport mode: request telemetry and resume the bike
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::NotConnected`] unless the session is `Idle`
    /// or `Sporting`, [`CommandError::ConnectionLost`] if this send
    /// saturates the liveness counter, or an I/O failure.
    pub async fn start_sport(&mut self) -> Result<(), CommandError> {
        self.ensure_ready()?;
        info!("Starting sport mode");
        self.send_command(&Frame::data_request()).await?;
        self.send_command(&Frame::resume()).await?;
        self.await_ack().await?;
        self.phase = SessionPhase::Sporting;
        Ok(())
    }

    /// Pause sport mode
    ///
    /// # Errors
    ///
    /// Same failure modes as [`start_sport`](Self::start_sport).
    pub async fn pause_sport(&mut self) -> Result<(), CommandError> {
        self.ensure_ready()?;
        info!("Pausing sport mode");
        self.send_command(&Frame::pause()).await?;
        self.await_ack().await?;
        self.phase = SessionPhase::Idle;
        Ok(())
    }

    /// Set the resistance level (display numbering)
    ///
    /// Out-of-range requests clamp to the device's range; only a level that
    /// cannot be represented even after clamping (negative) is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::LevelOutOfRange`] for unrepresentable levels,
    /// plus the failure modes of any command send.
    pub async fn set_level(&mut self, level: i32) -> Result<(), CommandError> {
        self.ensure_ready()?;
        let wire = encode_level(
            level,
            self.device_info.resistance_min,
            self.device_info.resistance_max,
        )?;
        info!("Setting level {} (wire {:02})", level, wire);
        self.send_command(&Frame::set_level(wire)).await?;
        self.await_ack().await
    }

    /// Clear the bike's accumulated data and reset local distance tracking
    ///
    /// The device does not reliably acknowledge this command, so the local
    /// wrap-around state is reset immediately on send, not on confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::NotConnected`] or an I/O failure.
    pub async fn clear_data(&mut self) -> Result<(), CommandError> {
        self.ensure_ready()?;
        info!("Clearing session data");
        self.send_command(&Frame::clear()).await?;

        self.tracker.reset();
        {
            let mut snapshot = self.snapshot.write().await;
            snapshot.raw_distance = 0;
            snapshot.wrap_count = 0;
            snapshot.distance_km = 0.0;
            snapshot.calories_kcal = 0.0;
        }
        Ok(())
    }

    /// Request and decode one sport-data record
    ///
    /// Valid in `Idle` or `Sporting`. `Ok(None)` means the response was
    /// absent, malformed or not a telemetry frame: the previous snapshot
    /// stands, and the miss is counted toward liveness. On a decode the
    /// wrap-corrected snapshot is published atomically and acknowledged to
    /// the bike.
    ///
    /// # Errors
    ///
    /// Returns [`PollError::InvalidPhase`] outside `Idle`/`Sporting`,
    /// [`PollError::ConnectionLost`] when this poll saturates the liveness
    /// counter (the session moves to `Error` and the socket closes), or an
    /// I/O failure.
    pub async fn poll(&mut self) -> Result<Option<SportSnapshot>, PollError> {
        if !matches!(self.phase, SessionPhase::Idle | SessionPhase::Sporting) {
            return Err(PollError::InvalidPhase { phase: self.phase });
        }

        let timeout_ms = self.config.timeouts.poll_timeout_ms;
        let result = match self.conn.as_mut() {
            Some(conn) => {
                conn.discard_pending();
                match conn.send_frame(&Frame::data_request()).await {
                    Ok(()) => conn.recv_frame(timeout_ms).await,
                    Err(e) => Err(e),
                }
            }
            None => return Err(PollError::InvalidPhase { phase: self.phase }),
        };

        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                self.fail_session();
                return Err(PollError::Io(e));
            }
        };

        let Some(frame) = frame else {
            debug!("Poll timed out");
            return self.note_miss().map_or(Ok(None), |misses| {
                Err(PollError::ConnectionLost { misses })
            });
        };

        if frame.tag != protocol::TAG_SPORT_DATA {
            debug!("Expected telemetry, got {:?}", frame.encode());
            return self.note_miss().map_or(Ok(None), |misses| {
                Err(PollError::ConnectionLost { misses })
            });
        }

        let record = match parse_sport_record(frame.payload_str(), self.config.frame_layout) {
            Ok(record) => record,
            Err(e) => {
                warn!("Discarding sport frame: {}", e);
                return self.note_miss().map_or(Ok(None), |misses| {
                    Err(PollError::ConnectionLost { misses })
                });
            }
        };

        self.missed_responses = 0;

        let full_counts = self.tracker.observe(record.distance);
        let snap = SportSnapshot {
            sync_counter: record.sync,
            raw_distance: record.distance,
            wrap_count: self.tracker.wrap_count(),
            distance_km: counts_to_km(full_counts, self.device_info.wheel_diameter_in),
            rpm: record.rpm,
            heart_rate_bpm: record.heart_rate,
            level: record.level,
            calories_kcal: calories_from_raw(record.calories_raw),
            power_watts: record.power,
            speed_kmh: speed_from_rpm(record.rpm),
            timestamp: SystemTime::now(),
        };

        // Ack before publish; a failed ack is a dead socket
        if let Some(conn) = self.conn.as_mut() {
            if let Err(e) = conn.send_frame(&Frame::sport_ack()).await {
                self.fail_session();
                return Err(PollError::Io(e));
            }
        }

        *self.snapshot.write().await = snap.clone();
        Ok(Some(snap))
    }

    /// Tear the session down, best-effort notifying the bike
    ///
    /// If a socket is open a terminate command is attempted before closing.
    /// The session ends `Disconnected` regardless.
    pub async fn disconnect(&mut self) {
        info!("Disconnecting");
        if let Some(conn) = self.conn.take() {
            conn.shutdown().await;
        }
        self.phase = SessionPhase::Disconnected;
        self.missed_responses = 0;
    }

    // --- internals ---

    fn ensure_ready(&self) -> Result<(), CommandError> {
        if matches!(self.phase, SessionPhase::Idle | SessionPhase::Sporting) && self.conn.is_some()
        {
            Ok(())
        } else {
            Err(CommandError::NotConnected { phase: self.phase })
        }
    }

    /// Record one unanswered request. Returns the saturating count when the
    /// session just died.
    fn note_miss(&mut self) -> Option<u32> {
        self.missed_responses += 1;
        debug!(
            "Missed response {}/{}",
            self.missed_responses, MAX_MISSED_RESPONSES
        );
        if self.missed_responses >= MAX_MISSED_RESPONSES {
            warn!("Liveness counter saturated, session lost");
            self.fail_session();
            Some(self.missed_responses)
        } else {
            None
        }
    }

    fn fail_session(&mut self) {
        self.phase = SessionPhase::Error;
        self.conn = None;
    }

    async fn send_command(&mut self, frame: &Frame) -> Result<(), CommandError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or(CommandError::NotConnected { phase: self.phase })?;
        conn.discard_pending();
        match conn.send_frame(frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail_session();
                Err(CommandError::Io(e))
            }
        }
    }

    /// Bounded wait for any parseable response to a control command
    ///
    /// Any frame counts: the bike acknowledges control commands with an
    /// assortment of `OK`/echo frames, and receiving anything proves the
    /// link alive. Silence is a liveness miss, not an error — unless it is
    /// the saturating one.
    async fn await_ack(&mut self) -> Result<(), CommandError> {
        let timeout_ms = self.config.timeouts.ack_timeout_ms;
        let Some(conn) = self.conn.as_mut() else {
            return Err(CommandError::NotConnected { phase: self.phase });
        };
        match conn.recv_frame(timeout_ms).await {
            Ok(Some(_)) => {
                self.missed_responses = 0;
                Ok(())
            }
            Ok(None) => self
                .note_miss()
                .map_or(Ok(()), |misses| Err(CommandError::ConnectionLost { misses })),
            Err(e) => {
                self.fail_session();
                Err(CommandError::Io(e))
            }
        }
    }

    async fn send_handshake(
        &mut self,
        step: HandshakeStep,
        frame: &Frame,
    ) -> Result<(), HandshakeError> {
        let conn = self.conn.as_mut().ok_or(HandshakeError::NotConnected)?;
        match conn.send_frame(frame).await {
            Ok(()) => Ok(()),
            Err(source) => {
                self.fail_session();
                Err(HandshakeError::Io { step, source })
            }
        }
    }

    async fn expect_step(&mut self, step: HandshakeStep) -> Result<Frame, HandshakeError> {
        let timeout_ms = self.config.timeouts.handshake_timeout_ms;
        let conn = self.conn.as_mut().ok_or(HandshakeError::NotConnected)?;
        match conn.recv_frame(timeout_ms).await {
            Ok(Some(frame)) => {
                self.missed_responses = 0;
                Ok(frame)
            }
            Ok(None) => {
                self.abort_handshake();
                Err(HandshakeError::Timeout { step })
            }
            Err(source) => {
                self.fail_session();
                Err(HandshakeError::Io { step, source })
            }
        }
    }

    /// Build the malformed-step error and abort the handshake
    fn reject_step(&mut self, step: HandshakeStep, frame: &Frame) -> HandshakeError {
        warn!("Handshake aborted at {} step: {:?}", step, frame.encode());
        self.abort_handshake();
        HandshakeError::Malformed {
            step,
            frame: frame.encode(),
        }
    }

    /// Timeouts and malformed frames close the socket and return to
    /// `Disconnected`; the caller retries from `connect` if at all.
    fn abort_handshake(&mut self) {
        self.conn = None;
        self.phase = SessionPhase::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TimeoutConfig;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        task::JoinHandle,
    };

    /// Read one `<...>` frame off the mock bike's socket
    async fn read_frame(stream: &mut TcpStream) -> String {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).await.unwrap();
            out.push(byte[0]);
            if byte[0] == b'>' {
                return String::from_utf8(out).unwrap();
            }
        }
    }

    async fn expect_frame(stream: &mut TcpStream, want: &str) {
        let got = read_frame(stream).await;
        assert_eq!(got, want, "mock bike got unexpected command");
    }

    /// Spawn a scripted bike; returns its port and the script's join handle
    fn spawn_bike<F, Fut>(script: F) -> (u16, JoinHandle<()>)
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let listener = TcpListener::from_std(listener).unwrap();
            let (stream, _) = listener.accept().await.unwrap();
            script(stream).await;
        });
        (port, handle)
    }

    /// Serve the full happy-path handshake from the mock side
    async fn serve_handshake(stream: &mut TcpStream) {
        expect_frame(stream, "<EQ_>").await;
        stream.write_all(b"<EQ_OK>").await.unwrap();
        stream.write_all(b"<EP_SUPERWIGH>").await.unwrap();
        expect_frame(stream, "<EP_OK>").await;
        stream.write_all(b"<ER_1-20>").await.unwrap();
        expect_frame(stream, "<ER_OK>").await;
        stream.write_all(b"<ED_2100>").await.unwrap();
        expect_frame(stream, "<ED_OK>").await;
        stream.write_all(b"<EA_AABBCCDDEEFF>").await.unwrap();
        expect_frame(stream, "<EA_OK>").await;
        stream.write_all(b"<EM_0>").await.unwrap();
        expect_frame(stream, "<EM_OK>").await;
        stream.write_all(b"<Ez_1E>").await.unwrap();
        expect_frame(stream, "<Ez_OK>").await;
        expect_frame(stream, "<CP_300>").await;
    }

    fn fast_config() -> ClientConfig {
        ClientConfig {
            timeouts: TimeoutConfig {
                connect_timeout_ms: 1_000,
                handshake_timeout_ms: 1_000,
                poll_timeout_ms: 60,
                ack_timeout_ms: 60,
                poll_interval_ms: 10,
            },
            frame_layout: crate::types::SportFrameLayout::DistanceFirst,
        }
    }

    async fn connected_client(port: u16) -> BikeClient {
        let mut client = BikeClient::with_config(fast_config());
        client.connect_to("127.0.0.1", port).await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_handshake_populates_device_info() {
        let (port, bike) = spawn_bike(|mut stream| async move {
            serve_handshake(&mut stream).await;
        });

        let mut client = connected_client(port).await;
        assert_eq!(client.phase(), SessionPhase::Initializing);

        let info = client.initialize().await.unwrap();
        assert_eq!(client.phase(), SessionPhase::Idle);
        assert_eq!(info.resistance_min, 1);
        assert_eq!(info.resistance_max, 20);
        assert!((info.wheel_diameter_in - 21.0).abs() < f64::EPSILON);
        assert_eq!(info.mac_address, "AABBCCDDEEFF");

        bike.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_out_of_order_aborts_with_step() {
        let (port, _bike) = spawn_bike(|mut stream| async move {
            expect_frame(&mut stream, "<EQ_>").await;
            // Resistance range before password: must abort, not skip ahead
            stream.write_all(b"<EQ_OK><ER_1-20>").await.unwrap();
            // Hold the socket open so the client fails on content, not I/O
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        });

        let mut client = connected_client(port).await;
        let err = client.initialize().await.unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Malformed {
                step: HandshakeStep::Password,
                ..
            }
        ));
        assert_eq!(client.phase(), SessionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_handshake_rejects_garbled_init_ack() {
        let (port, _bike) = spawn_bike(|mut stream| async move {
            expect_frame(&mut stream, "<EQ_>").await;
            stream.write_all(b"<EQ_XX>").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        });

        let mut client = connected_client(port).await;
        let err = client.initialize().await.unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Malformed {
                step: HandshakeStep::InitAck,
                ..
            }
        ));
        assert_eq!(client.phase(), SessionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_handshake_rejects_degenerate_resistance_range() {
        // <ER_0-0> and <ER_5-2> describe ranges no level can be encoded
        // against; accepting either would leave set_level unusable
        for payload in ["0-0", "5-2"] {
            let banner = format!("<ER_{payload}>");
            let (port, _bike) = spawn_bike(move |mut stream| async move {
                expect_frame(&mut stream, "<EQ_>").await;
                stream.write_all(b"<EQ_OK><EP_SUPERWIGH>").await.unwrap();
                expect_frame(&mut stream, "<EP_OK>").await;
                stream.write_all(banner.as_bytes()).await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            });

            let mut client = connected_client(port).await;
            let err = client.initialize().await.unwrap_err();
            assert!(matches!(
                err,
                HandshakeError::Malformed {
                    step: HandshakeStep::ResistanceRange,
                    ..
                }
            ));
            assert_eq!(client.phase(), SessionPhase::Disconnected);
        }
    }

    #[tokio::test]
    async fn test_handshake_timeout_identifies_step() {
        let (port, _bike) = spawn_bike(|mut stream| async move {
            expect_frame(&mut stream, "<EQ_>").await;
            stream.write_all(b"<EQ_OK><EP_SUPERWIGH>").await.unwrap();
            expect_frame(&mut stream, "<EP_OK>").await;
            // Never send the resistance range
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        });

        let mut client = connected_client(port).await;
        let err = client.initialize().await.unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Timeout {
                step: HandshakeStep::ResistanceRange
            }
        ));
        assert_eq!(client.phase(), SessionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_wrong_password_is_non_fatal() {
        let (port, bike) = spawn_bike(|mut stream| async move {
            expect_frame(&mut stream, "<EQ_>").await;
            stream.write_all(b"<EQ_OK><EP_WRONGWIGH>").await.unwrap();
            expect_frame(&mut stream, "<EP_OK>").await;
            stream.write_all(b"<ER_1-20>").await.unwrap();
            expect_frame(&mut stream, "<ER_OK>").await;
            stream.write_all(b"<ED_2100>").await.unwrap();
            expect_frame(&mut stream, "<ED_OK>").await;
            stream.write_all(b"<EA_AABBCCDDEEFF>").await.unwrap();
            expect_frame(&mut stream, "<EA_OK>").await;
            stream.write_all(b"<Ez_1E>").await.unwrap();
            expect_frame(&mut stream, "<Ez_OK>").await;
            expect_frame(&mut stream, "<CP_300>").await;
        });

        let mut client = connected_client(port).await;
        client.initialize().await.unwrap();
        assert_eq!(client.phase(), SessionPhase::Idle);
        bike.await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_decodes_and_acks() {
        let (port, bike) = spawn_bike(|mut stream| async move {
            serve_handshake(&mut stream).await;
            expect_frame(&mut stream, "<WB_6>").await;
            stream
                .write_all(b"<W6_0,224,085,132,03,015630,178,00>")
                .await
                .unwrap();
            expect_frame(&mut stream, "<W6_OK>").await;
        });

        let mut client = connected_client(port).await;
        client.initialize().await.unwrap();

        let snap = client.poll().await.unwrap().unwrap();
        assert_eq!(snap.raw_distance, 224);
        assert_eq!(snap.rpm, 85);
        assert_eq!(snap.heart_rate_bpm, 132);
        assert_eq!(snap.level, 3);
        assert!((snap.calories_kcal - 156.30).abs() < f64::EPSILON);
        assert_eq!(snap.power_watts, 178);
        assert!((snap.speed_kmh - 85.0 * 55.0 * 0.004_785_36).abs() < f64::EPSILON);
        assert!((snap.distance_km - counts_to_km(224, 21.0)).abs() < f64::EPSILON);

        assert_eq!(client.snapshot().await, snap);
        bike.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_previous_snapshot() {
        let (port, bike) = spawn_bike(|mut stream| async move {
            serve_handshake(&mut stream).await;
            expect_frame(&mut stream, "<WB_6>").await;
            stream
                .write_all(b"<W6_0,224,085,132,03,015630,178,00>")
                .await
                .unwrap();
            expect_frame(&mut stream, "<W6_OK>").await;
            expect_frame(&mut stream, "<WB_6>").await;
            // Wrong field width: must be discarded without touching state
            stream.write_all(b"<W6_0,22,085,132,03>").await.unwrap();
        });

        let mut client = connected_client(port).await;
        client.initialize().await.unwrap();

        let first = client.poll().await.unwrap().unwrap();
        let second = client.poll().await.unwrap();
        assert!(second.is_none());
        assert_eq!(client.snapshot().await, first);
        assert_eq!(client.missed_responses(), 1);
        bike.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrap_around_across_polls() {
        let (port, bike) = spawn_bike(|mut stream| async move {
            serve_handshake(&mut stream).await;
            for raw in ["998", "999", "002", "005"] {
                expect_frame(&mut stream, "<WB_6>").await;
                let frame = format!("<W6_0,{raw},000,000,03,000000,000,00>");
                stream.write_all(frame.as_bytes()).await.unwrap();
                expect_frame(&mut stream, "<W6_OK>").await;
            }
        });

        let mut client = connected_client(port).await;
        client.initialize().await.unwrap();

        let mut last_km = 0.0;
        let mut wraps = Vec::new();
        for _ in 0..4 {
            let snap = client.poll().await.unwrap().unwrap();
            assert!(snap.distance_km >= last_km, "distance must not decrease");
            last_km = snap.distance_km;
            wraps.push(snap.wrap_count);
        }
        assert_eq!(wraps, vec![0, 0, 1, 1]);
        bike.await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_data_resets_distance_history() {
        let (port, bike) = spawn_bike(|mut stream| async move {
            serve_handshake(&mut stream).await;
            expect_frame(&mut stream, "<WB_6>").await;
            stream
                .write_all(b"<W6_0,998,000,000,03,000000,000,00>")
                .await
                .unwrap();
            expect_frame(&mut stream, "<W6_OK>").await;
            expect_frame(&mut stream, "<CC_>").await;
            expect_frame(&mut stream, "<WB_6>").await;
            stream
                .write_all(b"<W6_1,003,000,000,03,000000,000,00>")
                .await
                .unwrap();
            expect_frame(&mut stream, "<W6_OK>").await;
        });

        let mut client = connected_client(port).await;
        client.initialize().await.unwrap();

        client.poll().await.unwrap().unwrap();
        client.clear_data().await.unwrap();
        assert!((client.snapshot().await.distance_km).abs() < f64::EPSILON);

        // 3 < 998, but history was cleared: no wrap, distance from 3 counts
        let snap = client.poll().await.unwrap().unwrap();
        assert_eq!(snap.wrap_count, 0);
        assert!((snap.distance_km - counts_to_km(3, 21.0)).abs() < f64::EPSILON);
        bike.await.unwrap();
    }

    #[tokio::test]
    async fn test_liveness_saturation_is_fatal() {
        let (port, _bike) = spawn_bike(|mut stream| async move {
            serve_handshake(&mut stream).await;
            // Swallow every poll without answering
            let mut sink = vec![0u8; 256];
            while stream.read(&mut sink).await.unwrap_or(0) > 0 {}
        });

        let mut client = connected_client(port).await;
        client.initialize().await.unwrap();

        for i in 1..MAX_MISSED_RESPONSES {
            assert!(client.poll().await.unwrap().is_none());
            assert_eq!(client.missed_responses(), i);
        }

        let err = client.poll().await.unwrap_err();
        assert!(matches!(
            err,
            PollError::ConnectionLost {
                misses: MAX_MISSED_RESPONSES
            }
        ));
        assert_eq!(client.phase(), SessionPhase::Error);

        // Lost sessions never auto-resume
        let err = client.poll().await.unwrap_err();
        assert!(matches!(err, PollError::InvalidPhase { .. }));
    }

    #[tokio::test]
    async fn test_successful_parse_resets_miss_counter() {
        let (port, bike) = spawn_bike(|mut stream| async move {
            serve_handshake(&mut stream).await;
            // Ignore two polls, then answer the third
            expect_frame(&mut stream, "<WB_6>").await;
            expect_frame(&mut stream, "<WB_6>").await;
            expect_frame(&mut stream, "<WB_6>").await;
            stream
                .write_all(b"<W6_0,010,000,000,03,000000,000,00>")
                .await
                .unwrap();
            expect_frame(&mut stream, "<W6_OK>").await;
        });

        let mut client = connected_client(port).await;
        client.initialize().await.unwrap();

        assert!(client.poll().await.unwrap().is_none());
        assert!(client.poll().await.unwrap().is_none());
        assert_eq!(client.missed_responses(), 2);

        assert!(client.poll().await.unwrap().is_some());
        assert_eq!(client.missed_responses(), 0);
        bike.await.unwrap();
    }

    #[tokio::test]
    async fn test_set_level_clamps_and_encodes() {
        let (port, bike) = spawn_bike(|mut stream| async move {
            serve_handshake(&mut stream).await;
            expect_frame(&mut stream, "<CR_19>").await;
            stream.write_all(b"<CR_OK>").await.unwrap();
            expect_frame(&mut stream, "<CR_00>").await;
            stream.write_all(b"<CR_OK>").await.unwrap();
        });

        let mut client = connected_client(port).await;
        client.initialize().await.unwrap();

        client.set_level(25).await.unwrap();
        client.set_level(1).await.unwrap();

        let err = client.set_level(-2).await.unwrap_err();
        assert!(matches!(err, CommandError::LevelOutOfRange { .. }));
        bike.await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_illegal_when_disconnected() {
        let mut client = BikeClient::new();
        assert!(matches!(
            client.start_sport().await.unwrap_err(),
            CommandError::NotConnected { .. }
        ));
        assert!(matches!(
            client.poll().await.unwrap_err(),
            PollError::InvalidPhase { .. }
        ));
        assert!(matches!(
            client.initialize().await.unwrap_err(),
            HandshakeError::NotConnected
        ));
    }

    #[tokio::test]
    async fn test_start_and_pause_transition_phase() {
        let (port, bike) = spawn_bike(|mut stream| async move {
            serve_handshake(&mut stream).await;
            expect_frame(&mut stream, "<WB_6>").await;
            expect_frame(&mut stream, "<CP_000>").await;
            stream.write_all(b"<CP_OK>").await.unwrap();
            expect_frame(&mut stream, "<CP_300>").await;
            stream.write_all(b"<CP_OK>").await.unwrap();
            expect_frame(&mut stream, "<AT_>").await;
        });

        let mut client = connected_client(port).await;
        client.initialize().await.unwrap();

        client.start_sport().await.unwrap();
        assert_eq!(client.phase(), SessionPhase::Sporting);

        client.pause_sport().await.unwrap();
        assert_eq!(client.phase(), SessionPhase::Idle);

        client.disconnect().await;
        assert_eq!(client.phase(), SessionPhase::Disconnected);
        bike.await.unwrap();
    }
}
