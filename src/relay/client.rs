//! Connection manager for the KC868 relay controller.
//!
//! Owns the TCP connection and everything that runs on it: the frame reader,
//! the keep-alive and rescan timers, the relay read-out that follows a scan
//! reply, and command intake from the router. A supervisor loop re-establishes
//! the connection with exponential backoff when it drops.

use super::codec::{self, Command, Frame, FrameError, Report};
use super::reconnect::Backoff;
use crate::config::DeviceConfig;
use crate::error::{BridgeError, Result};
use crate::event::Event;
use crate::router::SwitchSink;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;

pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);
pub const RESCAN_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Wait between `RELAY-TEST-NOW` and `RELAY-SCAN_DEVICE-NOW`.
pub const SCAN_SETTLE_TIME: Duration = Duration::from_secs(3);
/// The controller drops commands that arrive closer together than this.
pub const READ_SPACING: Duration = Duration::from_millis(500);
/// Commands carry no terminator; the controller splits them on idle time.
pub const COMMAND_GAP: Duration = READ_SPACING;
/// A write that cannot complete within this ends the session.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection state of the device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Write half of the device connection.
pub type DeviceWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of one session.
struct DeviceLink {
    writer: DeviceWriter,
    session: CancellationToken,
    last_sent: Option<Instant>,
}

impl DeviceLink {
    /// Write one command, at least [`COMMAND_GAP`] after the previous one.
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if let Some(last) = self.last_sent {
            tokio::time::sleep_until(last + COMMAND_GAP).await;
        }

        let writer = &mut self.writer;
        tokio::time::timeout(WRITE_TIMEOUT, async {
            writer.write_all(bytes).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))??;

        self.last_sent = Some(Instant::now());
        Ok(())
    }
}

pub struct RelayClient {
    config: DeviceConfig,
    events: mpsc::Sender<Event>,
    backoff: Backoff,
    state: RwLock<SessionState>,
    /// Discovered from the last SCAN_DEVICE reply, 0 until then.
    relay_count: AtomicU32,
    /// Present while a session is attached; every outbound command goes through it.
    link: AsyncMutex<Option<DeviceLink>>,
    /// Held for the duration of a relay read-out.
    readout: AsyncMutex<()>,
}

impl RelayClient {
    pub fn new(config: DeviceConfig, events: mpsc::Sender<Event>) -> Self {
        Self {
            config,
            events,
            backoff: Backoff::default(),
            state: RwLock::new(SessionState::Disconnected),
            relay_count: AtomicU32::new(0),
            link: AsyncMutex::new(None),
            readout: AsyncMutex::new(()),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn relay_count(&self) -> u32 {
        self.relay_count.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    /// Keep a connection to the controller until `cancel` fires.
    ///
    /// Each established connection runs a full session (see [`Self::run_session`]);
    /// failed or dropped connections are retried after a backoff delay.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut attempt: u32 = 0;

        while !cancel.is_cancelled() {
            self.set_state(SessionState::Connecting);
            info!(
                "[KC868] Connecting to {} at {}:{}",
                self.config.name, self.config.host, self.config.port
            );

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connect() => result,
            };

            match connected {
                Ok(stream) => {
                    info!(
                        "[KC868] Connected to {} host {} port {}",
                        self.config.name, self.config.host, self.config.port
                    );
                    attempt = 0;
                    self.run_session(stream, &cancel).await;
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!("[KC868] Lost connection to {}", self.config.name);
                }
                Err(e) => {
                    error!(
                        "[KC868] Cannot connect to {}:{} --> {}",
                        self.config.host, self.config.port, e
                    );
                }
            }

            self.set_state(SessionState::Disconnected);
            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            info!(
                "[KC868] Reconnecting to {} in {:.1}s",
                self.config.name,
                delay.as_secs_f64()
            );
            if !pause(delay, &cancel).await {
                break;
            }
        }

        self.set_state(SessionState::Disconnected);
        info!("[KC868] Connection manager for {} stopped", self.config.name);
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = (self.config.host.as_str(), self.config.port);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection attempt timed out"))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Drive one connected session until the stream closes, a write fails or
    /// `cancel` fires.
    ///
    /// Starts the keep-alive and rescan loops, runs the initial
    /// test/settle/scan discovery and reads frames until end-of-stream.
    pub async fn run_session<S>(self: &Arc<Self>, stream: S, cancel: &CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let session = cancel.child_token();
        self.attach(Box::new(write_half), session.clone()).await;

        let keep_alive = tokio::spawn(self.clone().keep_alive_loop(session.clone()));
        let rescan = tokio::spawn(self.clone().rescan_loop(session.clone()));

        let reading = async {
            self.read_loop(read_half, &session).await;
            session.cancel();
        };
        tokio::join!(reading, self.discover(&session));

        let _ = tokio::join!(keep_alive, rescan);
        self.detach().await;
    }

    pub(crate) async fn attach(&self, writer: DeviceWriter, session: CancellationToken) {
        *self.link.lock().await = Some(DeviceLink {
            writer,
            session,
            last_sent: None,
        });
        self.set_state(SessionState::Connected);
    }

    async fn detach(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.session.cancel();
        }
        self.set_state(SessionState::Disconnected);
    }

    async fn read_loop<R>(self: &Arc<Self>, reader: R, session: &CancellationToken)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut frame = Vec::with_capacity(64);

        loop {
            frame.clear();
            let read = tokio::select! {
                _ = session.cancelled() => break,
                read = reader.read_until(codec::FRAME_TERMINATOR, &mut frame) => read,
            };

            match read {
                Ok(0) => {
                    warn!("[KC868] {} closed the connection", self.config.name);
                    break;
                }
                Ok(_) => self.handle_frame(&frame, session).await,
                Err(e) => {
                    error!("[KC868] Read from {} failed --> {}", self.config.name, e);
                    break;
                }
            }
        }
    }

    async fn handle_frame(self: &Arc<Self>, raw: &[u8], session: &CancellationToken) {
        debug!(
            "[KC868] Response from {} -> {}",
            self.config.name,
            String::from_utf8_lossy(raw).trim_end_matches('\0')
        );

        match codec::decode(raw) {
            Ok(Frame {
                origin,
                report: Report::Scan { relay_count },
            }) => {
                info!(
                    "[KC868] {} reports {} relays ({:?} frame)",
                    self.config.name, relay_count, origin
                );
                self.relay_count.store(relay_count, Ordering::SeqCst);
                tokio::spawn(self.clone().read_relays(relay_count, session.clone()));
            }
            Ok(Frame {
                report: Report::State { switch_id, on },
                ..
            }) => {
                if self.events.send(Event::device(switch_id, on)).await.is_err() {
                    error!("[KC868] Event channel closed, dropping relay state");
                }
            }
            Err(FrameError::Empty) => debug!("[KC868] Ignoring empty frame"),
            Err(e) => warn!(
                "[KC868] Wrong response format from {} -> {}",
                self.config.name, e
            ),
        }
    }

    /// Request the state of relays `1..=count`, one every [`READ_SPACING`].
    async fn read_relays(self: Arc<Self>, count: u32, session: CancellationToken) {
        let _readout = tokio::select! {
            _ = session.cancelled() => return,
            guard = self.readout.lock() => guard,
        };

        for relay in 1..=count {
            if let Err(e) = self.send(&Command::Read { relay }).await {
                warn!("[KC868] Relay read-out aborted at relay {}: {}", relay, e);
                return;
            }
            if !pause(READ_SPACING, &session).await {
                return;
            }
        }
        debug!("[KC868] Requested state of {} relays", count);
    }

    /// Wake the controller, let it settle, then ask for its relay count.
    async fn discover(&self, session: &CancellationToken) {
        if let Err(e) = self.send(&Command::Test).await {
            warn!("[KC868] Device scan not started: {}", e);
            return;
        }
        if !pause(SCAN_SETTLE_TIME, session).await {
            return;
        }
        if let Err(e) = self.send(&Command::ScanDevice).await {
            warn!("[KC868] Device scan request failed: {}", e);
        }
    }

    async fn keep_alive_loop(self: Arc<Self>, session: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + KEEP_ALIVE_INTERVAL, KEEP_ALIVE_INTERVAL);
        loop {
            tokio::select! {
                _ = session.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.send(&Command::Ping).await {
                warn!("[KC868] Keep-alive to {} failed: {}", self.config.name, e);
            }
        }
    }

    async fn rescan_loop(self: Arc<Self>, session: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + RESCAN_INTERVAL, RESCAN_INTERVAL);
        loop {
            tokio::select! {
                _ = session.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.discover(&session).await;
        }
    }

    /// Switch one relay. Commands are never queued: without a connection
    /// this fails with [`BridgeError::DeviceNotConnected`].
    pub async fn change(&self, switch_id: &str, on: bool) -> Result<()> {
        info!(
            "[KC868] Change {} relay {} state to {}",
            self.config.name, switch_id, on
        );
        self.send(&Command::set(switch_id, on)).await
    }

    async fn send(&self, command: &Command) -> Result<()> {
        debug!("[KC868] Send command to {} -> {}", self.config.name, command);

        let mut guard = self.link.lock().await;
        let Some(link) = guard.as_mut() else {
            return Err(BridgeError::DeviceNotConnected);
        };

        let session = link.session.clone();
        let bytes = command.encode();
        let written = tokio::select! {
            _ = session.cancelled() => return Err(BridgeError::DeviceNotConnected),
            written = link.write(&bytes) => written,
        };

        if let Err(e) = written {
            error!("[KC868] Write to {} failed --> {}", self.config.name, e);
            *guard = None;
            session.cancel();
            self.set_state(SessionState::Disconnected);
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl SwitchSink for RelayClient {
    async fn apply(&self, switch_id: &str, on: bool) {
        if let Err(e) = self.change(switch_id, on).await {
            warn!("[KC868] Dropping command for relay {}: {}", switch_id, e);
        }
    }
}

/// Sleep for `duration`; false if `cancel` fired first.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
