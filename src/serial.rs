//! # Serial Transport
//!
//! Owns one half-duplex RS-485 link. Every transaction runs under the link's async
//! lock, so a BMU request/response pair or a Modbus exchange can never interleave
//! with another caller on the same wire.
//!
//! ## Reconnection
//!
//! The port is opened lazily by [`SerialTransport::ensure_connected`]. A failed open
//! faults the link and doubles the retry delay (1 s up to 30 s, see
//! [`LinkHealth`]); attempts inside the delay return immediately without touching
//! the device. Any I/O error or timeout during a transaction also faults the link,
//! and the next transaction reopens the port.
//!
//! ## Sessions
//!
//! [`SerialTransport::session`] returns a [`SerialSession`] holding the lock. It
//! exposes the primitive operations a protocol engine needs:
//!
//! ```rust,ignore
//! let mut session = transport.session().await?;
//! session.discard_buffers()?;
//! session.write_all(&request).await?;
//! tokio::time::sleep(Duration::from_millis(50)).await;
//! let n = session.read_available(&mut buf, Duration::from_millis(20)).await?;
//! ```
//!
//! Port opening goes through the [`PortOpener`] trait. [`SystemPortOpener`] opens a
//! real device with `tokio-serial`; [`MemoryPortOpener`] hands out in-memory
//! streams for simulators and tests.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{timeout, Instant};

use crate::config::SerialConfig;
use crate::error::{BusError, BusResult};
use crate::link::LinkHealth;
use crate::logging::{BusKind, PacketDirection, PacketLogger};

/// Byte stream usable as a serial link
pub trait SerialLink: AsyncRead + AsyncWrite + Unpin + Send {
    /// Drop anything pending in the driver's input and output buffers
    fn discard_buffers(&mut self) -> io::Result<()>;
}

impl SerialLink for tokio_serial::SerialStream {
    fn discard_buffers(&mut self) -> io::Result<()> {
        use tokio_serial::{ClearBuffer, SerialPort};
        self.clear(ClearBuffer::All).map_err(io::Error::from)
    }
}

/// In-memory link; there is no driver buffer to discard
impl SerialLink for DuplexStream {
    fn discard_buffers(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Opens the physical port for a [`SerialTransport`]
pub trait PortOpener: Send + Sync + 'static {
    type Link: SerialLink + 'static;

    fn open(&self, config: &SerialConfig) -> BusResult<Self::Link>;
}

/// Opens real serial devices through `tokio-serial`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPortOpener;

impl PortOpener for SystemPortOpener {
    type Link = tokio_serial::SerialStream;

    fn open(&self, config: &SerialConfig) -> BusResult<Self::Link> {
        let builder = tokio_serial::new(&config.port_name, config.baud_rate)
            .data_bits(config.tokio_data_bits()?)
            .stop_bits(config.stop_bits.into())
            .parity(config.parity.into())
            .timeout(config.read_timeout());

        tokio_serial::SerialStream::open(&builder).map_err(|e| {
            BusError::connection(format!("Failed to open serial port {}: {}", config.port_name, e))
        })
    }
}

/// Hands out queued in-memory streams, one per successful open
///
/// Opening with an empty queue fails like a missing device.
#[derive(Debug, Default)]
pub struct MemoryPortOpener {
    links: StdMutex<VecDeque<DuplexStream>>,
    attempts: AtomicUsize,
}

impl MemoryPortOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fresh link and return the device end of it
    pub fn attach(&self, buffer: usize) -> DuplexStream {
        let (host, device) = tokio::io::duplex(buffer);
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(host);
        device
    }

    /// Number of open attempts so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }
}

impl PortOpener for MemoryPortOpener {
    type Link = DuplexStream;

    fn open(&self, config: &SerialConfig) -> BusResult<Self::Link> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| BusError::connection(format!("No device attached to {}", config.port_name)))
    }
}

/// Transport statistics for monitoring
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reconnects: u64,
}

struct LinkState<L> {
    port: Option<L>,
    health: LinkHealth,
    stats: TransportStats,
}

/// Exclusive owner of one serial link
pub struct SerialTransport<O: PortOpener = SystemPortOpener> {
    config: SerialConfig,
    opener: O,
    logger: PacketLogger,
    state: Mutex<LinkState<O::Link>>,
}

impl SerialTransport<SystemPortOpener> {
    /// Transport over a real serial device; the port opens on first use
    pub fn new(config: SerialConfig, bus: BusKind) -> Self {
        Self::with_opener(config, bus, SystemPortOpener)
    }
}

impl<O: PortOpener> SerialTransport<O> {
    pub fn with_opener(config: SerialConfig, bus: BusKind, opener: O) -> Self {
        let logger = PacketLogger::new(bus, config.port_name.clone()).with_enabled(config.packet_logging);
        Self {
            config,
            opener,
            logger,
            state: Mutex::new(LinkState {
                port: None,
                health: LinkHealth::new(),
                stats: TransportStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    pub fn opener(&self) -> &O {
        &self.opener
    }

    /// Enable or disable hex tracing of every packet
    pub fn set_packet_logging(&self, enabled: bool) {
        self.logger.set_enabled(enabled);
    }

    /// Open the port if it is closed or faulted and the backoff allows it
    ///
    /// Returns whether the link is usable afterwards.
    pub async fn ensure_connected(&self) -> bool {
        let mut state = self.state.lock().await;
        self.connect_locked(&mut state)
    }

    fn connect_locked(&self, state: &mut LinkState<O::Link>) -> bool {
        if state.health.is_healthy() && state.port.is_some() {
            return true;
        }
        let now = Instant::now();
        if !state.health.should_attempt(now) {
            return false;
        }

        state.health.begin_attempt(now);
        state.port = None;
        match self.opener.open(&self.config) {
            Ok(port) => {
                state.port = Some(port);
                state.health.record_success();
                state.stats.reconnects += 1;
                info!("[{}] port opened at {} baud", self.logger.tag(), self.config.baud_rate);
                true
            }
            Err(e) => {
                state.health.record_failure();
                warn!(
                    "[{}] open failed: {} (next retry in {:?})",
                    self.logger.tag(),
                    e,
                    state.health.retry_delay()
                );
                false
            }
        }
    }

    /// Whether the port is open and not faulted
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.health.is_healthy()
    }

    pub async fn health(&self) -> LinkHealth {
        self.state.lock().await.health.clone()
    }

    pub async fn stats(&self) -> TransportStats {
        self.state.lock().await.stats.clone()
    }

    /// Fault the link from outside a session (e.g. stale data)
    pub async fn mark_faulted(&self) {
        let mut state = self.state.lock().await;
        state.health.mark_faulted();
        warn!("[{}] link marked faulted", self.logger.tag());
    }

    /// Close the port, forget the backoff and reopen immediately
    pub async fn force_reconnect(&self) -> bool {
        let mut state = self.state.lock().await;
        state.port = None;
        state.health.reset();
        info!("[{}] forced reconnect", self.logger.tag());
        self.connect_locked(&mut state)
    }

    /// Close the port; the next transaction reopens it
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.port = None;
        state.health.reset();
        debug!("[{}] port closed", self.logger.tag());
    }

    /// Lock the link for a multi-step transaction
    ///
    /// Fails with `NotConnected` when the port is faulted and the backoff has not
    /// elapsed.
    pub async fn session(&self) -> BusResult<SerialSession<'_, O::Link>> {
        let mut state = self.state.lock().await;
        if !self.connect_locked(&mut state) {
            return Err(BusError::not_connected(self.config.port_name.clone()));
        }
        Ok(SerialSession {
            state,
            config: &self.config,
            logger: &self.logger,
        })
    }

    /// Discard stale input, write `request` and read exactly `expected_len` bytes
    pub async fn send_and_receive(&self, request: &[u8], expected_len: usize) -> BusResult<Vec<u8>> {
        let mut session = self.session().await?;
        session.discard_buffers()?;
        session.write_all(request).await?;
        let response = session.read_exact_len(expected_len).await?;
        session.record_response();
        Ok(response)
    }
}

/// Locked access to an open serial link
///
/// Errors raised through a session fault the link before they are returned.
pub struct SerialSession<'a, L: SerialLink> {
    state: MutexGuard<'a, LinkState<L>>,
    config: &'a SerialConfig,
    logger: &'a PacketLogger,
}

impl<'a, L: SerialLink> SerialSession<'a, L> {
    fn fault(&mut self, err: BusError) -> BusError {
        self.state.health.mark_faulted();
        self.state.stats.errors += 1;
        if matches!(err, BusError::Timeout { .. }) {
            self.state.stats.timeouts += 1;
        }
        warn!("[{}] {}", self.logger.tag(), err);
        err
    }

    fn port(&mut self) -> BusResult<&mut L> {
        let name = &self.config.port_name;
        self.state
            .port
            .as_mut()
            .ok_or_else(|| BusError::not_connected(name.clone()))
    }

    pub fn logger(&self) -> &PacketLogger {
        self.logger
    }

    /// Clear driver buffers before a new request
    pub fn discard_buffers(&mut self) -> BusResult<()> {
        let result = self.port()?.discard_buffers();
        result.map_err(|e| self.fault(e.into()))
    }

    /// Write and flush `data` within the write timeout
    pub async fn write_all(&mut self, data: &[u8]) -> BusResult<()> {
        let write_timeout = self.config.write_timeout();
        self.logger.packet(PacketDirection::Tx, data);

        let port = self.port()?;
        let result = timeout(write_timeout, async {
            port.write_all(data).await?;
            port.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => {
                self.state.stats.requests_sent += 1;
                self.state.stats.bytes_sent += data.len() as u64;
                Ok(())
            }
            Ok(Err(e)) => Err(self.fault(e.into())),
            Err(_) => Err(self.fault(BusError::timeout("serial write", write_timeout.as_millis() as u64))),
        }
    }

    /// Read whatever arrives within `wait`
    ///
    /// Returns `Ok(0)` when nothing arrived; silence is not an error here.
    pub async fn read_available(&mut self, buf: &mut [u8], wait: Duration) -> BusResult<usize> {
        let port = self.port()?;
        match timeout(wait, port.read(buf)).await {
            Err(_) => Ok(0),
            Ok(Ok(n)) => {
                if n > 0 {
                    self.state.stats.bytes_received += n as u64;
                    self.logger.packet(PacketDirection::Rx, &buf[..n]);
                }
                Ok(n)
            }
            Ok(Err(e)) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => Ok(0),
            Ok(Err(e)) => Err(self.fault(e.into())),
        }
    }

    /// Fill `buf` completely; each read waits at most the configured read timeout
    pub async fn read_into(&mut self, buf: &mut [u8]) -> BusResult<()> {
        let read_timeout = self.config.read_timeout();
        let mut filled = 0;
        while filled < buf.len() {
            let port = self.port()?;
            match timeout(read_timeout, port.read(&mut buf[filled..])).await {
                Ok(Ok(0)) => return Err(self.fault(BusError::io("serial stream closed"))),
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(self.fault(e.into())),
                Err(_) => {
                    let err = BusError::timeout(
                        format!("serial read ({} of {} bytes)", filled, buf.len()),
                        read_timeout.as_millis() as u64,
                    );
                    return Err(self.fault(err));
                }
            }
        }
        self.state.stats.bytes_received += buf.len() as u64;
        self.logger.packet(PacketDirection::Rx, buf);
        Ok(())
    }

    /// Read exactly `len` bytes
    pub async fn read_exact_len(&mut self, len: usize) -> BusResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(&mut buf).await?;
        Ok(buf)
    }

    /// Count a completed request/response exchange
    pub fn record_response(&mut self) {
        self.state.stats.responses_received += 1;
    }

    /// Fault the link for a protocol-level failure
    pub fn mark_faulted(&mut self, err: BusError) -> BusError {
        self.fault(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SerialConfig {
        SerialConfig::default()
            .with_port("sim0")
            .with_timeouts(200, 200)
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_backoff_sequence() {
        let transport =
            SerialTransport::with_opener(test_config(), BusKind::Bmu, MemoryPortOpener::new());

        assert!(!transport.ensure_connected().await);
        assert_eq!(transport.opener().attempts(), 1);

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(!transport.ensure_connected().await);
        assert_eq!(transport.opener().attempts(), 1);

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(!transport.ensure_connected().await);
        assert_eq!(transport.opener().attempts(), 2);
        assert_eq!(transport.health().await.retry_delay(), Duration::from_millis(4000));

        let _device = transport.opener().attach(64);
        tokio::time::advance(Duration::from_millis(3999)).await;
        assert!(!transport.ensure_connected().await);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(transport.ensure_connected().await);
        assert_eq!(transport.opener().attempts(), 3);
        assert_eq!(transport.health().await.retry_delay(), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let transport =
            SerialTransport::with_opener(test_config(), BusKind::Modbus, MemoryPortOpener::new());
        let mut device = transport.opener().attach(64);

        let responder = tokio::spawn(async move {
            let mut request = [0u8; 3];
            device.read_exact(&mut request).await.expect("request");
            device.write_all(&[0x10, 0x20, 0x30, 0x40]).await.expect("response");
            request
        });

        let response = transport
            .send_and_receive(&[0x01, 0x02, 0x03], 4)
            .await
            .expect("exchange");
        assert_eq!(response, vec![0x10, 0x20, 0x30, 0x40]);
        assert_eq!(responder.await.expect("join"), [0x01, 0x02, 0x03]);

        let stats = transport.stats().await;
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.responses_received, 1);
        assert_eq!(stats.bytes_sent, 3);
        assert_eq!(stats.bytes_received, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_faults_link() {
        let transport =
            SerialTransport::with_opener(test_config(), BusKind::Modbus, MemoryPortOpener::new());
        let _silent = transport.opener().attach(64);

        let err = transport
            .send_and_receive(&[0x01], 2)
            .await
            .expect_err("device never answers");
        assert!(matches!(err, BusError::Timeout { .. }));
        assert!(!transport.is_connected().await);
        assert_eq!(transport.stats().await.timeouts, 1);

        // no second device queued, so the reopen fails
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(transport.session().await.is_err());
        assert_eq!(transport.opener().attempts(), 2);
    }

    #[tokio::test]
    async fn test_force_reconnect_skips_backoff() {
        let transport =
            SerialTransport::with_opener(test_config(), BusKind::Bmu, MemoryPortOpener::new());
        assert!(!transport.ensure_connected().await);
        assert!(!transport.ensure_connected().await);
        assert_eq!(transport.opener().attempts(), 1);

        let _device = transport.opener().attach(16);
        assert!(transport.force_reconnect().await);
        assert_eq!(transport.opener().attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_available_returns_zero_on_silence() {
        let transport =
            SerialTransport::with_opener(test_config(), BusKind::Bmu, MemoryPortOpener::new());
        let mut device = transport.opener().attach(64);

        let mut session = transport.session().await.expect("open");
        let mut buf = [0u8; 16];
        let n = session
            .read_available(&mut buf, Duration::from_millis(20))
            .await
            .expect("silence is fine");
        assert_eq!(n, 0);

        device.write_all(&[0xAF, 0xFA]).await.expect("write");
        let n = session
            .read_available(&mut buf, Duration::from_millis(20))
            .await
            .expect("data");
        assert_eq!(&buf[..n], &[0xAF, 0xFA]);
    }
}
