//! # CAN Transport
//!
//! Raw CAN access for the charger's telemetry and command messages. Frames are
//! classic 8-byte data frames with 11-bit identifiers.
//!
//! [`CanTransport`] (Linux only) binds a SocketCAN raw socket and runs a blocking
//! receive loop on its own thread, handing every data frame to the registered
//! [`FrameHandler`]s. The command side only needs the [`CanBus`] trait, which
//! [`MemoryBus`] also implements for simulators and tests.
//!
//! ```rust,ignore
//! let transport = CanTransport::open(CanConfig::default().with_interface("can0"));
//! transport.on_frame(|frame| println!("{}", frame));
//! transport.start_receiving()?;
//! transport.send(0x191, &[0; 8])?;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
#[cfg(any(target_os = "linux", test))]
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{BusError, BusResult};

/// Payload size of a classic CAN data frame
pub const CAN_DATA_LEN: usize = 8;

/// Mask for 11-bit standard identifiers
pub const STANDARD_ID_MASK: u32 = 0x7FF;

/// A received or transmitted CAN frame
///
/// The payload is stored zero-padded to 8 bytes; `dlc` keeps the received length.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawFrame {
    id: u32,
    dlc: u8,
    data: [u8; CAN_DATA_LEN],
    timestamp: DateTime<Utc>,
}

impl RawFrame {
    /// Build a frame stamped with the current time; payload beyond 8 bytes is dropped
    pub fn new(id: u32, payload: &[u8]) -> Self {
        Self::with_timestamp(id, payload, Utc::now())
    }

    pub fn with_timestamp(id: u32, payload: &[u8], timestamp: DateTime<Utc>) -> Self {
        let len = payload.len().min(CAN_DATA_LEN);
        let mut data = [0u8; CAN_DATA_LEN];
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            id,
            dlc: len as u8,
            data,
            timestamp,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    /// Received bytes only
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// Full zero-padded data field
    pub fn data(&self) -> &[u8; CAN_DATA_LEN] {
        &self.data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl fmt::Display for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X} [{}]", self.id, self.dlc)?;
        for b in self.payload() {
            write!(f, " {:02X}", b)?;
        }
        Ok(())
    }
}

/// Callback invoked for every received data frame
pub type FrameHandler = Arc<dyn Fn(&RawFrame) + Send + Sync>;

/// Callback invoked when the link goes up (`true`) or down (`false`)
pub type LinkStateHandler = Arc<dyn Fn(bool) + Send + Sync>;

/// Outgoing side of a CAN link
pub trait CanBus: Send + Sync {
    /// Transmit one data frame; the id is masked to 11 bits and the payload
    /// zero-filled to 8 bytes
    fn send(&self, id: u32, data: &[u8]) -> BusResult<()>;

    /// Whether the link is bound and receiving
    fn is_connected(&self) -> bool;
}

/// Pad or truncate a payload to the 8-byte data field
pub fn pad_payload(data: &[u8]) -> [u8; CAN_DATA_LEN] {
    let mut padded = [0u8; CAN_DATA_LEN];
    let len = data.len().min(CAN_DATA_LEN);
    padded[..len].copy_from_slice(&data[..len]);
    padded
}

/// Frame counters of a CAN link
#[derive(Debug, Default)]
pub struct CanStats {
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    send_errors: AtomicU64,
    read_errors: AtomicU64,
}

/// Point-in-time copy of [`CanStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CanStatsSnapshot {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub send_errors: u64,
    pub read_errors: u64,
}

impl CanStats {
    pub fn snapshot(&self) -> CanStatsSnapshot {
        CanStatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }
}

/// In-memory CAN bus that records transmitted frames
///
/// The connected flag can be flipped to simulate a link loss.
#[derive(Debug)]
pub struct MemoryBus {
    connected: AtomicBool,
    sent: Mutex<Vec<RawFrame>>,
}

impl MemoryBus {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Frames sent so far, oldest first
    pub fn sent(&self) -> Vec<RawFrame> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl CanBus for MemoryBus {
    fn send(&self, id: u32, data: &[u8]) -> BusResult<()> {
        if !self.is_connected() {
            return Err(BusError::not_connected("memory CAN bus"));
        }
        let frame = RawFrame::new(id & STANDARD_ID_MASK, &pad_payload(data));
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(frame);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(target_os = "linux")]
pub use linux_impl::CanTransport;

/// Join a worker thread unless the caller is that worker
///
/// Returns `None` without waiting when called from the worker itself, which then
/// detaches and finishes on its own.
#[cfg(any(target_os = "linux", test))]
pub(crate) fn join_unless_current(handle: JoinHandle<()>) -> Option<std::thread::Result<()>> {
    if handle.thread().id() == std::thread::current().id() {
        return None;
    }
    Some(handle.join())
}

#[cfg(target_os = "linux")]
mod linux_impl {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, RwLock};

    use log::{debug, error, info, warn};
    use socketcan::{CanDataFrame, CanFrame, CanSocket, EmbeddedFrame, Frame, Id, Socket, StandardId};

    use super::*;
    use crate::config::CanConfig;
    use crate::logging::{BusKind, PacketDirection, PacketLogger};

    /// SocketCAN raw socket with a background receive thread
    pub struct CanTransport {
        config: CanConfig,
        socket: RwLock<Option<Arc<CanSocket>>>,
        connected: Arc<AtomicBool>,
        frame_handlers: Arc<RwLock<Vec<FrameHandler>>>,
        link_handlers: Arc<RwLock<Vec<LinkStateHandler>>>,
        receiver: Mutex<Option<Receiver>>,
        stats: Arc<CanStats>,
        logger: PacketLogger,
    }

    /// A receive thread and its own stop flag
    struct Receiver {
        handle: JoinHandle<()>,
        running: Arc<AtomicBool>,
    }

    impl CanTransport {
        /// Bind to the configured interface
        ///
        /// A bind failure is logged and leaves the transport disconnected; call
        /// [`CanTransport::reconnect`] to try again.
        pub fn open(config: CanConfig) -> Self {
            let logger = PacketLogger::new(BusKind::Can, config.interface.clone())
                .with_enabled(config.packet_logging);
            let transport = Self {
                config,
                socket: RwLock::new(None),
                connected: Arc::new(AtomicBool::new(false)),
                frame_handlers: Arc::new(RwLock::new(Vec::new())),
                link_handlers: Arc::new(RwLock::new(Vec::new())),
                receiver: Mutex::new(None),
                stats: Arc::new(CanStats::default()),
                logger,
            };
            transport.bind();
            transport
        }

        pub fn interface(&self) -> &str {
            &self.config.interface
        }

        /// Enable or disable hex tracing; also reaches a running receive thread
        pub fn set_packet_logging(&self, enabled: bool) {
            self.logger.set_enabled(enabled);
        }

        fn bind(&self) -> bool {
            let result = CanSocket::open(&self.config.interface);
            let mut slot = self.socket.write().unwrap_or_else(|e| e.into_inner());
            match result {
                Ok(socket) => {
                    if let Err(e) = socket.set_read_timeout(self.config.read_timeout()) {
                        warn!("[{}] could not set read timeout: {}", self.logger.tag(), e);
                    }
                    *slot = Some(Arc::new(socket));
                    drop(slot);
                    info!("[{}] bound", self.logger.tag());
                    set_link_state(&self.connected, &self.link_handlers, true);
                    true
                }
                Err(e) => {
                    *slot = None;
                    drop(slot);
                    error!("[{}] bind failed: {}", self.logger.tag(), e);
                    set_link_state(&self.connected, &self.link_handlers, false);
                    false
                }
            }
        }

        /// Register a handler for received data frames
        pub fn on_frame<F>(&self, handler: F)
        where
            F: Fn(&RawFrame) + Send + Sync + 'static,
        {
            self.frame_handlers
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .push(Arc::new(handler));
        }

        /// Register a handler for link up/down transitions
        pub fn on_link_state<F>(&self, handler: F)
        where
            F: Fn(bool) + Send + Sync + 'static,
        {
            self.link_handlers
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .push(Arc::new(handler));
        }

        /// Start the receive thread; a no-op if it is already running
        pub fn start_receiving(&self) -> BusResult<()> {
            let socket = self
                .socket
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .ok_or_else(|| BusError::not_connected(self.config.interface.clone()))?;

            let mut receiver = self.receiver.lock().unwrap_or_else(|e| e.into_inner());
            if receiver.as_ref().is_some_and(|r| r.running.load(Ordering::SeqCst)) {
                return Ok(());
            }

            let running = Arc::new(AtomicBool::new(true));
            let ctx = ReceiveContext {
                socket,
                running: running.clone(),
                connected: self.connected.clone(),
                frame_handlers: self.frame_handlers.clone(),
                link_handlers: self.link_handlers.clone(),
                stats: self.stats.clone(),
                logger: self.logger.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("can-rx-{}", self.config.interface))
                .spawn(move || ctx.run())
                .map_err(|e| BusError::internal(format!("Cannot spawn CAN receive thread: {}", e)))?;
            *receiver = Some(Receiver { handle, running });
            Ok(())
        }

        /// Stop the receive thread and wait for it
        ///
        /// Returns within one socket read timeout. Frame and link handlers may call
        /// this (or [`CanTransport::reconnect`]) themselves: the receive thread is
        /// then only told to stop and exits once the handler returns.
        pub fn shutdown(&self) {
            let receiver = self.receiver.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(receiver) = receiver {
                receiver.running.store(false, Ordering::SeqCst);
                match join_unless_current(receiver.handle) {
                    Some(Ok(())) => {}
                    Some(Err(_)) => error!("[{}] receive thread panicked", self.logger.tag()),
                    None => debug!("[{}] stop requested from the receive thread", self.logger.tag()),
                }
            }
        }

        /// Stop, rebind and restart receiving
        pub fn reconnect(&self) -> bool {
            self.shutdown();
            self.bind() && self.start_receiving().is_ok()
        }

        pub fn stats(&self) -> CanStatsSnapshot {
            self.stats.snapshot()
        }
    }

    impl CanBus for CanTransport {
        fn send(&self, id: u32, data: &[u8]) -> BusResult<()> {
            let socket = self
                .socket
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .ok_or_else(|| BusError::not_connected(self.config.interface.clone()))?;

            let id = id & STANDARD_ID_MASK;
            let payload = pad_payload(data);
            let standard_id = StandardId::new(id as u16)
                .ok_or_else(|| BusError::invalid_data(format!("Invalid standard ID: 0x{:03X}", id)))?;
            let frame = CanDataFrame::new(Id::Standard(standard_id), &payload)
                .ok_or_else(|| BusError::internal("Failed to build CAN data frame"))?;

            match socket.write_frame(&frame) {
                Ok(()) => {
                    self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                    self.logger.frame(PacketDirection::Tx, id, &payload);
                    Ok(())
                }
                Err(e) => {
                    self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("[{}] send {:03X} failed: {}", self.logger.tag(), id, e);
                    Err(BusError::io(format!("CAN send failed: {}", e)))
                }
            }
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    impl Drop for CanTransport {
        fn drop(&mut self) {
            self.shutdown();
        }
    }

    fn set_link_state(connected: &AtomicBool, handlers: &RwLock<Vec<LinkStateHandler>>, up: bool) {
        if connected.swap(up, Ordering::SeqCst) != up {
            for handler in handlers.read().unwrap_or_else(|e| e.into_inner()).iter() {
                handler(up);
            }
        }
    }

    struct ReceiveContext {
        socket: Arc<CanSocket>,
        running: Arc<AtomicBool>,
        connected: Arc<AtomicBool>,
        frame_handlers: Arc<RwLock<Vec<FrameHandler>>>,
        link_handlers: Arc<RwLock<Vec<LinkStateHandler>>>,
        stats: Arc<CanStats>,
        logger: PacketLogger,
    }

    impl ReceiveContext {
        fn run(self) {
            info!("[{}] receive loop started", self.logger.tag());
            while self.running.load(Ordering::Relaxed) {
                match self.socket.read_frame() {
                    Ok(CanFrame::Data(f)) => {
                        let id = if f.is_extended() {
                            f.raw_id() & 0x1FFF_FFFF
                        } else {
                            f.raw_id() & STANDARD_ID_MASK
                        };
                        let frame = RawFrame::new(id, f.data());
                        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                        self.logger.frame(PacketDirection::Rx, id, frame.payload());
                        for handler in self.frame_handlers.read().unwrap_or_else(|e| e.into_inner()).iter() {
                            handler(&frame);
                        }
                    }
                    // remote and error frames carry no telemetry
                    Ok(_) => {}
                    Err(ref e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
                        error!("[{}] read error: {}", self.logger.tag(), e);
                        break;
                    }
                }
            }
            self.running.store(false, Ordering::SeqCst);
            set_link_state(&self.connected, &self.link_handlers, false);
            info!("[{}] receive loop stopped", self.logger.tag());
        }
    }
}
