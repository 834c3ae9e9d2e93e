//! Packet tracing for the serial and CAN links
//!
//! Raw traffic is emitted through `tracing` under a per-link tag, for example
//! `[BMU-/dev/ttyUSB0] TX AF FA 60 05 ...`. Without a `tracing` subscriber the
//! events are forwarded to the `log` facade, so `env_logger` prints them. Tracing
//! is off per link unless enabled, because at a 100 ms command period the CAN link
//! alone produces ten lines a second.
//!
//! Clones of a [`PacketLogger`] share one switch, so the CAN receive thread follows
//! a toggle made after it started.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::utils::format::bytes_to_hex;

/// Direction of a logged packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx,
    Rx,
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => f.write_str("TX"),
            PacketDirection::Rx => f.write_str("RX"),
        }
    }
}

/// Which field bus a packet belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Bmu,
    Modbus,
    Can,
}

impl BusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusKind::Bmu => "BMU",
            BusKind::Modbus => "MODBUS",
            BusKind::Can => "CAN",
        }
    }
}

/// Per-link packet tracer
#[derive(Debug, Clone)]
pub struct PacketLogger {
    bus: BusKind,
    link: String,
    enabled: Arc<AtomicBool>,
}

impl PacketLogger {
    pub fn new<S: Into<String>>(bus: BusKind, link: S) -> Self {
        Self {
            bus,
            link: link.into(),
            enabled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_enabled(self, enabled: bool) -> Self {
        self.set_enabled(enabled);
        self
    }

    /// Switch tracing for this logger and every clone of it
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Link label, e.g. `BMU-/dev/ttyUSB0`
    pub fn tag(&self) -> String {
        format!("{}-{}", self.bus.as_str(), self.link)
    }

    /// Trace a serial packet
    pub fn packet(&self, direction: PacketDirection, data: &[u8]) {
        if self.is_enabled() {
            info!("[{}] {} {}", self.tag(), direction, bytes_to_hex(data));
        }
    }

    /// Trace a CAN frame with its identifier
    pub fn frame(&self, direction: PacketDirection, id: u32, data: &[u8]) {
        if self.is_enabled() {
            info!("[{}] {} id:{:03X} {}", self.tag(), direction, id, bytes_to_hex(data));
        }
    }

    /// Trace bytes dropped while resynchronising a stream
    pub fn discarded(&self, data: &[u8]) {
        if self.is_enabled() && !data.is_empty() {
            debug!("[{}] discarded {} bytes: {}", self.tag(), data.len(), bytes_to_hex(data));
        }
    }
}
