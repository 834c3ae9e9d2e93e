//! # Voltage Chargebus - Field-bus layer for wireless EV chargers
//!
//! Async Rust implementation of the three buses found on a wireless charging
//! station: the charger's CAN telemetry and control link, the battery monitor's
//! framed serial protocol, and a Modbus RTU remote-control handset.
//!
//! ## Features
//!
//! - **CAN telemetry**: table-driven decoding of the control-module and legacy
//!   message sets into one [`TelemetrySnapshot`]
//! - **Command watchdog**: periodic retransmission of the charger command with
//!   guaranteed power-off on stop
//! - **BMU polling**: `AF FA ... AF A0` frames with resynchronisation, alarms and
//!   charge/discharge tracking
//! - **Modbus RTU**: read holding registers (0x03) and write multiple registers
//!   (0x10) with CRC16 and exception handling
//! - **Self-healing links**: exponential reconnect backoff on every serial port
//! - **Change notification**: bursts of telemetry coalesced into rate-limited
//!   notifications
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_chargebus::{BmuConfig, BmuPoller, BusResult};
//!
//! #[tokio::main]
//! async fn main() -> BusResult<()> {
//!     let config = BmuConfig::default();
//!     let poller = Arc::new(BmuPoller::new(&config));
//!
//!     let reading = poller.poll_once().await;
//!     println!("BMU: {:?}", reading);
//!     println!("stats: {:?}", poller.stats());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐
//! │    CanMonitor    │  │  CommandWatchdog │  │ BmuPoller /      │
//! │ (snapshot+notify)│  │  (100 ms resend) │  │ RemotePoller     │
//! └──────────────────┘  └──────────────────┘  └──────────────────┘
//!          │                     │                     │
//! ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐
//! │  MessageDecoder  │  │ ControlCommand   │  │ BmuClient /      │
//! │  (id tables)     │  │ encode           │  │ ModbusRtuClient  │
//! └──────────────────┘  └──────────────────┘  └──────────────────┘
//!          │                     │                     │
//! ┌─────────────────────────────────────────┐  ┌──────────────────┐
//! │         CanBus (SocketCAN / memory)      │  │ SerialTransport  │
//! └─────────────────────────────────────────┘  └──────────────────┘
//! ```

/// Bus error type and its statistics buckets
pub mod error;

/// Bit-level field access for CAN payloads
pub mod bitfield;

/// CRC16 and additive checksums
pub mod checksum;

/// Reconnect backoff and staleness tracking
pub mod link;

/// Serial port transport with reconnect
pub mod serial;

/// CAN frames, the bus trait and the SocketCAN transport
pub mod can;

/// Battery monitor frame protocol
pub mod bmu;

/// Modbus RTU client and handset decoding
pub mod modbus;

/// Decoded charger telemetry
pub mod telemetry;

/// CAN message tables and the control frame codec
pub mod decoder;

/// Rate-limited change notification
pub mod notify;

/// CAN receive side: snapshot, history and notifications
pub mod monitor;

/// Charger control command
pub mod command;

/// Periodic command transmission
pub mod watchdog;

/// BMU and handset poll services
pub mod poller;

/// TOML configuration
pub mod config;

/// Packet tracing
pub mod logging;

/// Metrics, validation and formatting helpers
pub mod utils;

// Re-export main types for convenience
pub use error::{BusError, BusResult, ErrorCategory};
pub use bmu::{BmuAlarms, BmuClient, BmuReading, StatusRequest};
pub use can::{CanBus, MemoryBus, RawFrame};
#[cfg(target_os = "linux")]
pub use can::CanTransport;
pub use command::{ChargerVariant, ControlCommand, SharedCommand};
pub use config::{BmuConfig, CanConfig, ChargebusConfig, RemoteConfig, SerialConfig, WatchdogConfig};
pub use decoder::{DecodeOutcome, DecodeProfile, MessageDecoder};
pub use modbus::{ModbusRtuClient, RegisterBlock, RemoteAction, RemoteState};
pub use monitor::CanMonitor;
pub use notify::ChangeNotifier;
pub use poller::{BmuPoller, PollOutcome, RemotePoller};
pub use serial::{MemoryPortOpener, PortOpener, SerialTransport, SystemPortOpener};
pub use telemetry::{ChargerState, FaultFlags, StatusFlags, TelemetrySnapshot};
pub use utils::{OperationTimer, PollMetrics};
pub use watchdog::{CommandWatchdog, WatchdogState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Chargebus v{} - CAN, BMU and Modbus RTU field-bus layer", VERSION)
}
