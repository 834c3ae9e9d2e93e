//! CAN telemetry monitor
//!
//! Glue between the receive side of a CAN link and its consumers: every frame is
//! kept in a bounded history, decoded into the shared [`TelemetrySnapshot`] and
//! reported through the coalescing [`ChangeNotifier`].
//!
//! ```rust,ignore
//! let monitor = Arc::new(CanMonitor::from_config(&config));
//! monitor.attach(&transport);
//! monitor.subscribe(|| println!("telemetry changed"));
//! let flush = monitor.spawn_flush_task(shutdown_rx);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::can::RawFrame;
use crate::config::CanConfig;
use crate::decoder::{DecodeOutcome, DecodeProfile, MessageDecoder};
use crate::notify::{ChangeNotifier, ObserverId};
use crate::telemetry::TelemetrySnapshot;

/// Frames kept for inspection
pub const DEFAULT_HISTORY_LEN: usize = 200;

/// Decode counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorStats {
    pub frames_seen: u64,
    pub frames_decoded: u64,
    pub frames_ignored: u64,
    pub frames_too_short: u64,
}

/// Receives CAN frames and maintains the telemetry snapshot
pub struct CanMonitor {
    decoder: MessageDecoder,
    snapshot: RwLock<TelemetrySnapshot>,
    history: Mutex<VecDeque<RawFrame>>,
    history_len: usize,
    link_up: AtomicBool,
    notifier: Arc<ChangeNotifier>,
    frames_seen: AtomicU64,
    frames_decoded: AtomicU64,
    frames_ignored: AtomicU64,
    frames_too_short: AtomicU64,
}

impl CanMonitor {
    pub fn new(profile: DecodeProfile, notify_interval: Duration, history_len: usize) -> Self {
        Self {
            decoder: MessageDecoder::new(profile),
            snapshot: RwLock::new(TelemetrySnapshot::default()),
            history: Mutex::new(VecDeque::with_capacity(history_len)),
            history_len,
            link_up: AtomicBool::new(false),
            notifier: Arc::new(ChangeNotifier::new(notify_interval)),
            frames_seen: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
            frames_ignored: AtomicU64::new(0),
            frames_too_short: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CanConfig) -> Self {
        Self::new(config.profile, config.notify_interval(), config.history_len)
    }

    pub fn profile(&self) -> DecodeProfile {
        self.decoder.profile()
    }

    /// Record, decode and announce one received frame
    pub fn handle_frame(&self, frame: &RawFrame) -> DecodeOutcome {
        self.frames_seen.fetch_add(1, Ordering::Relaxed);
        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history.push_back(frame.clone());
            while history.len() > self.history_len {
                history.pop_front();
            }
        }

        let outcome = {
            let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
            self.decoder.decode(frame, &mut snapshot)
        };
        match outcome {
            DecodeOutcome::Applied(_) => {
                self.frames_decoded.fetch_add(1, Ordering::Relaxed);
            }
            DecodeOutcome::Ignored => {
                self.frames_ignored.fetch_add(1, Ordering::Relaxed);
            }
            DecodeOutcome::TooShort { name, dlc } => {
                self.frames_too_short.fetch_add(1, Ordering::Relaxed);
                debug!("[CAN] {} frame too short ({} bytes): {}", name, dlc, frame);
            }
        }

        // the history changed even when nothing decoded
        self.notifier.mark_changed();
        outcome
    }

    /// Link up/down transition from the transport
    pub fn set_link_state(&self, up: bool) {
        if self.link_up.swap(up, Ordering::SeqCst) != up {
            if up {
                info!("[CAN] link up");
            } else {
                warn!("[CAN] link down");
            }
            self.notifier.mark_changed();
        }
    }

    pub fn is_link_up(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    /// Copy of the current telemetry
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Read the telemetry in place
    pub fn with_snapshot<R>(&self, f: impl FnOnce(&TelemetrySnapshot) -> R) -> R {
        let snapshot = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        f(&snapshot)
    }

    /// Most recent frames, oldest first
    pub fn recent_frames(&self) -> Vec<RawFrame> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> MonitorStats {
        MonitorStats {
            frames_seen: self.frames_seen.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_ignored: self.frames_ignored.load(Ordering::Relaxed),
            frames_too_short: self.frames_too_short.load(Ordering::Relaxed),
        }
    }

    /// A control frame was seen on the bus within `timeout`
    pub fn is_command_alive(&self, timeout: Duration) -> bool {
        self.with_snapshot(|s| s.control.map_or(false, |c| !c.is_stale(timeout)))
    }

    /// The live control frame asks for power
    pub fn is_power_requested(&self, timeout: Duration) -> bool {
        self.with_snapshot(|s| {
            s.control
                .map_or(false, |c| !c.is_stale(timeout) && c.is_power_requested())
        })
    }

    /// No live control frame, or the live one requests power off
    pub fn is_power_off(&self, timeout: Duration) -> bool {
        self.with_snapshot(|s| s.control.map_or(true, |c| c.is_stale(timeout) || c.is_power_off()))
    }

    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.notifier.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.notifier.unsubscribe(id)
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.notifier.changes()
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    /// Deliver rate-limited trailing changes until `shutdown` turns true
    pub fn spawn_flush_task(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.notifier.spawn_flush_task(shutdown)
    }

    /// Route a transport's frames and link transitions into this monitor
    #[cfg(target_os = "linux")]
    pub fn attach(self: &Arc<Self>, transport: &crate::can::CanTransport) {
        use crate::can::CanBus;

        let monitor = Arc::clone(self);
        transport.on_frame(move |frame| {
            monitor.handle_frame(frame);
        });
        let monitor = Arc::clone(self);
        transport.on_link_state(move |up| monitor.set_link_state(up));
        self.set_link_state(transport.is_connected());
    }
}

impl std::fmt::Debug for CanMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanMonitor")
            .field("profile", &self.decoder.profile())
            .field("link_up", &self.is_link_up())
            .field("stats", &self.stats())
            .finish()
    }
}
