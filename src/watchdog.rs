//! # Command Watchdog
//!
//! The charger only keeps its output on while control frames keep arriving. The
//! watchdog retransmits the shared [`ControlCommand`] every period (100 ms by
//! default) and guarantees a final power-off frame when stopped.
//!
//! ```text
//!          start() [bus up]            stop()
//!   Idle ─────────────────▶ Active ─────────────▶ Stopping
//!    ▲                        │                      │
//!    │      link down         │   next tick: send    │
//!    └────────────────────────┴──── one off frame ◀──┘
//! ```
//!
//! - Active ticks copy the command under its lock, encode it and send it.
//! - The Stopping tick sends exactly one frame with power disabled and zero
//!   current, then the timer halts. This step is never cancelled.
//! - A tick that finds the link down moves straight to Idle without sending.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::can::CanBus;
use crate::command::{ControlCommand, SharedCommand};
use crate::config::WatchdogConfig;
use crate::decoder::encode_control_command;
use crate::error::{BusError, BusResult};

/// Wait between the two halves of a recovery sequence
pub const RECOVERY_DELAY: Duration = Duration::from_millis(200);

/// Watchdog lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WatchdogState {
    Idle,
    Active,
    Stopping,
}

/// Transmission counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatchdogStats {
    pub frames_sent: u64,
    pub send_errors: u64,
    pub suppressed: u64,
    pub off_frames: u64,
    pub link_drops: u64,
}

struct WatchdogCore<B> {
    bus: Arc<B>,
    command: SharedCommand,
    config: WatchdogConfig,
    state: watch::Sender<WatchdogState>,
    stats: Mutex<WatchdogStats>,
}

impl<B: CanBus> WatchdogCore<B> {
    fn state(&self) -> WatchdogState {
        *self.state.borrow()
    }

    fn set_state(&self, state: WatchdogState) {
        self.state.send_replace(state);
    }

    fn stats(&self) -> std::sync::MutexGuard<'_, WatchdogStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, command: &ControlCommand) -> BusResult<()> {
        let data = encode_control_command(command);
        match self.bus.send(self.config.command_id, &data) {
            Ok(()) => {
                self.stats().frames_sent += 1;
                Ok(())
            }
            Err(e) => {
                self.stats().send_errors += 1;
                warn!("[WATCHDOG] send {} failed: {}", command, e);
                Err(e)
            }
        }
    }

    /// One timer tick; returns whether the timer keeps running
    fn tick(&self) -> bool {
        if !self.bus.is_connected() {
            if self.state() != WatchdogState::Idle {
                self.stats().link_drops += 1;
                warn!("[WATCHDOG] CAN link down, going idle");
                self.set_state(WatchdogState::Idle);
            }
            return false;
        }

        match self.state() {
            WatchdogState::Idle => false,
            WatchdogState::Active => {
                let command = self.command.snapshot();
                if self.config.suppress_blank_frames && command.is_blank() {
                    self.stats().suppressed += 1;
                    return true;
                }
                let _ = self.send(&command);
                true
            }
            WatchdogState::Stopping => {
                let off = self.command.snapshot().powered_off();
                if self.send(&off).is_ok() {
                    self.stats().off_frames += 1;
                }
                self.set_state(WatchdogState::Idle);
                info!("[WATCHDOG] off frame sent, idle");
                false
            }
        }
    }
}

/// Periodic sender of the control command
pub struct CommandWatchdog<B: CanBus + 'static> {
    core: Arc<WatchdogCore<B>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<B: CanBus + 'static> CommandWatchdog<B> {
    pub fn new(bus: Arc<B>, config: WatchdogConfig) -> Self {
        Self::with_command(bus, config, SharedCommand::default())
    }

    /// Watchdog transmitting an existing shared command
    pub fn with_command(bus: Arc<B>, config: WatchdogConfig, command: SharedCommand) -> Self {
        let (state, _) = watch::channel(WatchdogState::Idle);
        Self {
            core: Arc::new(WatchdogCore {
                bus,
                command,
                config,
                state,
                stats: Mutex::new(WatchdogStats::default()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Handle to the shared command; clones mutate the same record
    pub fn command(&self) -> SharedCommand {
        self.core.command.clone()
    }

    /// Apply a whole-record mutation to the command
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut ControlCommand),
    {
        self.core.command.update(f);
    }

    pub fn state(&self) -> WatchdogState {
        self.core.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<WatchdogState> {
        self.core.state.subscribe()
    }

    pub fn stats(&self) -> WatchdogStats {
        self.core.stats().clone()
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.core.config
    }

    /// Begin periodic transmission
    ///
    /// Fails when the bus is down or a stop is still in progress. Starting an
    /// active watchdog is a no-op.
    pub fn start(&self) -> BusResult<()> {
        if !self.core.bus.is_connected() {
            return Err(BusError::not_connected("CAN bus"));
        }

        let mut outcome = Ok(false);
        self.core.state.send_if_modified(|state| match *state {
            WatchdogState::Idle => {
                *state = WatchdogState::Active;
                outcome = Ok(true);
                true
            }
            WatchdogState::Active => false,
            WatchdogState::Stopping => {
                outcome = Err(BusError::invalid_state("watchdog is stopping"));
                false
            }
        });

        if outcome? {
            self.spawn_timer();
            info!(
                "[WATCHDOG] started, id 0x{:03X} every {:?}",
                self.core.config.command_id,
                self.core.config.period()
            );
        }
        Ok(())
    }

    fn spawn_timer(&self) {
        let core = Arc::clone(&self.core);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(core.config.period());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !core.tick() {
                    break;
                }
            }
            debug!("[WATCHDOG] timer halted");
        });
        let previous = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            if !previous.is_finished() {
                debug!("[WATCHDOG] previous timer still winding down");
            }
        }
    }

    /// Request a stop; the next tick sends the off frame
    pub fn stop(&self) {
        let stopping = self.core.state.send_if_modified(|state| {
            if *state == WatchdogState::Active {
                *state = WatchdogState::Stopping;
                true
            } else {
                false
            }
        });
        if stopping {
            info!("[WATCHDOG] stop requested");
        }
    }

    /// Stop and wait until the off frame has gone out (or the link dropped)
    pub async fn stop_and_wait(&self) {
        self.stop();
        let mut changes = self.core.state.subscribe();
        while *changes.borrow_and_update() != WatchdogState::Idle {
            if changes.changed().await.is_err() {
                break;
            }
        }
    }

    /// Transmit one command immediately, outside the periodic timer
    pub fn send_once(&self, command: &ControlCommand) -> BusResult<()> {
        self.core.send(command)
    }

    /// Clear latched faults, then restart charging
    ///
    /// Sends a clear-faults frame with power off, waits [`RECOVERY_DELAY`], then
    /// switches the shared command to a power-on demand and starts the watchdog.
    /// OVP and OCP are not cleared this way; use
    /// [`restart_after_protection`](Self::restart_after_protection).
    pub async fn clear_faults_and_restart(&self, voltage_v: f64, current_a: f64) -> BusResult<()> {
        let clear = ControlCommand {
            demand_voltage_v: voltage_v,
            demand_current_a: current_a,
            clear_faults: true,
            ..ControlCommand::default()
        };
        info!("[WATCHDOG] clearing faults");
        self.core.command.set(clear);
        self.send_once(&clear)?;
        tokio::time::sleep(RECOVERY_DELAY).await;
        self.core.command.set(ControlCommand::power_on(voltage_v, current_a));
        self.start()
    }

    /// Turn off, wait, turn back on: the sequence OVP and OCP need
    pub async fn restart_after_protection(&self, voltage_v: f64, current_a: f64) -> BusResult<()> {
        let off = ControlCommand::power_on(voltage_v, current_a).powered_off();
        info!("[WATCHDOG] power cycling after OVP/OCP");
        self.core.command.set(off);
        self.send_once(&off)?;
        tokio::time::sleep(RECOVERY_DELAY).await;
        self.core.command.set(ControlCommand::power_on(voltage_v, current_a));
        self.start()
    }
}

impl<B: CanBus + 'static> Drop for CommandWatchdog<B> {
    fn drop(&mut self) {
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if self.core.state() != WatchdogState::Idle {
            // the timer dies with us, so the off frame goes out here
            self.core.set_state(WatchdogState::Stopping);
            self.core.tick();
        }
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}
