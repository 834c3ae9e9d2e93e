//! Poll services for the serial links
//!
//! [`BmuPoller`] asks the battery monitor for its status every 500 ms and keeps the
//! last reading, its alarms and a set of error counters. [`RemotePoller`] reads the
//! handset registers every 200 ms and publishes the decoded [`RemoteState`] when it
//! changes.
//!
//! Both services share the same shape:
//!
//! - `poll_once` runs a single cycle. A call that overlaps a running cycle is
//!   rejected with [`PollOutcome::Skipped`] rather than queued.
//! - `spawn` drives `poll_once` from a tokio interval until the shutdown watch
//!   turns `true`.
//! - Transport errors are counted and classified, never returned as failures of
//!   the service itself.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::bmu::{BmuClient, BmuReading, StatusRequest};
use crate::config::{BmuConfig, RemoteConfig};
use crate::error::{BusError, ErrorCategory};
use crate::modbus::{ModbusRtuClient, RemoteState};
use crate::serial::{PortOpener, SystemPortOpener};
use crate::utils::{format, OperationTimer, PollMetrics};

/// Result of one poll cycle
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<T> {
    /// Valid data arrived
    Data(T),
    /// The device stayed silent
    NoResponse,
    /// The cycle failed; the error has been counted
    Failed(BusError),
    /// Another cycle was still running
    Skipped,
}

impl<T> PollOutcome<T> {
    pub fn is_data(&self) -> bool {
        matches!(self, PollOutcome::Data(_))
    }

    pub fn data(self) -> Option<T> {
        match self {
            PollOutcome::Data(value) => Some(value),
            _ => None,
        }
    }
}

/// Clears the re-entrancy flag when a cycle ends
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleGuard(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Error counters shared by both services
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorCounters {
    pub error_count: u64,
    pub by_category: BTreeMap<ErrorCategory, u64>,
    pub frame_mismatch_count: u64,
    pub last_error: Option<String>,
}

impl ErrorCounters {
    pub fn record(&mut self, category: ErrorCategory, message: String) {
        self.error_count += 1;
        *self.by_category.entry(category).or_insert(0) += 1;
        if category == ErrorCategory::FrameMismatch {
            self.frame_mismatch_count += 1;
        }
        self.last_error = Some(message);
    }

    pub fn count(&self, category: ErrorCategory) -> u64 {
        self.by_category.get(&category).copied().unwrap_or(0)
    }
}

/// Battery monitor poll statistics
#[derive(Debug, Clone, Serialize)]
pub struct BmuPollStats {
    pub started_at: DateTime<Utc>,
    pub success_count: u64,
    pub errors: ErrorCounters,
    pub last_reading: Option<BmuReading>,
    pub last_alarms: Vec<&'static str>,
    pub is_charging: bool,
    /// Transitions into charging
    pub charge_count: u64,
    /// Transitions out of charging
    pub discharge_count: u64,
    pub metrics: PollMetrics,
}

impl BmuPollStats {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            success_count: 0,
            errors: ErrorCounters::default(),
            last_reading: None,
            last_alarms: Vec::new(),
            is_charging: false,
            charge_count: 0,
            discharge_count: 0,
            metrics: PollMetrics::new(),
        }
    }

    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }

    fn record_reading(&mut self, reading: &BmuReading) {
        self.success_count += 1;
        self.last_reading = Some(*reading);
        self.last_alarms = reading.alarms().labels();

        if reading.current_a.is_some() {
            let charging = reading.is_charging();
            if charging && !self.is_charging {
                self.charge_count += 1;
            }
            if !charging && self.is_charging {
                self.discharge_count += 1;
            }
            self.is_charging = charging;
        }
    }
}

/// Periodic status poll of one battery monitor
pub struct BmuPoller<O: PortOpener = SystemPortOpener> {
    client: BmuClient<O>,
    request: StatusRequest,
    period: Duration,
    in_cycle: AtomicBool,
    stats: Mutex<BmuPollStats>,
    readings: watch::Sender<Option<BmuReading>>,
}

impl BmuPoller<SystemPortOpener> {
    pub fn new(config: &BmuConfig) -> Self {
        Self::with_opener(config, SystemPortOpener)
    }
}

impl<O: PortOpener> BmuPoller<O> {
    pub fn with_opener(config: &BmuConfig, opener: O) -> Self {
        let (readings, _) = watch::channel(None);
        Self {
            client: BmuClient::with_opener(config, opener),
            request: StatusRequest::new(config.address),
            period: config.poll_period(),
            in_cycle: AtomicBool::new(false),
            stats: Mutex::new(BmuPollStats::new()),
            readings,
        }
    }

    pub fn client(&self) -> &BmuClient<O> {
        &self.client
    }

    pub fn stats(&self) -> BmuPollStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn latest(&self) -> Option<BmuReading> {
        *self.readings.borrow()
    }

    /// Receiver updated with every valid reading
    pub fn readings(&self) -> watch::Receiver<Option<BmuReading>> {
        self.readings.subscribe()
    }

    /// One request/response cycle, retried once when the device stays silent
    pub async fn poll_once(&self) -> PollOutcome<BmuReading> {
        let Some(_guard) = CycleGuard::enter(&self.in_cycle) else {
            debug!("[BMU] previous poll still running, skipping");
            return PollOutcome::Skipped;
        };
        let timer = OperationTimer::start("bmu poll");

        let mut result = self.client.poll(&self.request).await;
        if matches!(result, Ok(None)) {
            debug!("[BMU] no data, retrying once");
            result = self.client.poll(&self.request).await;
        }

        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        match result {
            Ok(Some(reading)) => {
                stats.metrics.record_success(timer.stop_and_log(true));
                stats.record_reading(&reading);
                if !stats.last_alarms.is_empty() {
                    warn!("[BMU] alarms: {}", stats.last_alarms.join(" | "));
                }
                drop(stats);
                self.readings.send_replace(Some(reading));
                PollOutcome::Data(reading)
            }
            Ok(None) => {
                stats.metrics.record_failure(timer.stop_and_log(false));
                stats
                    .errors
                    .record(ErrorCategory::NoResponse, "Timeout/No response".to_string());
                PollOutcome::NoResponse
            }
            Err(e) => {
                stats.metrics.record_failure(timer.stop_and_log(false));
                stats.errors.record(e.category(), e.to_string());
                warn!("[BMU] poll failed ({}): {}", e.category(), e);
                PollOutcome::Failed(e)
            }
        }
    }

    /// Clear the last error and reopen the port right away
    pub async fn reconnect(&self) -> bool {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).errors.last_error = None;
        self.client.force_reconnect().await
    }

    /// Poll every period until `shutdown` turns true
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("[BMU] polling every {:?}", self.period);
            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.poll_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("[BMU] poller stopped: {}", format::format_metrics(&self.stats().metrics));
        })
    }
}

/// Handset poll statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct RemotePollStats {
    pub success_count: u64,
    pub errors: ErrorCounters,
    /// States published because they differed from the previous one
    pub updates_published: u64,
    pub metrics: PollMetrics,
}

/// Periodic read of the remote-control handset
pub struct RemotePoller<O: PortOpener = SystemPortOpener> {
    client: ModbusRtuClient<O>,
    config: RemoteConfig,
    in_cycle: AtomicBool,
    stats: Mutex<RemotePollStats>,
    state: watch::Sender<Option<RemoteState>>,
}

impl RemotePoller<SystemPortOpener> {
    pub fn new(config: RemoteConfig) -> Self {
        Self::with_opener(config, SystemPortOpener)
    }
}

impl<O: PortOpener> RemotePoller<O> {
    pub fn with_opener(config: RemoteConfig, opener: O) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            client: ModbusRtuClient::with_opener(config.serial.clone(), opener),
            config,
            in_cycle: AtomicBool::new(false),
            stats: Mutex::new(RemotePollStats::default()),
            state,
        }
    }

    pub fn client(&self) -> &ModbusRtuClient<O> {
        &self.client
    }

    pub fn stats(&self) -> RemotePollStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn latest(&self) -> Option<RemoteState> {
        self.state.borrow().clone()
    }

    /// Receiver that only wakes when the decoded state changes
    pub fn changes(&self) -> watch::Receiver<Option<RemoteState>> {
        self.state.subscribe()
    }

    pub async fn poll_once(&self) -> PollOutcome<RemoteState> {
        let Some(_guard) = CycleGuard::enter(&self.in_cycle) else {
            return PollOutcome::Skipped;
        };
        let timer = OperationTimer::start("remote poll");

        let result = self
            .client
            .read_block(self.config.slave_id, self.config.start_register, self.config.register_count)
            .await
            .and_then(|block| RemoteState::decode(&block));

        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        match result {
            Ok(state) => {
                stats.metrics.record_success(timer.stop_and_log(true));
                stats.success_count += 1;
                let published = self.state.send_if_modified(|current| {
                    if current.as_ref() == Some(&state) {
                        false
                    } else {
                        *current = Some(state.clone());
                        true
                    }
                });
                if published {
                    stats.updates_published += 1;
                    debug!("[MODBUS] remote: {} ({})", state.action, state.mode);
                }
                PollOutcome::Data(state)
            }
            Err(e) => {
                stats.metrics.record_failure(timer.stop_and_log(false));
                stats.errors.record(e.category(), e.to_string());
                if matches!(e, BusError::Configuration { .. }) {
                    error!("[MODBUS] remote poll misconfigured: {}", e);
                } else {
                    warn!("[MODBUS] remote poll failed ({}): {}", e.category(), e);
                }
                PollOutcome::Failed(e)
            }
        }
    }

    /// Poll every period until `shutdown` turns true
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("[MODBUS] polling remote every {:?}", self.config.poll_period());
            let mut ticker = tokio::time::interval(self.config.poll_period());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.poll_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("[MODBUS] remote poller stopped: {}", format::format_metrics(&self.stats().metrics));
        })
    }
}
