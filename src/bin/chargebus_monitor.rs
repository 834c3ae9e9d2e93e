/// Charging station bus monitor
///
/// Starts every link that has a section in the configuration file and prints what
/// arrives: BMU readings, handset state changes and, on Linux, the decoded CAN
/// telemetry as JSON. With `--charge` the command watchdog keeps the charger
/// powered at the given demand until Ctrl-C, which sends the power-off frame.
/// `--trace-packets` turns on hex dumps for every link (visible at `RUST_LOG=debug`).
///
/// ```text
/// chargebus_monitor [config.toml] [--variant v24|v48] [--charge <volts> <amps>] [--trace-packets]
/// ```

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use voltage_chargebus::{
    utils::{format::format_metrics, logging::init_logger},
    BmuPoller, BusError, BusResult, ChargebusConfig, ChargerVariant, RemotePoller,
};

const DEFAULT_CONFIG: &str = "chargebus.toml";

/// Upper bound on waiting for the power-off frame at exit
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct Options {
    config_path: String,
    variant: ChargerVariant,
    charge: Option<(f64, f64)>,
    trace_packets: bool,
}

fn parse_args() -> BusResult<Options> {
    let mut options = Options {
        config_path: DEFAULT_CONFIG.to_string(),
        variant: ChargerVariant::default(),
        charge: None,
        trace_packets: false,
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--variant" => {
                options.variant = match args.next().as_deref() {
                    Some("v24") => ChargerVariant::V24,
                    Some("v48") => ChargerVariant::V48,
                    other => {
                        return Err(BusError::configuration(format!("Unknown variant: {:?}", other)))
                    }
                };
            }
            "--charge" => {
                let voltage = parse_number(args.next(), "volts")?;
                let current = parse_number(args.next(), "amps")?;
                options.charge = Some((voltage, current));
            }
            "--trace-packets" => options.trace_packets = true,
            path => options.config_path = path.to_string(),
        }
    }
    Ok(options)
}

fn parse_number(arg: Option<String>, what: &str) -> BusResult<f64> {
    arg.as_deref()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| BusError::configuration(format!("--charge needs {}", what)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logger();
    let options = parse_args()?;
    let config = ChargebusConfig::load(&options.config_path)?;
    info!("{} using {}", voltage_chargebus::info(), options.config_path);

    let charge = match options.charge {
        Some((voltage, current)) => Some(options.variant.command(voltage, current, true)?),
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let bmu = config.bmu.as_ref().map(|bmu_config| Arc::new(BmuPoller::new(bmu_config)));
    if let Some(poller) = &bmu {
        if options.trace_packets {
            poller.client().transport().set_packet_logging(true);
        }
        let mut readings = poller.readings();
        tasks.push(Arc::clone(poller).spawn(shutdown_rx.clone()));
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = readings.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let reading = *readings.borrow_and_update();
                        if let Some(reading) = reading {
                            println!("🔋 BMU {:?}", reading.to_map());
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    let remote = config.remote.clone().map(|remote_config| Arc::new(RemotePoller::new(remote_config)));
    if let Some(poller) = &remote {
        if options.trace_packets {
            poller.client().transport().set_packet_logging(true);
        }
        let mut changes = poller.changes();
        tasks.push(Arc::clone(poller).spawn(shutdown_rx.clone()));
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = changes.borrow_and_update().clone();
                        if let Some(state) = state {
                            println!(
                                "🎮 Remote {} mode={} speed={:.2} linear={:.2} angular={:.2}",
                                state.action, state.mode, state.speed, state.linear, state.angular
                            );
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    #[cfg(target_os = "linux")]
    let can = match &config.can {
        Some(can_config) => Some(can_link::start(
            can_config,
            &config,
            charge,
            options.trace_packets,
            &shutdown_rx,
            &mut tasks,
        )?),
        None => None,
    };
    #[cfg(not(target_os = "linux"))]
    {
        if config.can.is_some() {
            warn!("CAN is only supported on Linux; skipping");
        }
        if charge.is_some() {
            warn!("--charge needs a CAN link; ignored");
        }
    }

    if bmu.is_none() && remote.is_none() && config.can.is_none() {
        warn!("No links configured in {}", options.config_path);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    #[cfg(target_os = "linux")]
    {
        if let Some(can) = &can {
            can.stop().await;
        }
    }

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            error!("task failed: {}", e);
        }
    }

    if let Some(poller) = &bmu {
        let stats = poller.stats();
        println!(
            "BMU: {} ok, {} errors, {} charges, {} discharges, {}",
            stats.success_count,
            stats.errors.error_count,
            stats.charge_count,
            stats.discharge_count,
            format_metrics(&stats.metrics)
        );
    }
    if let Some(poller) = &remote {
        let stats = poller.stats();
        println!(
            "Remote: {} ok, {} errors, {} updates",
            stats.success_count, stats.errors.error_count, stats.updates_published
        );
    }
    Ok(())
}

#[cfg(target_os = "linux")]
mod can_link {
    use super::*;
    use voltage_chargebus::{CanMonitor, CanTransport, CommandWatchdog, ControlCommand};

    pub struct CanLink {
        transport: Arc<CanTransport>,
        watchdog: CommandWatchdog<CanTransport>,
    }

    impl CanLink {
        pub async fn stop(&self) {
            if tokio::time::timeout(STOP_TIMEOUT, self.watchdog.stop_and_wait())
                .await
                .is_err()
            {
                warn!("watchdog did not confirm power-off within {:?}", STOP_TIMEOUT);
            }
            let stats = self.watchdog.stats();
            info!(
                "watchdog: {} frames, {} errors, {} off frames",
                stats.frames_sent, stats.send_errors, stats.off_frames
            );
            // joins the receive thread, which may sit in a socket read
            let transport = Arc::clone(&self.transport);
            if let Err(e) = tokio::task::spawn_blocking(move || transport.shutdown()).await {
                error!("CAN shutdown failed: {}", e);
            }
        }
    }

    pub fn start(
        can_config: &voltage_chargebus::CanConfig,
        config: &ChargebusConfig,
        charge: Option<ControlCommand>,
        trace_packets: bool,
        shutdown_rx: &watch::Receiver<bool>,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> BusResult<CanLink> {
        let transport = Arc::new(CanTransport::open(can_config.clone()));
        if trace_packets {
            transport.set_packet_logging(true);
        }
        let monitor = Arc::new(CanMonitor::from_config(can_config));
        monitor.attach(&transport);
        if let Err(e) = transport.start_receiving() {
            warn!("CAN receive not started: {}", e);
        }
        tasks.push(monitor.spawn_flush_task(shutdown_rx.clone()));

        let mut changes = monitor.changes();
        let mut shutdown = shutdown_rx.clone();
        let printer = Arc::clone(&monitor);
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        changes.borrow_and_update();
                        match printer.snapshot().to_json() {
                            Ok(json) => println!("⚡ {}", json),
                            Err(e) => warn!("snapshot not serialisable: {}", e),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));

        let watchdog = CommandWatchdog::new(Arc::clone(&transport), config.watchdog.clone());
        if let Some(command) = charge {
            watchdog.update(|current| *current = command);
            watchdog.start()?;
            info!(
                "charging at {:.1} V / {:.1} A",
                command.demand_voltage_v, command.demand_current_a
            );
        }
        Ok(CanLink { transport, watchdog })
    }
}
