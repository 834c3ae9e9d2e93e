//! Integration tests for the Voltage Chargebus library
//!
//! The serial links run against in-memory devices served by `MemoryPortOpener`;
//! the CAN side loops the watchdog's frames from a `MemoryBus` back into a
//! `CanMonitor`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use voltage_chargebus::bitfield;
use voltage_chargebus::bmu::{encode_response, REQUEST_LEN};
use voltage_chargebus::checksum::{append_crc, validate_crc};
use voltage_chargebus::decoder::decode_control_command;
use voltage_chargebus::modbus::build_read_request;
use voltage_chargebus::utils::logging::init_test_logger;
use voltage_chargebus::*;

fn test_serial(port: &str) -> SerialConfig {
    SerialConfig::default().with_port(port).with_timeouts(100, 100)
}

/// Build a control-module frame from `(start bit, length, raw value)` fields
fn can_frame(id: u32, fields: &[(usize, usize, u64)]) -> RawFrame {
    let mut data = [0u8; 8];
    for &(start, len, value) in fields {
        bitfield::set(&mut data, start, len, value);
    }
    RawFrame::new(id, &data)
}

/// Answer BMU status requests with the given words, one frame per request
async fn serve_bmu(mut device: DuplexStream, replies: Vec<Vec<u8>>) -> DuplexStream {
    for reply in replies {
        let mut request = [0u8; REQUEST_LEN];
        device.read_exact(&mut request).await.expect("request");
        assert_eq!(&request[..2], &[0xAF, 0xFA]);
        device.write_all(&reply).await.expect("reply");
    }
    device
}

#[tokio::test]
async fn test_bmu_poller_resynchronises_after_noise() {
    init_test_logger();
    let config = BmuConfig {
        settle_delay_ms: 1,
        ..BmuConfig::default()
    }
    .with_serial(test_serial("sim-bmu"));
    let poller = BmuPoller::with_opener(&config, MemoryPortOpener::new());
    let device = poller.client().transport().opener().attach(512);

    let mut noisy = vec![0x00, 0x13, 0x55];
    noisy.extend_from_slice(&encode_response(0x60, &[5230, 1250, 87, 0x0040, 0, 0, 255]));
    let sim = tokio::spawn(serve_bmu(device, vec![noisy]));

    let reading = poller.poll_once().await.data().expect("reading");
    assert_eq!(reading.voltage_v, Some(52.3));
    assert_eq!(reading.current_a, Some(12.5));
    assert_eq!(reading.temperature_c, Some(25.5));
    assert_eq!(reading.alarms().labels(), vec!["BMU Error"]);
    let _device = sim.await.expect("join");

    let stats = poller.stats();
    assert_eq!(stats.success_count, 1);
    assert_eq!(stats.charge_count, 1);
    assert_eq!(stats.errors.error_count, 0);
}

#[tokio::test]
async fn test_bmu_poller_recovers_with_forced_reconnect() {
    init_test_logger();
    let config = BmuConfig {
        settle_delay_ms: 1,
        ..BmuConfig::default()
    }
    .with_serial(test_serial("sim-bmu"));
    let poller = BmuPoller::with_opener(&config, MemoryPortOpener::new());

    // nothing plugged in yet
    assert!(matches!(poller.poll_once().await, PollOutcome::Failed(_)));
    assert_eq!(poller.stats().errors.count(ErrorCategory::LostConnection), 1);
    assert!(poller.stats().errors.last_error.is_some());

    let device = poller.client().transport().opener().attach(512);
    assert!(poller.reconnect().await);
    assert!(poller.stats().errors.last_error.is_none());

    let sim = tokio::spawn(serve_bmu(device, vec![encode_response(0x60, &[4800, (-300i16) as u16])]));
    let reading = poller.poll_once().await.data().expect("reading");
    assert_eq!(reading.current_a, Some(-3.0));
    assert!(!reading.is_charging());
    let _device = sim.await.expect("join");
    assert_eq!(poller.latest(), Some(reading));
}

#[tokio::test]
async fn test_modbus_read_write_and_exception() {
    init_test_logger();
    let client = ModbusRtuClient::with_opener(test_serial("sim-remote"), MemoryPortOpener::new());
    let mut device = client.transport().opener().attach(512);

    let sim = tokio::spawn(async move {
        // read 2 registers
        let mut request = [0u8; 8];
        device.read_exact(&mut request).await.expect("read request");
        assert_eq!(request.to_vec(), build_read_request(1, 0x0010, 2));
        let mut reply = vec![0x01, 0x03, 0x04, 0x12, 0x34, 0xAB, 0xCD];
        append_crc(&mut reply);
        device.write_all(&reply).await.expect("read reply");

        // write 3 registers: 7 header bytes + 6 data bytes + CRC
        let mut request = [0u8; 15];
        device.read_exact(&mut request).await.expect("write request");
        assert!(validate_crc(&request).is_ok());
        assert_eq!(&request[..7], &[0x01, 0x10, 0x00, 0x20, 0x00, 0x03, 0x06]);
        let mut reply = request[..6].to_vec();
        append_crc(&mut reply);
        device.write_all(&reply).await.expect("write reply");

        // illegal data address
        let mut request = [0u8; 8];
        device.read_exact(&mut request).await.expect("third request");
        let mut reply = vec![0x01, 0x83, 0x02];
        append_crc(&mut reply);
        device.write_all(&reply).await.expect("exception reply");
        device
    });

    let values = client.read_holding_registers(1, 0x0010, 2).await.expect("read");
    assert_eq!(values, vec![0x1234, 0xABCD]);

    client
        .write_multiple_registers(1, 0x0020, &[1, 2, 3])
        .await
        .expect("write");

    let err = client.read_holding_registers(1, 0x9000, 1).await.unwrap_err();
    assert!(matches!(err, BusError::Exception { function: 0x03, code: 0x02, .. }));
    // the slave answered, so the link stays up
    assert!(client.is_connected().await);
    let _device = sim.await.expect("join");

    // out-of-range quantities never reach the wire
    let attempts = client.transport().opener().attempts();
    assert!(client.read_holding_registers(1, 0, 126).await.is_err());
    assert!(client.write_multiple_registers(1, 0, &[]).await.is_err());
    assert_eq!(client.transport().opener().attempts(), attempts);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_frames_mirror_into_monitor() {
    let bus = Arc::new(MemoryBus::new(true));
    let watchdog = CommandWatchdog::new(bus.clone(), WatchdogConfig::default());
    let monitor = CanMonitor::new(DecodeProfile::ControlModule, Duration::from_millis(100), 50);
    let staleness = watchdog.config().staleness_timeout();

    let command = ChargerVariant::V48.command(48.0, 10.0, true).expect("valid demand");
    watchdog.update(|c| *c = command);
    watchdog.start().expect("start");
    tokio::time::sleep(Duration::from_millis(250)).await;

    for frame in bus.sent() {
        assert_eq!(monitor.handle_frame(&frame), DecodeOutcome::Applied("ControlCommand"));
    }
    assert!(monitor.is_command_alive(staleness));
    assert!(monitor.is_power_requested(staleness));
    let mirror = monitor.snapshot().control.expect("mirror");
    assert!((mirror.demand_voltage_v - 48.0).abs() < 1e-9);
    assert!(mirror.power_stage1);

    watchdog.stop_and_wait().await;
    let off = bus.sent().last().cloned().expect("off frame");
    assert!(!decode_control_command(off.data()).power_enable);
    monitor.handle_frame(&off);
    assert!(monitor.is_power_off(staleness));
    assert_eq!(watchdog.stats().off_frames, 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_active_watchdog_powers_off() {
    let bus = Arc::new(MemoryBus::new(true));
    {
        let watchdog = CommandWatchdog::new(bus.clone(), WatchdogConfig::default());
        watchdog.update(|c| *c = ControlCommand::power_on(24.0, 20.0));
        watchdog.start().expect("start");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let sent = bus.sent();
    assert_eq!(sent.len(), 2);
    let off = decode_control_command(sent[1].data());
    assert!(!off.power_enable);
    assert_eq!(off.demand_voltage_v, 24.0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(bus.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_coalesces_telemetry_burst() {
    let monitor = Arc::new(CanMonitor::new(
        DecodeProfile::ControlModule,
        Duration::from_millis(100),
        100,
    ));
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    monitor.subscribe(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flush = monitor.spawn_flush_task(shutdown_rx);

    let burst = [
        can_frame(0x311, &[(0, 20, 48_000), (20, 18, 12_500), (39, 1, 1)]),
        can_frame(0x321, &[(0, 6, 0x04)]),
        can_frame(0x3F1, &[(0, 16, 3000), (16, 16, 4000)]),
        can_frame(0x5F1, &[(7, 1, 1)]),
        can_frame(0x123, &[]),
    ];
    for frame in &burst {
        monitor.handle_frame(frame);
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 2);

    let snapshot = monitor.snapshot();
    assert!(snapshot.is_charging());
    assert!(!snapshot.is_faulted());
    assert!((snapshot.output_power_w().expect("power") - 600.0).abs() < 1e-6);
    assert!(snapshot.to_json().expect("json").contains("\"power\""));

    let stats = monitor.stats();
    assert_eq!(stats.frames_seen, 5);
    assert_eq!(stats.frames_decoded, 4);
    assert_eq!(stats.frames_ignored, 1);
    assert_eq!(monitor.recent_frames().len(), 5);

    shutdown_tx.send(true).expect("shutdown");
    flush.await.expect("flush task");
}

#[tokio::test]
async fn test_config_file_drives_services() {
    let text = r#"
        [bmu]
        address = 0x61
        poll_period_ms = 250

        [bmu.serial]
        port_name = "sim-bmu"
        baud_rate = 9600

        [remote]
        slave_id = 3

        [can]
        interface = "vcan0"
        profile = "legacy"

        [watchdog]
        period_ms = 50
        suppress_blank_frames = true
    "#;
    let config = ChargebusConfig::from_toml_str(text).expect("config");

    let bmu = config.bmu.as_ref().expect("bmu section");
    assert_eq!(bmu.address, 0x61);
    assert_eq!(bmu.poll_period(), Duration::from_millis(250));
    assert_eq!(bmu.serial.baud_rate, 9600);

    let remote = config.remote.as_ref().expect("remote section");
    assert_eq!(remote.slave_id, 3);
    assert_eq!(remote.register_count, 4);
    assert_eq!(remote.serial.baud_rate, 9600);

    let monitor = CanMonitor::from_config(config.can.as_ref().expect("can section"));
    assert_eq!(monitor.profile(), DecodeProfile::Legacy);
    assert!(config.watchdog.suppress_blank_frames);
    assert_eq!(config.watchdog.period(), Duration::from_millis(50));
}
