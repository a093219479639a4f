mod common;

use common::{SimulatorTransport, eventually, test_config};
use marlin_bridge::communication::{BridgeEvent, KlippyState};
use marlin_bridge::config::MacroConfig;
use marlin_bridge::print_job::PrintState;
use marlin_bridge::{Bridge, BridgeError, ConnectError, Printer, PrinterServices};
use marlin_simulator::SimulatorOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

async fn connect(options: SimulatorOptions, config: marlin_bridge::Config) -> (Arc<Printer>, SimulatorTransport) {
    let transport = SimulatorTransport::new(options);
    let printer = Printer::connect(Arc::new(config), &transport, PrinterServices::default())
        .await
        .expect("connect to simulator");
    (printer, transport)
}

async fn next_response(events: &mut broadcast::Receiver<BridgeEvent>, prefix: &str) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(BridgeEvent::GcodeResponse(line)) = events.recv().await {
                if line.starts_with(prefix) {
                    return line;
                }
            }
        }
    })
    .await
    .expect("console response")
}

#[tokio::test]
async fn handshake_reads_firmware_and_limits() {
    let dir = tempfile::tempdir().unwrap();
    let (printer, transport) = connect(SimulatorOptions::marlin(), test_config(dir.path())).await;

    let info = printer.firmware_info().unwrap();
    assert!(info.firmware_name.starts_with("Marlin 2.1"));
    assert_eq!(info.machine_type(), Some("Ender-3 V2"));
    assert!(info.has_capability("EEPROM"));
    assert!(!info.has_capability("AUTOREPORT_TEMP"));

    let limits = printer.limits();
    assert_eq!(limits.max_velocity, 500.0);
    assert_eq!(limits.max_accel, 500.0);
    assert_eq!(limits.max_z_velocity, 5.0);
    assert_eq!(limits.max_z_accel, 100.0);
    assert_eq!(limits.square_corner_velocity, 8.0);

    let sim = transport.latest();
    assert_eq!(sim.handshakes(), 1);
    assert_eq!(&sim.commands()[..2], ["M115", "M503"]);
    for name in ["toolhead", "gcode_move", "motion_report", "configfile", "mcu", "print_stats", "virtual_sdcard"] {
        assert!(printer.objects().contains(name), "missing object {name}");
    }
    assert_eq!(printer.objects().query("mcu").unwrap()["mcu_version"], info.firmware_name.as_str());
}

#[tokio::test]
async fn garbled_handshake_is_resent() {
    let dir = tempfile::tempdir().unwrap();
    let options = SimulatorOptions { garble_first_handshake: true, ..SimulatorOptions::marlin() };
    let (printer, transport) = connect(options, test_config(dir.path())).await;
    assert_eq!(transport.latest().handshakes(), 2);
    assert!(printer.firmware_info().is_some());
}

#[tokio::test]
async fn silent_firmware_exhausts_attempts_cycling_baud_rates() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.serial.baud_rate = None;
    config.serial.connection_timeout_ms = 100;
    let transport = SimulatorTransport::new(SimulatorOptions { silent: true, ..SimulatorOptions::marlin() });

    let err = Printer::connect(Arc::new(config), &transport, PrinterServices::default())
        .await
        .unwrap_err();
    match err {
        ConnectError::AttemptsExhausted { attempts, last } => {
            assert_eq!(attempts, 2);
            assert!(matches!(*last, ConnectError::HandshakeTimeout(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(transport.baud_rates(), [250000, 115200]);
}

#[tokio::test]
async fn polled_temperatures_become_heater_objects() {
    let dir = tempfile::tempdir().unwrap();
    let (printer, transport) = connect(SimulatorOptions::marlin(), test_config(dir.path())).await;

    let objects = printer.objects().clone();
    eventually("extruder object", || {
        let objects = objects.clone();
        async move { objects.contains("extruder") }
    })
    .await;
    let extruder = objects.query("extruder").unwrap();
    assert_eq!(extruder["temperature"], 21.5);
    assert_eq!(objects.query("heater_bed").unwrap()["target"], 0.0);
    assert_eq!(objects.query("heaters").unwrap()["available_heaters"], serde_json::json!(["extruder", "heater_bed"]));
    assert!(transport.latest().received().contains(&"M105".to_string()));

    transport.latest().set_hotend_temperature(180.0);
    eventually("updated extruder temperature", || {
        let objects = objects.clone();
        async move { objects.query("extruder").is_some_and(|e| e["temperature"] == 180.0) }
    })
    .await;
}

#[tokio::test]
async fn autoreported_temperatures_are_not_polled() {
    let dir = tempfile::tempdir().unwrap();
    let options = SimulatorOptions::marlin().with_capability("AUTOREPORT_TEMP", true);
    let (printer, transport) = connect(options, test_config(dir.path())).await;
    let sim = transport.latest();
    assert!(sim.received().contains(&"M155 S1".to_string()));

    let objects = printer.objects().clone();
    eventually("autoreported extruder", || {
        let objects = objects.clone();
        async move { objects.contains("extruder") }
    })
    .await;
    assert!(!sim.received().contains(&"M105".to_string()));
}

#[tokio::test]
async fn prusa_autoreport_uses_a_single_mask() {
    let dir = tempfile::tempdir().unwrap();
    let options = SimulatorOptions::prusa()
        .with_capability("AUTOREPORT_TEMP", true)
        .with_capability("AUTOREPORT_POSITION", true);
    let (_printer, transport) = connect(options, test_config(dir.path())).await;
    let sim = transport.latest();
    assert!(sim.received().contains(&"M155 S1 C5".to_string()));
    let state = sim.state();
    assert!(state.temperature_autoreport && state.position_autoreport);
}

#[tokio::test]
async fn autoreported_position_reaches_motion_report() {
    let dir = tempfile::tempdir().unwrap();
    let options = SimulatorOptions::marlin().with_capability("AUTOREPORT_POS", true);
    let (printer, transport) = connect(options, test_config(dir.path())).await;
    let sim = transport.latest();
    assert!(sim.received().contains(&"M154 S1".to_string()));

    printer.queue_gcode("G1 X30 Y40", false, false).unwrap().wait().await.unwrap();
    let objects = printer.objects().clone();
    eventually("live position from autoreport", || {
        let objects = objects.clone();
        async move {
            objects
                .query("motion_report")
                .is_some_and(|status| status["live_position"][0] == 30.0 && status["live_position"][1] == 40.0)
        }
    })
    .await;
    assert!(!sim.received().contains(&"M114".to_string()));
}

#[tokio::test]
async fn moves_are_tracked_and_reported() {
    let dir = tempfile::tempdir().unwrap();
    let (printer, transport) = connect(SimulatorOptions::marlin(), test_config(dir.path())).await;

    let response = printer.queue_gcode("G28\nG1 X10 Y20 F3000", false, false).unwrap().wait().await.unwrap();
    assert_eq!(response, "ok\nok");
    assert_eq!(transport.latest().position(), [10.0, 20.0, 0.0, 0.0]);

    let state = printer.gcode_state();
    assert_eq!(state.homed_axes, "xyz");
    assert_eq!(&state.position[..2], [10.0, 20.0]);
    let store = printer.gcode_store().entries(None);
    assert!(store.iter().any(|entry| entry.message == "G1 X10 Y20 F3000"));
}

#[tokio::test]
async fn configured_macro_renders_and_sends() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.macros.insert(
        "HEAT".to_string(),
        MacroConfig {
            gcode: "M104 S{params.temp|default(210)}\nM140 S{bed}".to_string(),
            description: None,
            rename_existing: None,
            variables: serde_json::json!({ "bed": 60 }).as_object().unwrap().clone(),
        },
    );
    let (printer, transport) = connect(SimulatorOptions::marlin(), config).await;
    assert!(printer.objects().contains("gcode_macro HEAT"));

    printer.queue_gcode("HEAT", false, false).unwrap().wait().await.unwrap();
    printer.queue_gcode("heat TEMP=225", false, false).unwrap().wait().await.unwrap();
    let commands = transport.latest().commands();
    assert!(commands.ends_with(&["M104 S210".to_string(), "M140 S60".to_string(), "M104 S225".to_string(), "M140 S60".to_string()]));

    printer
        .queue_gcode("SET_GCODE_VARIABLE MACRO=HEAT VARIABLE=bed VALUE=70", false, false)
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(printer.objects().query("gcode_macro HEAT").unwrap()["bed"], 70);
    printer.queue_gcode("HEAT", false, false).unwrap().wait().await.unwrap();
    assert_eq!(transport.latest().commands().last().map(String::as_str), Some("M140 S70"));
}

#[tokio::test]
async fn macro_failure_reports_error_and_still_completes() {
    let dir = tempfile::tempdir().unwrap();
    let (printer, _transport) = connect(SimulatorOptions::marlin(), test_config(dir.path())).await;
    let mut events = printer.events().subscribe();

    let response = printer.queue_gcode("SDCARD_PRINT_FILE", false, false).unwrap().wait().await.unwrap();
    assert_eq!(response, "ok");
    let error = next_response(&mut events, "!! ").await;
    assert_eq!(error, "!! Error: Missing required parameter FILENAME");
}

#[tokio::test]
async fn firmware_errors_are_published() {
    let dir = tempfile::tempdir().unwrap();
    let (printer, _transport) = connect(SimulatorOptions::marlin(), test_config(dir.path())).await;
    let mut events = printer.events().subscribe();

    let response = printer.queue_gcode("FOO", false, false).unwrap().wait().await.unwrap();
    assert!(response.starts_with("echo:Unknown command"));
    let info = next_response(&mut events, "// ").await;
    assert_eq!(info, "// Unknown command: \"FOO\"");
}

#[tokio::test]
async fn sdcard_print_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("cube.gcode"), "G28\nG1 X5 Y5 ; first\nG1 X15\n").unwrap();
    let (printer, transport) = connect(SimulatorOptions::marlin(), test_config(dir.path())).await;

    printer
        .queue_gcode("SDCARD_PRINT_FILE FILENAME=cube.gcode", false, false)
        .unwrap()
        .wait()
        .await
        .unwrap();
    let manager = printer.print_manager().clone();
    eventually("print completion", || {
        let manager = manager.clone();
        async move { manager.state() == PrintState::Complete }
    })
    .await;

    let commands = transport.latest().commands();
    let start = commands.iter().position(|c| c == "G28").unwrap();
    assert_eq!(&commands[start..start + 4], ["G28", "G1 X5 Y5", "G1 X15", "M400"]);
    assert_eq!(transport.latest().position()[0], 15.0);
}

#[tokio::test]
async fn save_and_restore_gcode_state() {
    let dir = tempfile::tempdir().unwrap();
    let (printer, transport) = connect(SimulatorOptions::marlin(), test_config(dir.path())).await;

    let script = "G1 X10 Y10\nSAVE_GCODE_STATE NAME=park\nG91\nG1 X5\nRESTORE_GCODE_STATE NAME=park MOVE=1";
    printer.queue_gcode(script, false, false).unwrap().wait().await.unwrap();
    let state = printer.gcode_state();
    assert!(state.absolute_coordinates);
    assert_eq!(transport.latest().position()[0], 10.0);

    let mut events = printer.events().subscribe();
    printer.queue_gcode("RESTORE_GCODE_STATE NAME=missing", false, false).unwrap().wait().await.unwrap();
    assert_eq!(next_response(&mut events, "!! ").await, "!! Error: Unknown g-code state: missing");
}

#[tokio::test]
async fn close_tears_down_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    let (printer, _transport) = connect(SimulatorOptions::marlin(), test_config(dir.path())).await;

    printer.close();
    tokio::time::timeout(Duration::from_secs(2), printer.closed()).await.unwrap();
    assert!(printer.is_closing());
    assert!(printer.objects().names().is_empty());
    assert!(printer.queue_gcode("G28", false, false).unwrap().wait().await.is_err());
}

#[tokio::test]
async fn bridge_reports_ready_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let handle = Bridge::start(test_config(dir.path()), Arc::new(SimulatorTransport::new(SimulatorOptions::marlin())));
    let mut events = handle.events().subscribe();
    assert!(matches!(handle.queue_gcode("G28", false, false), Err(BridgeError::NotReady)));

    let ready = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(BridgeEvent::StateChanged { state: KlippyState::Ready, message }) = events.recv().await {
                return message;
            }
        }
    })
    .await
    .unwrap();
    assert!(ready.starts_with("Printer is ready"));
    assert!(handle.printer().is_ok());
    handle.queue_gcode("G28", false, false).unwrap().unwrap().wait().await.unwrap();

    handle.stop().await;
    let mut last = None;
    while let Ok(event) = events.try_recv() {
        last = Some(event);
    }
    assert_eq!(
        last,
        Some(BridgeEvent::StateChanged { state: KlippyState::Shutdown, message: "Bridge stopped".to_string() })
    );
}
