// src/hardware/temperature.rs - Heater and sensor objects fed by M105 polling or autoreport
use crate::communication::responses::{TemperatureReading, is_temperature_report, parse_m105};
use crate::objects::{ObjectRegistry, PrinterObject};
use crate::printer::Printer;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

pub const TEMPERATURE_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const TEMPERATURE_COMMAND: &str = "M105";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThermalKind {
    Heater,
    Sensor,
}

#[derive(Debug, Clone, Copy)]
struct ThermalState {
    temperature: f64,
    target: f64,
    power: f64,
    measured_min: f64,
    measured_max: f64,
}

/// A heater (has a target) or a plain temperature sensor.
pub struct ThermalDevice {
    name: String,
    kind: ThermalKind,
    state: Mutex<ThermalState>,
}

impl ThermalDevice {
    fn new(name: &str, reading: &TemperatureReading) -> Self {
        let kind = if reading.target.is_some() && !name.starts_with("temperature_sensor") {
            ThermalKind::Heater
        } else {
            ThermalKind::Sensor
        };
        Self {
            name: name.to_string(),
            kind,
            state: Mutex::new(ThermalState {
                temperature: reading.temperature,
                target: reading.target.unwrap_or(0.0),
                power: reading.power.unwrap_or(0.0),
                measured_min: reading.temperature,
                measured_max: reading.temperature,
            }),
        }
    }

    pub fn is_heater(&self) -> bool {
        self.kind == ThermalKind::Heater
    }

    fn update(&self, reading: &TemperatureReading) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.temperature = reading.temperature;
        if let Some(target) = reading.target {
            state.target = target;
        }
        if let Some(power) = reading.power {
            state.power = power;
        }
        state.measured_min = state.measured_min.min(reading.temperature);
        state.measured_max = state.measured_max.max(reading.temperature);
    }
}

impl PrinterObject for ThermalDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn query(&self) -> Map<String, Value> {
        let state = *self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let value = match self.kind {
            ThermalKind::Heater => json!({
                "temperature": state.temperature,
                "target": state.target,
                "power": state.power,
            }),
            ThermalKind::Sensor => json!({
                "temperature": state.temperature,
                "measured_min_temp": state.measured_min,
                "measured_max_temp": state.measured_max,
            }),
        };
        crate::gcode::state::into_map(value)
    }
}

struct HeatersObject {
    heaters: Vec<String>,
    sensors: Vec<String>,
}

impl PrinterObject for HeatersObject {
    fn name(&self) -> String {
        "heaters".to_string()
    }

    fn query(&self) -> Map<String, Value> {
        crate::gcode::state::into_map(json!({
            "available_heaters": self.heaters,
            "available_sensors": self.sensors,
        }))
    }
}

pub struct TemperatureWatcher {
    printer: Weak<Printer>,
    objects: Arc<ObjectRegistry>,
    autoreport: bool,
    /// Created from the first successful parse.
    devices: Mutex<Option<BTreeMap<String, Arc<ThermalDevice>>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TemperatureWatcher {
    pub fn new(printer: Weak<Printer>, objects: Arc<ObjectRegistry>, autoreport: bool) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            printer,
            objects,
            autoreport,
            devices: Mutex::new(None),
            shutdown_tx,
        })
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|devices| devices.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Claims unsolicited temperature reports.
    pub fn handle(&self, line: &str) -> bool {
        if !is_temperature_report(line) {
            return false;
        }
        match parse_m105(line) {
            Some(readings) => self.apply(readings),
            None => tracing::debug!("Unparseable temperature report: {}", line),
        }
        true
    }

    pub fn start(self: &Arc<Self>) {
        if self.autoreport {
            tracing::info!("Temperatures are autoreported");
            return;
        }
        let watcher = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TEMPERATURE_POLL_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => watcher.poll().await,
                }
            }
            tracing::debug!("Temperature polling stopped");
        });
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    async fn poll(&self) {
        let pending = match self.printer.upgrade() {
            Some(printer) => printer.queue_gcode(TEMPERATURE_COMMAND, false, true),
            None => return,
        };
        let Some(pending) = pending else { return };
        match pending.wait().await {
            Ok(response) => match response.lines().find_map(parse_m105) {
                Some(readings) => self.apply(readings),
                None => tracing::debug!("No temperatures in M105 response: {:?}", response),
            },
            Err(e) => tracing::debug!("Temperature poll failed: {}", e),
        }
    }

    fn apply(&self, readings: BTreeMap<String, TemperatureReading>) {
        let devices = {
            let mut guard = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref() {
                Some(devices) => devices.clone(),
                None => {
                    let devices = self.create_devices(&readings);
                    *guard = Some(devices.clone());
                    devices
                }
            }
        };

        for (name, reading) in &readings {
            match devices.get(name) {
                Some(device) => device.update(reading),
                None => tracing::trace!("Ignoring reading for unknown device {}", name),
            }
        }
        for name in devices.keys() {
            self.objects.emit(name);
        }
    }

    fn create_devices(&self, readings: &BTreeMap<String, TemperatureReading>) -> BTreeMap<String, Arc<ThermalDevice>> {
        let mut devices = BTreeMap::new();
        let mut heaters = Vec::new();
        for (name, reading) in readings {
            let device = Arc::new(ThermalDevice::new(name, reading));
            if device.is_heater() {
                heaters.push(name.clone());
            }
            tracing::info!("Found {} {}", if device.is_heater() { "heater" } else { "sensor" }, name);
            self.objects.register(device.clone());
            devices.insert(name.clone(), device);
        }
        self.objects.register(Arc::new(HeatersObject {
            heaters,
            sensors: devices.keys().cloned().collect(),
        }));
        self.objects.emit("heaters");
        devices
    }
}
