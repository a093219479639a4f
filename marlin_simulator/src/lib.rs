//! In-memory Marlin firmware for exercising the bridge without hardware.
//!
//! The simulator speaks the line protocol over any `AsyncRead + AsyncWrite`
//! stream: every command gets its reply lines followed by `ok`, and
//! temperature/position autoreports are pushed on a timer once enabled with
//! `M155`/`M154`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone)]
pub struct SimulatorOptions {
    pub firmware_name: String,
    pub machine_type: String,
    pub capabilities: Vec<(String, bool)>,
    /// Reply to the first M115 with line noise.
    pub garble_first_handshake: bool,
    /// Never reply to anything.
    pub silent: bool,
    pub report_interval: Duration,
    pub hotend_temperature: f64,
    pub bed_temperature: f64,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        Self::marlin()
    }
}

impl SimulatorOptions {
    pub fn marlin() -> Self {
        Self {
            firmware_name: "Marlin 2.1.2.1 (Feb  1 2024 10:00:00)".to_string(),
            machine_type: "Ender-3 V2".to_string(),
            capabilities: vec![
                ("SERIAL_XON_XOFF".to_string(), false),
                ("EEPROM".to_string(), true),
                ("AUTOREPORT_TEMP".to_string(), false),
                ("AUTOREPORT_POS".to_string(), false),
            ],
            garble_first_handshake: false,
            silent: false,
            report_interval: Duration::from_millis(100),
            hotend_temperature: 21.5,
            bed_temperature: 20.0,
        }
    }

    pub fn prusa() -> Self {
        Self {
            firmware_name: "Prusa-Firmware 3.13.2 based on Marlin".to_string(),
            machine_type: "Prusa i3 MK3S".to_string(),
            capabilities: vec![
                ("AUTOREPORT_TEMP".to_string(), false),
                ("AUTOREPORT_POSITION".to_string(), false),
            ],
            ..Self::marlin()
        }
    }

    pub fn with_capability(mut self, name: &str, enabled: bool) -> Self {
        match self.capabilities.iter_mut().find(|(cap, _)| cap == name) {
            Some(entry) => entry.1 = enabled,
            None => self.capabilities.push((name.to_string(), enabled)),
        }
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimState {
    pub received: Vec<String>,
    pub position: [f64; 4],
    pub absolute: bool,
    pub hotend: (f64, f64),
    pub bed: (f64, f64),
    pub temperature_autoreport: bool,
    pub position_autoreport: bool,
    pub handshakes: usize,
}

/// Inspects a running simulator from tests.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn received(&self) -> Vec<String> {
        self.lock().received.clone()
    }

    /// Received lines other than periodic M105/M114 polls.
    pub fn commands(&self) -> Vec<String> {
        self.lock()
            .received
            .iter()
            .filter(|line| !matches!(line.as_str(), "M105" | "M114"))
            .cloned()
            .collect()
    }

    pub fn handshakes(&self) -> usize {
        self.lock().handshakes
    }

    pub fn position(&self) -> [f64; 4] {
        self.lock().position
    }

    pub fn state(&self) -> SimState {
        self.lock().clone()
    }

    pub fn set_hotend_temperature(&self, temperature: f64) {
        self.lock().hotend.0 = temperature;
    }
}

pub struct SimulatedMarlin {
    options: SimulatorOptions,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedMarlin {
    pub fn new(options: SimulatorOptions) -> Self {
        let state = SimState {
            absolute: true,
            hotend: (options.hotend_temperature, 0.0),
            bed: (options.bed_temperature, 0.0),
            ..SimState::default()
        };
        Self { options, state: Arc::new(Mutex::new(state)) }
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle { state: self.state.clone() }
    }

    /// Runs a simulator on one end of an in-memory pipe and returns the other end.
    pub fn spawn(options: SimulatorOptions) -> (DuplexStream, SimHandle) {
        let (host, firmware) = tokio::io::duplex(64 * 1024);
        let simulator = SimulatedMarlin::new(options);
        let handle = simulator.handle();
        tokio::spawn(simulator.run(firmware));
        (host, handle)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn run<S>(self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();
        let mut ticker = tokio::time::interval(self.options.report_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let replies = tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.respond(&line),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("Simulator read error: {}", e);
                        break;
                    }
                },
                _ = ticker.tick() => self.autoreports(),
            };
            for reply in replies {
                if writer.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                    return;
                }
            }
            if writer.flush().await.is_err() {
                return;
            }
        }
        tracing::debug!("Simulator stream closed");
    }

    fn autoreports(&self) -> Vec<String> {
        if self.options.silent {
            return Vec::new();
        }
        let state = self.lock();
        let mut reports = Vec::new();
        if state.temperature_autoreport {
            reports.push(format!(" {}", temperature_line(&state)));
        }
        if state.position_autoreport {
            reports.push(position_line(&state));
        }
        reports
    }

    /// Reply lines for one received command, completion included.
    pub fn respond(&self, line: &str) -> Vec<String> {
        let line = line.split(';').next().unwrap_or_default().trim();
        if line.is_empty() {
            return Vec::new();
        }
        let mut state = self.lock();
        state.received.push(line.to_string());
        if self.options.silent {
            return Vec::new();
        }

        let mut words = line.split_whitespace();
        let code = words.next().unwrap_or_default().to_ascii_uppercase();
        let params: BTreeMap<char, f64> = words
            .filter_map(|word| {
                let mut chars = word.chars();
                let letter = chars.next()?.to_ascii_uppercase();
                Some((letter, chars.as_str().parse().unwrap_or(0.0)))
            })
            .collect();

        let mut replies = Vec::new();
        match code.as_str() {
            "M115" => {
                state.handshakes += 1;
                if self.options.garble_first_handshake && state.handshakes == 1 {
                    replies.push("\u{fffd}FIRMW\u{fffd}E_N#ME:Mar".to_string());
                } else {
                    replies.push(format!(
                        "FIRMWARE_NAME:{} SOURCE_CODE_URL:github.com/MarlinFirmware/Marlin PROTOCOL_VERSION:1.0 MACHINE_TYPE:{} EXTRUDER_COUNT:1 UUID:cede2a2f-41a2-4748-9b12-c55c62f367ff",
                        self.options.firmware_name, self.options.machine_type
                    ));
                    for (name, enabled) in &self.options.capabilities {
                        replies.push(format!("Cap:{}:{}", name, u8::from(*enabled)));
                    }
                }
            }
            "M105" => {
                replies.push(format!("ok {}", temperature_line(&state)));
                return replies;
            }
            "M114" => replies.push(position_line(&state)),
            "M503" => {
                replies.extend(
                    [
                        "echo:; Maximum feedrates (units/s):",
                        "echo:  M203 X500.00 Y500.00 Z5.00 E25.00",
                        "echo:; Maximum Acceleration (units/s2):",
                        "echo:  M201 X500.00 Y500.00 Z100.00 E5000.00",
                        "echo:; Acceleration (units/s2): P<print_accel> R<retract_accel> T<travel_accel>",
                        "echo:  M204 P500.00 R500.00 T500.00",
                        "echo:; Advanced: B<min_segment_time_us> S<min_feedrate> T<min_travel_feedrate> X<max_x_jerk> Y<max_y_jerk> Z<max_z_jerk> E<max_e_jerk>",
                        "echo:  M205 B20000.00 S0.00 T0.00 X8.00 Y8.00 Z0.40 E5.00",
                    ]
                    .map(str::to_string),
                );
            }
            "M155" => {
                let enabled = params.get(&'S').is_some_and(|s| *s > 0.0);
                match params.get(&'C') {
                    Some(mask) => {
                        let mask = *mask as u8;
                        state.temperature_autoreport = enabled && mask & 1 != 0;
                        state.position_autoreport = enabled && mask & 4 != 0;
                    }
                    None => state.temperature_autoreport = enabled,
                }
            }
            "M154" => state.position_autoreport = params.get(&'S').is_some_and(|s| *s > 0.0),
            "G90" => state.absolute = true,
            "G91" => state.absolute = false,
            "G0" | "G1" => {
                for (idx, axis) in ['X', 'Y', 'Z', 'E'].iter().enumerate() {
                    if let Some(value) = params.get(axis) {
                        if state.absolute {
                            state.position[idx] = *value;
                        } else {
                            state.position[idx] += value;
                        }
                    }
                }
            }
            "G92" => {
                for (idx, axis) in ['X', 'Y', 'Z', 'E'].iter().enumerate() {
                    if let Some(value) = params.get(axis) {
                        state.position[idx] = *value;
                    }
                }
            }
            "G28" => {
                let homed: Vec<usize> = ['X', 'Y', 'Z']
                    .iter()
                    .enumerate()
                    .filter(|(_, axis)| params.contains_key(axis))
                    .map(|(idx, _)| idx)
                    .collect();
                let axes = if homed.is_empty() { vec![0, 1, 2] } else { homed };
                for idx in axes {
                    state.position[idx] = 0.0;
                }
            }
            "M104" | "M109" => {
                if let Some(target) = params.get(&'S') {
                    state.hotend.1 = *target;
                    if code == "M109" {
                        state.hotend.0 = *target;
                    }
                }
            }
            "M140" | "M190" => {
                if let Some(target) = params.get(&'S') {
                    state.bed.1 = *target;
                    if code == "M190" {
                        state.bed.0 = *target;
                    }
                }
            }
            c if c.starts_with('G') || c.starts_with('M') || c.starts_with('T') => {}
            _ => replies.push(format!("echo:Unknown command: \"{line}\"")),
        }
        replies.push("ok".to_string());
        replies
    }
}

fn temperature_line(state: &SimState) -> String {
    format!(
        "T:{:.2} /{:.2} B:{:.2} /{:.2} @:0 B@:0",
        state.hotend.0, state.hotend.1, state.bed.0, state.bed.1
    )
}

fn position_line(state: &SimState) -> String {
    let [x, y, z, e] = state.position;
    format!("X:{x:.2} Y:{y:.2} Z:{z:.2} E:{e:.2} Count X:0 Y:0 Z:0")
}
