// src/communication/responses.rs - Parsers for firmware identity, temperature, position and limit reports
use crate::gcode::parser::{keyword, letter_params, strip_comment};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static CAPABILITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Cap:([A-Z0-9_]+):([01])").expect("valid capability regex"));
static IDENTITY_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)([A-Z][A-Z0-9_]*):").expect("valid identity regex"));
static SENSOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)([A-Z])(\d*):\s*(-?\d+(?:\.\d+)?)(?:\s*/\s*(-?\d+(?:\.\d+)?))?")
        .expect("valid sensor regex")
});
static POWER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)([A-Z]?)(\d*)@:\s*(-?\d+(?:\.\d+)?)").expect("valid power regex")
});
static TEMPERATURE_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^T\d*:").expect("valid temperature line regex"));
static POSITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^X:\s*(-?\d+(?:\.\d+)?)\s+Y:\s*(-?\d+(?:\.\d+)?)\s+Z:\s*(-?\d+(?:\.\d+)?)\s+E:\s*(-?\d+(?:\.\d+)?)",
    )
    .expect("valid position regex")
});

/// PWM full scale reported after `@:`.
pub const POWER_FULL_SCALE: f64 = 127.0;
pub const DEFAULT_SQUARE_CORNER_VELOCITY: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareFamily {
    Marlin,
    Prusa,
    Other,
}

/// Identity and capabilities reported by `M115`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FirmwareInfo {
    pub firmware_name: String,
    pub fields: BTreeMap<String, String>,
    pub capabilities: BTreeMap<String, bool>,
}

impl FirmwareInfo {
    pub fn family(&self) -> FirmwareFamily {
        let name = self.firmware_name.to_ascii_lowercase();
        if name.contains("prusa") {
            FirmwareFamily::Prusa
        } else if name.starts_with("marlin") {
            FirmwareFamily::Marlin
        } else {
            FirmwareFamily::Other
        }
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.get(name).copied().unwrap_or(false)
    }

    pub fn machine_type(&self) -> Option<&str> {
        self.fields.get("MACHINE_TYPE").map(String::as_str)
    }
}

pub fn parse_m115(response: &str) -> Option<FirmwareInfo> {
    let mut info: Option<FirmwareInfo> = None;
    let mut capabilities = BTreeMap::new();

    for line in response.lines().map(str::trim) {
        if let Some(caps) = CAPABILITY_RE.captures(line) {
            capabilities.insert(caps[1].to_string(), &caps[2] == "1");
        } else if line.starts_with("FIRMWARE_NAME:") {
            info = Some(FirmwareInfo {
                fields: parse_identity_fields(line),
                ..FirmwareInfo::default()
            });
        }
    }

    let mut info = info?;
    info.firmware_name = info.fields.get("FIRMWARE_NAME")?.clone();
    if info.firmware_name.is_empty() {
        return None;
    }
    info.capabilities = capabilities;
    Some(info)
}

fn parse_identity_fields(line: &str) -> BTreeMap<String, String> {
    let keys: Vec<_> = IDENTITY_KEY_RE
        .captures_iter(line)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((caps[1].to_string(), whole.start(), whole.end()))
        })
        .collect();

    let mut fields = BTreeMap::new();
    for (idx, (key, _, value_start)) in keys.iter().enumerate() {
        let value_end = keys.get(idx + 1).map_or(line.len(), |next| next.1);
        fields.insert(key.clone(), line[*value_start..value_end].trim().to_string());
    }
    fields
}

/// One thermal device sample. `power` is 0.0..=1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureReading {
    pub temperature: f64,
    pub target: Option<f64>,
    pub power: Option<f64>,
}

/// Maps a report key (`T1`, `B`, `C`, ...) to its object name.
pub fn device_name(letter: char, index: Option<u32>, has_target: bool) -> String {
    match (letter, index) {
        ('T', None | Some(0)) => "extruder".to_string(),
        ('T', Some(n)) => format!("extruder{n}"),
        ('B', _) => "heater_bed".to_string(),
        ('C', _) if has_target => "heater_generic chamber".to_string(),
        ('C', _) => "temperature_sensor chamber".to_string(),
        ('P', _) => "temperature_sensor probe".to_string(),
        ('A', _) => "temperature_sensor ambient".to_string(),
        ('R', _) => "temperature_sensor redundant".to_string(),
        ('L', _) => "temperature_sensor cooler".to_string(),
        (other, None) => format!("temperature_sensor {}", other.to_ascii_lowercase()),
        (other, Some(n)) => format!("temperature_sensor {}{n}", other.to_ascii_lowercase()),
    }
}

/// Whether a line is an unsolicited temperature report (autoreport or M109/M190
/// progress). `ok T:...` replies are completions and do not count.
pub fn is_temperature_report(line: &str) -> bool {
    TEMPERATURE_LINE_RE.is_match(line.trim())
}

/// Parses an `M105`-style report. Returns `None` when no tool temperature is present.
pub fn parse_m105(line: &str) -> Option<BTreeMap<String, TemperatureReading>> {
    let mut samples = Vec::new();
    for caps in SENSOR_RE.captures_iter(line) {
        let letter = caps[1].chars().next()?;
        // E is the active extruder and W the wait countdown in M109/M190 progress lines.
        if matches!(letter, 'E' | 'W') {
            continue;
        }
        let index = caps[2].parse::<u32>().ok();
        let Ok(temperature) = caps[3].parse::<f64>() else { continue };
        let target = caps.get(4).and_then(|m| m.as_str().parse::<f64>().ok());
        samples.push((letter, index, temperature, target));
    }

    if !samples.iter().any(|(letter, ..)| *letter == 'T') {
        return None;
    }
    let indexed_tools = samples.iter().any(|(letter, index, ..)| *letter == 'T' && index.is_some());

    let mut readings = BTreeMap::new();
    for (letter, index, temperature, target) in samples {
        // The bare T key duplicates the active tool once indexed tools are listed.
        if letter == 'T' && index.is_none() && indexed_tools {
            continue;
        }
        let name = device_name(letter, index, target.is_some());
        readings.entry(name).or_insert(TemperatureReading { temperature, target, power: None });
    }

    for caps in POWER_RE.captures_iter(line) {
        let letter = caps[1].chars().next().unwrap_or('T');
        let index = caps[2].parse::<u32>().ok();
        let Ok(raw) = caps[3].parse::<f64>() else { continue };
        let name = device_name(letter, index, true);
        if let Some(reading) = readings.get_mut(&name) {
            reading.power = Some((raw / POWER_FULL_SCALE).clamp(0.0, 1.0));
        }
    }

    Some(readings)
}

/// Parses `X: Y: Z: E:` from an `M114` reply or position autoreport.
pub fn parse_m114(line: &str) -> Option<[f64; 4]> {
    let caps = POSITION_RE.captures(line.trim())?;
    let mut position = [0.0; 4];
    for (axis, slot) in position.iter_mut().enumerate() {
        *slot = caps[axis + 1].parse().ok()?;
    }
    Some(position)
}

/// Motion limits derived from the `M503` settings dump.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrinterLimits {
    pub max_velocity: f64,
    pub max_accel: f64,
    pub max_z_velocity: f64,
    pub max_z_accel: f64,
    pub square_corner_velocity: f64,
}

impl Default for PrinterLimits {
    fn default() -> Self {
        Self {
            max_velocity: 300.0,
            max_accel: 3000.0,
            max_z_velocity: 10.0,
            max_z_accel: 100.0,
            square_corner_velocity: DEFAULT_SQUARE_CORNER_VELOCITY,
        }
    }
}

/// Requires `M201` and `M203` lines carrying X, Y and Z.
pub fn parse_m503(response: &str) -> Option<PrinterLimits> {
    let mut settings: BTreeMap<String, BTreeMap<char, f64>> = BTreeMap::new();
    for line in response.lines() {
        let line = line.trim();
        let line = line.strip_prefix("echo:").unwrap_or(line);
        let line = strip_comment(line);
        let Some(code) = keyword(line) else { continue };
        if matches!(code.as_str(), "M201" | "M203" | "M204" | "M205") {
            settings.insert(code, letter_params(line));
        }
    }

    let max_accel = settings.get("M201")?;
    let max_feedrate = settings.get("M203")?;
    let axis = |table: &BTreeMap<char, f64>, letter: char| table.get(&letter).copied();

    let max_velocity = axis(max_feedrate, 'X')?.min(axis(max_feedrate, 'Y')?);
    let max_z_velocity = axis(max_feedrate, 'Z')?;
    let planar_accel = axis(max_accel, 'X')?.min(axis(max_accel, 'Y')?);
    let max_z_accel = axis(max_accel, 'Z')?;

    let accel = settings
        .get("M204")
        .and_then(|m204| axis(m204, 'P').or_else(|| axis(m204, 'S')))
        .unwrap_or(planar_accel);
    let square_corner_velocity = settings
        .get("M205")
        .and_then(|m205| axis(m205, 'X'))
        .unwrap_or(DEFAULT_SQUARE_CORNER_VELOCITY);

    Some(PrinterLimits {
        max_velocity,
        max_accel: accel,
        max_z_velocity,
        max_z_accel,
        square_corner_velocity,
    })
}
