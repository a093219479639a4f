// src/gcode/state.rs - Coordinate and mode state inferred from outgoing commands
use crate::communication::responses::PrinterLimits;
use crate::gcode::parser::{format_number, keyword, letter_flags, letter_params, strip_comment};
use serde_json::{Map, Value, json};

pub const AXES: [char; 4] = ['X', 'Y', 'Z', 'E'];
pub const POSITION_TOLERANCE: f64 = 1e-3;
const FACTOR_TOLERANCE: f64 = 1e-4;
pub const DEFAULT_FEEDRATE: f64 = 1500.0;

/// Which status objects an observed command touched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub toolhead: bool,
    pub gcode_move: bool,
}

impl StateChange {
    const NONE: Self = Self { toolhead: false, gcode_move: false };
    const MOVE: Self = Self { toolhead: true, gcode_move: true };
    const MODE: Self = Self { toolhead: false, gcode_move: true };
    const HOMING: Self = Self { toolhead: true, gcode_move: false };
}

/// Positions are machine coordinates; `homing_origin` is the G92 offset.
/// `speed` is in mm/min.
#[derive(Debug, Clone, PartialEq)]
pub struct GcodeState {
    pub position: [f64; 4],
    pub homing_origin: [f64; 4],
    pub absolute_coordinates: bool,
    pub absolute_extrude: bool,
    pub speed: f64,
    pub speed_factor: f64,
    pub extrude_factor: f64,
    pub homed_axes: String,
    pub live_position: [f64; 4],
    pub live_velocity: f64,
    pub live_extruder_velocity: f64,
}

impl Default for GcodeState {
    fn default() -> Self {
        Self {
            position: [0.0; 4],
            homing_origin: [0.0; 4],
            absolute_coordinates: true,
            absolute_extrude: true,
            speed: DEFAULT_FEEDRATE,
            speed_factor: 1.0,
            extrude_factor: 1.0,
            homed_axes: String::new(),
            live_position: [0.0; 4],
            live_velocity: 0.0,
            live_extruder_velocity: 0.0,
        }
    }
}

impl GcodeState {
    /// Updates the model for a line about to be written.
    pub fn observe(&mut self, line: &str) -> StateChange {
        let line = strip_comment(line);
        let Some(code) = keyword(line) else { return StateChange::NONE };
        match code.as_str() {
            "G0" | "G1" | "G2" | "G3" => self.apply_move(line),
            "G90" => {
                self.absolute_coordinates = true;
                StateChange::MODE
            }
            "G91" => {
                self.absolute_coordinates = false;
                StateChange::MODE
            }
            "M82" => {
                self.absolute_extrude = true;
                StateChange::MODE
            }
            "M83" => {
                self.absolute_extrude = false;
                StateChange::MODE
            }
            "G28" => self.apply_home(line),
            "M18" | "M84" => self.apply_motors_off(line),
            "M220" => match letter_params(line).get(&'S') {
                Some(s) => {
                    self.speed_factor = s / 100.0;
                    StateChange::MODE
                }
                None => StateChange::NONE,
            },
            "M221" => match letter_params(line).get(&'S') {
                Some(s) => {
                    self.extrude_factor = s / 100.0;
                    StateChange::MODE
                }
                None => StateChange::NONE,
            },
            "G92" => {
                let params = letter_params(line);
                let mut changed = false;
                for (idx, axis) in AXES.iter().enumerate() {
                    if let Some(value) = params.get(axis) {
                        self.homing_origin[idx] = self.position[idx] - value;
                        changed = true;
                    }
                }
                if changed { StateChange::MODE } else { StateChange::NONE }
            }
            _ => StateChange::NONE,
        }
    }

    fn apply_move(&mut self, line: &str) -> StateChange {
        let params = letter_params(line);
        for (idx, axis) in AXES.iter().enumerate() {
            let Some(value) = params.get(axis) else { continue };
            let relative = if *axis == 'E' {
                !self.absolute_coordinates || !self.absolute_extrude
            } else {
                !self.absolute_coordinates
            };
            if relative {
                self.position[idx] += value;
            } else {
                self.position[idx] = value + self.homing_origin[idx];
            }
        }
        if let Some(feedrate) = params.get(&'F') {
            if *feedrate > 0.0 {
                self.speed = *feedrate;
            }
        }
        StateChange::MOVE
    }

    fn apply_home(&mut self, line: &str) -> StateChange {
        let flags = letter_flags(line);
        let mut axes: Vec<char> = ['X', 'Y', 'Z'].into_iter().filter(|a| flags.contains(a)).collect();
        if axes.is_empty() {
            axes = vec!['X', 'Y', 'Z'];
        }
        for axis in &axes {
            let idx = axis_index(*axis);
            self.position[idx] = 0.0;
            let lower = axis.to_ascii_lowercase();
            if !self.homed_axes.contains(lower) {
                self.homed_axes.push(lower);
            }
        }
        self.homed_axes = sort_axes(&self.homed_axes);
        StateChange::MOVE
    }

    fn apply_motors_off(&mut self, line: &str) -> StateChange {
        let flags = letter_flags(line);
        let axes: Vec<char> = flags.iter().copied().filter(|a| matches!(a, 'X' | 'Y' | 'Z')).collect();
        if axes.is_empty() {
            // `M84 S<n>` only sets the idle timeout; `M84 E` leaves XYZ alone.
            if !flags.is_empty() {
                return StateChange::NONE;
            }
            self.homed_axes.clear();
        } else {
            self.homed_axes.retain(|c| !axes.contains(&c.to_ascii_uppercase()));
        }
        StateChange::HOMING
    }

    /// Position in G-code coordinates (machine position minus the G92 origin).
    pub fn gcode_position(&self) -> [f64; 4] {
        let mut position = self.position;
        for (idx, value) in position.iter_mut().enumerate() {
            *value -= self.homing_origin[idx];
        }
        position
    }

    pub fn toolhead_status(&self, limits: &PrinterLimits) -> Map<String, Value> {
        let status = json!({
            "homed_axes": self.homed_axes,
            "position": self.position,
            "extruder": "extruder",
            "max_velocity": limits.max_velocity,
            "max_accel": limits.max_accel,
            "max_accel_to_decel": limits.max_accel / 2.0,
            "square_corner_velocity": limits.square_corner_velocity,
            "axis_minimum": [0.0, 0.0, 0.0, 0.0],
            "axis_maximum": [0.0, 0.0, 0.0, 0.0],
        });
        into_map(status)
    }

    pub fn gcode_move_status(&self) -> Map<String, Value> {
        into_map(json!({
            "speed_factor": self.speed_factor,
            "speed": self.speed,
            "extrude_factor": self.extrude_factor,
            "absolute_coordinates": self.absolute_coordinates,
            "absolute_extrude": self.absolute_extrude,
            "homing_origin": self.homing_origin,
            "position": self.position,
            "gcode_position": self.gcode_position(),
        }))
    }

    pub fn motion_report_status(&self) -> Map<String, Value> {
        into_map(json!({
            "live_position": self.live_position,
            "live_velocity": self.live_velocity,
            "live_extruder_velocity": self.live_extruder_velocity,
        }))
    }
}

fn axis_index(axis: char) -> usize {
    AXES.iter().position(|a| *a == axis).unwrap_or(0)
}

fn sort_axes(axes: &str) -> String {
    "xyz".chars().filter(|c| axes.contains(*c)).collect()
}

pub(crate) fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Options for `RESTORE_GCODE_STATE`. `move_speed` is in mm/s.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RestoreOptions {
    pub restore_position: bool,
    pub move_speed: Option<f64>,
}

/// Commands that bring `current` to `target`. Running the result and planning
/// again from the new state yields nothing.
pub fn plan_restore(current: &GcodeState, target: &GcodeState, options: &RestoreOptions) -> Vec<String> {
    let mut plan = Vec::new();
    let mut sim = current.clone();
    let mut push = |command: String, sim: &mut GcodeState| {
        sim.observe(&command);
        plan.push(command);
    };

    if options.restore_position {
        let axes: Vec<usize> = (0..3)
            .filter(|&idx| (sim.position[idx] - target.position[idx]).abs() > POSITION_TOLERANCE)
            .collect();
        if !axes.is_empty() {
            if !sim.absolute_coordinates {
                push("G90".to_string(), &mut sim);
            }
            let mut command = "G0".to_string();
            for idx in axes {
                let value = target.position[idx] - sim.homing_origin[idx];
                command.push_str(&format!(" {}{}", AXES[idx], format_number(value)));
            }
            if let Some(speed) = options.move_speed {
                command.push_str(&format!(" F{}", format_number(speed * 60.0)));
            }
            push(command, &mut sim);
        }
    }

    let origin_axes: Vec<usize> = (0..4)
        .filter(|&idx| (sim.homing_origin[idx] - target.homing_origin[idx]).abs() > POSITION_TOLERANCE)
        .collect();
    if !origin_axes.is_empty() {
        let mut command = "G92".to_string();
        for idx in origin_axes {
            let value = sim.position[idx] - target.homing_origin[idx];
            command.push_str(&format!(" {}{}", AXES[idx], format_number(value)));
        }
        push(command, &mut sim);
    }

    if sim.absolute_coordinates != target.absolute_coordinates {
        let command = if target.absolute_coordinates { "G90" } else { "G91" };
        push(command.to_string(), &mut sim);
    }
    if sim.absolute_extrude != target.absolute_extrude {
        let command = if target.absolute_extrude { "M82" } else { "M83" };
        push(command.to_string(), &mut sim);
    }
    if (sim.speed_factor - target.speed_factor).abs() > FACTOR_TOLERANCE {
        push(format!("M220 S{}", format_number(target.speed_factor * 100.0)), &mut sim);
    }
    if (sim.extrude_factor - target.extrude_factor).abs() > FACTOR_TOLERANCE {
        push(format!("M221 S{}", format_number(target.extrude_factor * 100.0)), &mut sim);
    }
    if (sim.speed - target.speed).abs() > POSITION_TOLERANCE {
        push(format!("G0 F{}", format_number(target.speed)), &mut sim);
    }
    plan
}
