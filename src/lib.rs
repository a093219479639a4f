// src/lib.rs - Moonraker-style host bridge for Marlin printers
pub mod bridge;
pub mod communication;
pub mod config;
pub mod file_manager;
pub mod gcode;
pub mod hardware;
pub mod objects;
pub mod print_job;
pub mod printer;

pub use bridge::{Bridge, BridgeError, BridgeHandle};
pub use config::{Config, ConfigError, load_config};
pub use gcode::executor::{ExecutorContext, ExecutorError, PendingResponse};
pub use printer::{ConnectError, Printer, PrinterServices};
