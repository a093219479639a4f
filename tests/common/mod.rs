// Shared fixtures: an in-memory serial transport backed by the Marlin simulator.
#![allow(dead_code)]

use async_trait::async_trait;
use marlin_bridge::Config;
use marlin_bridge::communication::{BoxedReader, BoxedWriter, SerialInterface};
use marlin_simulator::{SimHandle, SimulatedMarlin, SimulatorOptions};
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Every `open` boots a fresh simulated printer.
pub struct SimulatorTransport {
    options: SimulatorOptions,
    handles: Mutex<Vec<SimHandle>>,
    baud_rates: Mutex<Vec<u32>>,
}

impl SimulatorTransport {
    pub fn new(options: SimulatorOptions) -> Self {
        Self { options, handles: Mutex::new(Vec::new()), baud_rates: Mutex::new(Vec::new()) }
    }

    pub fn latest(&self) -> SimHandle {
        self.handles.lock().unwrap().last().cloned().expect("transport was never opened")
    }

    pub fn baud_rates(&self) -> Vec<u32> {
        self.baud_rates.lock().unwrap().clone()
    }
}

#[async_trait]
impl SerialInterface for SimulatorTransport {
    async fn open(&self, _port: &str, baud_rate: u32) -> io::Result<(BoxedReader, BoxedWriter)> {
        let (stream, handle) = SimulatedMarlin::spawn(self.options.clone());
        self.handles.lock().unwrap().push(handle);
        self.baud_rates.lock().unwrap().push(baud_rate);
        let (reader, writer) = tokio::io::split(stream);
        Ok((Box::new(reader), Box::new(writer)))
    }
}

pub fn test_config(gcode_dir: &Path) -> Config {
    let mut config = Config::default();
    config.serial.port = "/dev/ttySIM0".to_string();
    config.serial.baud_rate = Some(115200);
    config.serial.max_connection_attempts = 2;
    config.serial.connection_timeout_ms = 2000;
    config.serial.reconnect_delay_ms = 50;
    config.printer.gcode_dir = gcode_dir.to_path_buf();
    config
}

/// Polls `condition` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}
