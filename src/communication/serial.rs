// src/communication/serial.rs - Serial transport seam
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens the byte stream to the printer. Tests substitute an in-memory link.
#[async_trait]
pub trait SerialInterface: Send + Sync {
    async fn open(&self, port: &str, baud_rate: u32) -> io::Result<(BoxedReader, BoxedWriter)>;

    fn available_ports(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Real serial ports through `serial2-tokio`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Serial2Interface;

#[async_trait]
impl SerialInterface for Serial2Interface {
    async fn open(&self, port: &str, baud_rate: u32) -> io::Result<(BoxedReader, BoxedWriter)> {
        tracing::info!("Opening serial port {} at {} baud", port, baud_rate);
        let serial = serial2_tokio::SerialPort::open(port, baud_rate)?;
        let (reader, writer) = tokio::io::split(serial);
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn available_ports(&self) -> Vec<String> {
        match serial2_tokio::SerialPort::available_ports() {
            Ok(ports) => ports.into_iter().map(|p| p.display().to_string()).collect(),
            Err(e) => {
                tracing::warn!("Failed to enumerate serial ports: {}", e);
                Vec::new()
            }
        }
    }
}
