// src/bridge.rs - Long-running service that keeps a printer connection alive
use crate::communication::gcode_store::GcodeStore;
use crate::communication::{EventBus, KlippyState, SerialInterface};
use crate::config::Config;
use crate::gcode::executor::PendingResponse;
use crate::objects::ObjectRegistry;
use crate::printer::{Printer, PrinterServices};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Printer is not connected")]
    NotReady,
}

type CurrentPrinter = Arc<RwLock<Option<Arc<Printer>>>>;

pub struct Bridge;

impl Bridge {
    /// Spawns the connect/reconnect loop and returns a handle to it.
    pub fn start(config: Config, transport: Arc<dyn SerialInterface>) -> BridgeHandle {
        let services = PrinterServices::default();
        let current: CurrentPrinter = Arc::new(RwLock::new(None));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(Arc::new(config), transport, services.clone(), current.clone(), stop_rx));
        BridgeHandle { services, current, stop_tx, task }
    }
}

async fn run(
    config: Arc<Config>,
    transport: Arc<dyn SerialInterface>,
    services: PrinterServices,
    current: CurrentPrinter,
    mut stop_rx: watch::Receiver<bool>,
) {
    let events = services.events.clone();
    loop {
        if *stop_rx.borrow() {
            break;
        }
        events.state_changed(KlippyState::Startup, "Connecting to printer");
        let connect = Printer::connect(config.clone(), transport.as_ref(), services.clone());
        let result = tokio::select! {
            result = connect => result,
            _ = stop_rx.changed() => break,
        };

        match result {
            Ok(printer) => {
                let name = printer.firmware_info().map(|info| info.firmware_name.clone()).unwrap_or_default();
                *current.write().unwrap_or_else(PoisonError::into_inner) = Some(printer.clone());
                events.state_changed(KlippyState::Ready, format!("Printer is ready ({name})"));

                let stopping = tokio::select! {
                    _ = printer.closed() => false,
                    _ = stop_rx.changed() => true,
                };
                current.write().unwrap_or_else(PoisonError::into_inner).take();
                if stopping {
                    printer.close();
                    printer.closed().await;
                    break;
                }
                events.state_changed(KlippyState::Shutdown, "Lost connection to printer");
            }
            Err(e) => {
                tracing::error!("Failed to connect: {}", e);
                events.state_changed(KlippyState::Error, e.to_string());
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.serial.reconnect_delay()) => {}
            _ = stop_rx.changed() => break,
        }
    }
    events.state_changed(KlippyState::Shutdown, "Bridge stopped");
}

pub struct BridgeHandle {
    services: PrinterServices,
    current: CurrentPrinter,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BridgeHandle {
    /// The connected printer, if setup has finished.
    pub fn printer(&self) -> Result<Arc<Printer>, BridgeError> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BridgeError::NotReady)
    }

    pub fn queue_gcode(&self, text: &str, important: bool, silent: bool) -> Result<Option<PendingResponse>, BridgeError> {
        Ok(self.printer()?.queue_gcode(text, important, silent))
    }

    pub fn events(&self) -> &EventBus {
        &self.services.events
    }

    pub fn objects(&self) -> &Arc<ObjectRegistry> {
        &self.services.objects
    }

    pub fn gcode_store(&self) -> &Arc<GcodeStore> {
        &self.services.gcode_store
    }

    /// Closes any live connection and waits for the service loop to exit.
    pub async fn stop(self) {
        self.stop_tx.send_replace(true);
        if let Err(e) = self.task.await {
            tracing::error!("Bridge task failed: {}", e);
        }
    }
}
