// src/communication/event_system.rs - Broadcast bus for connection state and console output
use serde::Serialize;
use tokio::sync::broadcast;

/// Connection state as reported to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KlippyState {
    Startup,
    Ready,
    Error,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    StateChanged { state: KlippyState, message: String },
    /// A console line for clients (`// info`, `!! error`).
    GcodeResponse(String),
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn publish(&self, event: BridgeEvent) {
        tracing::trace!("Event: {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn state_changed(&self, state: KlippyState, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("Printer state {:?}: {}", state, message);
        self.publish(BridgeEvent::StateChanged { state, message });
    }

    pub fn gcode_response(&self, message: impl Into<String>) {
        self.publish(BridgeEvent::GcodeResponse(message.into()));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
