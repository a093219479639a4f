pub mod event_system;
pub mod gcode_store;
pub mod responses;
pub mod serial;

pub use event_system::{BridgeEvent, EventBus, KlippyState};
pub use gcode_store::{GcodeStore, GcodeStoreEntry};
pub use serial::{BoxedReader, BoxedWriter, Serial2Interface, SerialInterface};
