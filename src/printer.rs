// src/printer.rs - Connection engine: handshake, setup, line routing and the single serial writer
use crate::communication::gcode_store::{GCODE_STORE_CAPACITY, GcodeStore};
use crate::communication::responses::{
    FirmwareFamily, FirmwareInfo, PrinterLimits, parse_m115, parse_m503,
};
use crate::communication::{BoxedReader, BoxedWriter, EventBus, SerialInterface};
use crate::config::Config;
use crate::gcode::builtin_macros::builtin_macros;
use crate::gcode::executor::{Dispatch, ExecutorContext, ExecutorError, PendingResponse};
use crate::gcode::macros::{Macro, MacroError, MacroInvocation, MacroManager};
use crate::gcode::state::{GcodeState, RestoreOptions, StateChange, into_map, plan_restore};
use crate::hardware::position::{POSITION_POLL_INTERVAL, VELOCITY_POLL_INTERVAL};
use crate::hardware::{PositionSource, PositionWatcher, TemperatureWatcher, Watcher, WatcherError, WatcherSet};
use crate::objects::{ObjectRegistry, PrinterObject};
use crate::print_job::PrintManager;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, watch};

pub const HANDSHAKE_COMMAND: &str = "M115";
pub const SETTINGS_COMMAND: &str = "M503";
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(10);
/// Tried in order, one per attempt, when no baud rate is configured.
pub const AUTO_BAUD_RATES: [u32; 7] = [250000, 115200, 230400, 57600, 38400, 19200, 9600];
const RESEND_DELAY: Duration = Duration::from_millis(250);
const COMPLETION_MARKER: &str = "ok";
const ECHO_PREFIX: &str = "echo:";
const ERROR_PREFIX: &str = "Error:";

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: std::io::Error,
    },
    #[error("No valid M115 response within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("Printer setup did not finish within {0:?}")]
    SetupTimeout(Duration),
    #[error("Connection closed during {0}")]
    Closed(&'static str),
    #[error("Watcher error: {0}")]
    Watcher(#[from] WatcherError),
    #[error("Giving up after {attempts} connection attempts: {last}")]
    AttemptsExhausted { attempts: u32, last: Box<ConnectError> },
}

/// Shared sinks that outlive any single connection.
#[derive(Clone)]
pub struct PrinterServices {
    pub objects: Arc<ObjectRegistry>,
    pub events: EventBus,
    pub gcode_store: Arc<GcodeStore>,
}

impl Default for PrinterServices {
    fn default() -> Self {
        Self {
            objects: Arc::new(ObjectRegistry::new()),
            events: EventBus::default(),
            gcode_store: Arc::new(GcodeStore::new(GCODE_STORE_CAPACITY)),
        }
    }
}

/// Closes a half-built connection if the connect future is dropped.
struct CloseOnDrop {
    printer: Arc<Printer>,
    armed: bool,
}

impl CloseOnDrop {
    fn disarm(mut self) -> Arc<Printer> {
        self.armed = false;
        self.printer.clone()
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.printer.close();
        }
    }
}

pub struct Printer {
    weak_self: Weak<Printer>,
    config: Arc<Config>,
    baud_rate: u32,
    services: PrinterServices,
    firmware: OnceLock<FirmwareInfo>,
    limits: RwLock<PrinterLimits>,
    main_context: Arc<ExecutorContext>,
    gcode_state: Mutex<GcodeState>,
    saved_states: Mutex<HashMap<String, GcodeState>>,
    macros: MacroManager,
    watchers: WatcherSet,
    print_manager: Arc<PrintManager>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    closing: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    closed_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Printer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Printer").field("baud_rate", &self.baud_rate).finish_non_exhaustive()
    }
}

impl Printer {
    /// Connects with retries, cycling baud rates when none is configured.
    pub async fn connect(
        config: Arc<Config>,
        transport: &dyn SerialInterface,
        services: PrinterServices,
    ) -> Result<Arc<Printer>, ConnectError> {
        let attempts = config.serial.max_connection_attempts.max(1);
        let mut last = ConnectError::Closed("connect");
        for attempt in 1..=attempts {
            let baud_rate = config
                .serial
                .baud_rate
                .unwrap_or(AUTO_BAUD_RATES[(attempt as usize - 1) % AUTO_BAUD_RATES.len()]);
            tracing::info!(
                "Connecting to {} at {} baud (attempt {}/{})",
                config.serial.port,
                baud_rate,
                attempt,
                attempts
            );
            match Self::try_connect(&config, transport, baud_rate, &services).await {
                Ok(printer) => return Ok(printer),
                Err(e) => {
                    tracing::warn!("Connection attempt {} failed: {}", attempt, e);
                    last = e;
                }
            }
        }
        Err(ConnectError::AttemptsExhausted { attempts, last: Box::new(last) })
    }

    async fn try_connect(
        config: &Arc<Config>,
        transport: &dyn SerialInterface,
        baud_rate: u32,
        services: &PrinterServices,
    ) -> Result<Arc<Printer>, ConnectError> {
        let port = config.serial.port.clone();
        let (reader, writer) = transport
            .open(&port, baud_rate)
            .await
            .map_err(|source| ConnectError::Open { port, source })?;
        let printer = Printer::open(config.clone(), baud_rate, reader, writer, services.clone());
        let guard = CloseOnDrop { printer: printer.clone(), armed: true };

        match printer.initialise().await {
            Ok(()) => Ok(guard.disarm()),
            Err(e) => {
                printer.close();
                printer.closed().await;
                Err(e)
            }
        }
    }

    /// Wraps an already-open stream and starts the reader and writer tasks.
    pub fn open(
        config: Arc<Config>,
        baud_rate: u32,
        reader: BoxedReader,
        writer: BoxedWriter,
        services: PrinterServices,
    ) -> Arc<Printer> {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (closed_tx, _) = watch::channel(false);

        let printer = Arc::new_cyclic(|weak: &Weak<Printer>| {
            let dispatcher: Weak<dyn Dispatch> = weak.clone();
            let main_context = ExecutorContext::new("main", dispatcher);
            let print_manager =
                PrintManager::new(main_context.clone(), services.objects.clone(), &config.printer.gcode_dir);
            Printer {
                weak_self: weak.clone(),
                macros: MacroManager::new(weak.clone()),
                config,
                baud_rate,
                services,
                firmware: OnceLock::new(),
                limits: RwLock::new(PrinterLimits::default()),
                main_context,
                gcode_state: Mutex::new(GcodeState::default()),
                saved_states: Mutex::new(HashMap::new()),
                watchers: WatcherSet::default(),
                print_manager,
                outgoing: Mutex::new(Some(outgoing_tx)),
                closing: AtomicBool::new(false),
                shutdown_tx,
                closed_tx,
            }
        });

        for handler in builtin_macros() {
            printer.macros.register(handler);
        }
        printer.macros.load(&printer.config.macros);

        tokio::spawn(write_loop(writer, outgoing_rx));
        tokio::spawn(printer.clone().read_loop(reader, shutdown_rx));
        printer
    }

    async fn initialise(self: &Arc<Self>) -> Result<(), ConnectError> {
        let connection_timeout = self.config.serial.connection_timeout();
        let info = tokio::time::timeout(connection_timeout, self.handshake())
            .await
            .map_err(|_| ConnectError::HandshakeTimeout(connection_timeout))??;
        tokio::time::timeout(SETUP_TIMEOUT, self.setup(info))
            .await
            .map_err(|_| ConnectError::SetupTimeout(SETUP_TIMEOUT))??;
        Ok(())
    }

    async fn request(&self, command: &str, phase: &'static str) -> Result<String, ConnectError> {
        match self.main_context.queue_gcode(command, false, true) {
            Some(pending) => pending.wait().await.map_err(|_| ConnectError::Closed(phase)),
            None => Ok(String::new()),
        }
    }

    async fn handshake(&self) -> Result<FirmwareInfo, ConnectError> {
        loop {
            let response = self.request(HANDSHAKE_COMMAND, "handshake").await?;
            if let Some(info) = parse_m115(&response) {
                return Ok(info);
            }
            tracing::warn!("Unparseable {} response, resending: {:?}", HANDSHAKE_COMMAND, response);
            tokio::time::sleep(RESEND_DELAY).await;
        }
    }

    async fn setup(self: &Arc<Self>, info: FirmwareInfo) -> Result<(), ConnectError> {
        tracing::info!("Firmware: {} ({:?})", info.firmware_name, info.family());
        let (temperature_autoreport, position_autoreport) = self.enable_autoreport(&info).await?;
        let _ = self.firmware.set(info);

        let limits = loop {
            let response = self.request(SETTINGS_COMMAND, "setup").await?;
            if let Some(limits) = parse_m503(&response) {
                break limits;
            }
            tracing::warn!("Unparseable {} response, resending", SETTINGS_COMMAND);
            tokio::time::sleep(RESEND_DELAY).await;
        };
        tracing::info!(
            "Limits: velocity {} mm/s, accel {} mm/s^2, z velocity {} mm/s",
            limits.max_velocity,
            limits.max_accel,
            limits.max_z_velocity
        );
        *self.limits.write().unwrap_or_else(PoisonError::into_inner) = limits;

        let temperature = TemperatureWatcher::new(
            self.weak_self.clone(),
            self.services.objects.clone(),
            temperature_autoreport,
        );
        self.watchers.add(Watcher::Temperature(temperature))?;
        let source = if position_autoreport {
            PositionSource::AutoReport
        } else if self.config.printer.report_velocity {
            PositionSource::Poll(VELOCITY_POLL_INTERVAL)
        } else {
            PositionSource::Poll(POSITION_POLL_INTERVAL)
        };
        self.watchers.add(Watcher::Position(PositionWatcher::new(self.weak_self.clone(), source)))?;

        self.register_objects();
        self.watchers.start_all();
        Ok(())
    }

    /// Returns which of temperature and position the firmware will push by itself.
    async fn enable_autoreport(&self, info: &FirmwareInfo) -> Result<(bool, bool), ConnectError> {
        match info.family() {
            FirmwareFamily::Marlin => {
                let temperature = info.has_capability("AUTOREPORT_TEMP");
                let position = info.has_capability("AUTOREPORT_POS");
                if temperature {
                    self.request("M155 S1", "setup").await?;
                }
                if position {
                    self.request("M154 S1", "setup").await?;
                }
                Ok((temperature, position))
            }
            FirmwareFamily::Prusa => {
                let temperature = info.has_capability("AUTOREPORT_TEMP");
                let position = info.has_capability("AUTOREPORT_POSITION");
                // C is a bit mask: 1 temperatures, 4 position.
                let mask = u8::from(temperature) | (u8::from(position) << 2);
                if mask != 0 {
                    self.request(&format!("M155 S1 C{mask}"), "setup").await?;
                }
                Ok((temperature, position))
            }
            FirmwareFamily::Other => Ok((false, false)),
        }
    }

    fn register_objects(&self) {
        let objects = &self.services.objects;
        for kind in [MotionObjectKind::Toolhead, MotionObjectKind::GcodeMove, MotionObjectKind::MotionReport] {
            objects.register(Arc::new(MotionObject { printer: self.weak_self.clone(), kind }));
        }
        objects.register(Arc::new(ConfigFileObject { printer: self.weak_self.clone() }));
        objects.register(Arc::new(McuObject { printer: self.weak_self.clone() }));
        self.print_manager.register_objects();
        for custom in self.macros.custom_macros() {
            objects.register(custom);
        }
        for name in objects.names() {
            objects.emit(&name);
        }
    }

    async fn read_loop(self: Arc<Self>, reader: BoxedReader, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut lines = BufReader::new(reader).split(b'\n');
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Serial reader shutting down");
                    break;
                }
                segment = lines.next_segment() => match segment {
                    Ok(Some(bytes)) => self.handle_line(&String::from_utf8_lossy(&bytes)),
                    Ok(None) => {
                        tracing::warn!("Serial port closed by the printer");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Serial read error: {}", e);
                        break;
                    }
                }
            }
        }
        self.on_closed();
    }

    fn handle_line(&self, raw: &str) {
        let line = raw.trim();
        if line.is_empty() {
            return;
        }
        tracing::trace!("<- {}", line);
        if self.watchers.offer(line) {
            return;
        }

        let context = self.main_context.deepest();
        if let Some(message) = line.strip_prefix(ECHO_PREFIX) {
            let message = message.trim();
            if !message.starts_with("busy:") {
                self.respond_info(message);
            }
            context.respond(line);
        } else if line.starts_with(ERROR_PREFIX) {
            self.respond_error(line);
            context.respond(line);
        } else if line.starts_with(COMPLETION_MARKER) {
            context.complete(Some(line));
        } else if !context.respond(line) {
            tracing::debug!("Unsolicited line: {}", line);
        }
    }

    /// Sends one line to the firmware through the writer task.
    fn write(&self, context: &str, line: &str) {
        if self.closing.load(Ordering::Acquire) {
            tracing::warn!("Dropping '{}' from {}: connection is closing", line, context);
            return;
        }
        let sent = match self.lock_outgoing().as_ref() {
            Some(outgoing) => outgoing.send(format!("{line}\n")).is_ok(),
            None => false,
        };
        if !sent {
            tracing::error!("Serial writer is gone, '{}' was not sent", line);
            return;
        }
        tracing::debug!("{} -> {}", context, line);
        let change = self.lock_state().observe(line);
        self.emit_state_change(change);
    }

    fn run_macro(self: Arc<Self>, handler: Arc<dyn Macro>, context: Arc<ExecutorContext>, line: String) {
        tokio::spawn(async move {
            let result = match context.spawn_sub_context(handler.name()) {
                Ok(sub) => {
                    let invocation = MacroInvocation::new(sub.clone(), &line, self.services.objects.snapshot());
                    let result = handler.execute(&self.macros, invocation).await;
                    sub.wait_idle().await;
                    context.release_sub_context();
                    result
                }
                Err(e) => Err(MacroError::from(e)),
            };
            if let Err(e) = result {
                tracing::warn!("{} failed: {}", handler.name(), e);
                self.respond_error(&format!("Error: {e}"));
            }
            context.complete(Some(COMPLETION_MARKER));
        });
    }

    fn lock_state(&self) -> MutexGuard<'_, GcodeState> {
        self.gcode_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outgoing(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<String>>> {
        self.outgoing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_state_change(&self, change: StateChange) {
        if change.toolhead {
            self.services.objects.emit(MotionObjectKind::Toolhead.name());
        }
        if change.gcode_move {
            self.services.objects.emit(MotionObjectKind::GcodeMove.name());
        }
    }

    pub fn queue_gcode(&self, text: &str, important: bool, silent: bool) -> Option<PendingResponse> {
        self.main_context.queue_gcode(text, important, silent)
    }

    /// Publishes a `// message` console line.
    pub fn respond_info(&self, message: &str) {
        let line = format!("// {message}");
        self.services.gcode_store.push_response(&line);
        self.services.events.gcode_response(line);
    }

    /// Publishes a `!! message` console line.
    pub fn respond_error(&self, message: &str) {
        let line = format!("!! {message}");
        self.services.gcode_store.push_response(&line);
        self.services.events.gcode_response(line);
    }

    /// Applies a position report (G-code coordinates) to the state model.
    pub fn update_position(&self, position: [f64; 4], velocity: f64, extruder_velocity: f64) {
        {
            let mut state = self.lock_state();
            let mut machine = position;
            for (axis, value) in machine.iter_mut().enumerate() {
                *value += state.homing_origin[axis];
            }
            state.position = machine;
            state.live_position = machine;
            state.live_velocity = velocity;
            state.live_extruder_velocity = extruder_velocity;
        }
        for kind in [MotionObjectKind::Toolhead, MotionObjectKind::GcodeMove, MotionObjectKind::MotionReport] {
            self.services.objects.emit(kind.name());
        }
    }

    pub fn save_gcode_state(&self, name: &str) {
        let state = self.gcode_state();
        tracing::debug!("Saving g-code state {}", name);
        self.saved_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_ascii_lowercase(), state);
    }

    pub fn saved_gcode_state(&self, name: &str) -> Option<GcodeState> {
        self.saved_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name.to_ascii_lowercase())
            .cloned()
    }

    /// Sends whatever commands bring the live state back to `target` and waits for them.
    pub async fn restore_gcode_state(
        &self,
        context: &Arc<ExecutorContext>,
        target: &GcodeState,
        options: &RestoreOptions,
    ) -> Result<(), ExecutorError> {
        let commands = plan_restore(&self.gcode_state(), target, options);
        if commands.is_empty() {
            return Ok(());
        }
        tracing::debug!("Restoring g-code state: {:?}", commands);
        if let Some(pending) = context.queue_gcode(&commands.join("\n"), false, true) {
            pending.wait().await?;
        }
        Ok(())
    }

    /// Starts shutting the connection down; `closed` resolves when it is done.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Closing connection to {}", self.config.serial.port);
        let _ = self.shutdown_tx.send(());
    }

    fn on_closed(&self) {
        self.closing.store(true, Ordering::Release);
        self.lock_outgoing().take();
        self.watchers.stop_all();
        self.print_manager.teardown();
        self.main_context.close();
        self.services.objects.clear();
        self.closed_tx.send_replace(true);
        tracing::info!("Connection to {} closed", self.config.serial.port);
    }

    pub async fn closed(&self) {
        let mut closed_rx = self.closed_tx.subscribe();
        let _ = closed_rx.wait_for(|closed| *closed).await;
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn firmware_info(&self) -> Option<&FirmwareInfo> {
        self.firmware.get()
    }

    pub fn limits(&self) -> PrinterLimits {
        *self.limits.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn gcode_state(&self) -> GcodeState {
        self.lock_state().clone()
    }

    pub fn main_context(&self) -> &Arc<ExecutorContext> {
        &self.main_context
    }

    pub fn print_manager(&self) -> &Arc<PrintManager> {
        &self.print_manager
    }

    pub fn macros(&self) -> &MacroManager {
        &self.macros
    }

    pub fn objects(&self) -> &Arc<ObjectRegistry> {
        &self.services.objects
    }

    pub fn events(&self) -> &EventBus {
        &self.services.events
    }

    pub fn gcode_store(&self) -> &Arc<GcodeStore> {
        &self.services.gcode_store
    }
}

impl Dispatch for Printer {
    fn dispatch(&self, context: &Arc<ExecutorContext>, line: &str) {
        if let Some(handler) = self.macros.find(line) {
            match self.weak_self.upgrade() {
                Some(printer) => printer.run_macro(handler, context.clone(), line.to_string()),
                None => context.close(),
            }
            return;
        }
        self.write(context.name(), line);
    }

    fn record(&self, line: &str) {
        self.services.gcode_store.push_command(line);
    }
}

async fn write_loop(mut writer: BoxedWriter, mut outgoing: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = outgoing.recv().await {
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::error!("Serial write error: {}", e);
            continue;
        }
        if let Err(e) = writer.flush().await {
            tracing::error!("Serial flush error: {}", e);
        }
    }
    let _ = writer.shutdown().await;
    tracing::debug!("Serial writer task terminated");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MotionObjectKind {
    Toolhead,
    GcodeMove,
    MotionReport,
}

impl MotionObjectKind {
    fn name(&self) -> &'static str {
        match self {
            MotionObjectKind::Toolhead => "toolhead",
            MotionObjectKind::GcodeMove => "gcode_move",
            MotionObjectKind::MotionReport => "motion_report",
        }
    }
}

struct MotionObject {
    printer: Weak<Printer>,
    kind: MotionObjectKind,
}

impl PrinterObject for MotionObject {
    fn name(&self) -> String {
        self.kind.name().to_string()
    }

    fn query(&self) -> Map<String, Value> {
        let Some(printer) = self.printer.upgrade() else { return Map::new() };
        let state = printer.gcode_state();
        match self.kind {
            MotionObjectKind::Toolhead => state.toolhead_status(&printer.limits()),
            MotionObjectKind::GcodeMove => state.gcode_move_status(),
            MotionObjectKind::MotionReport => state.motion_report_status(),
        }
    }
}

struct ConfigFileObject {
    printer: Weak<Printer>,
}

impl PrinterObject for ConfigFileObject {
    fn name(&self) -> String {
        "configfile".to_string()
    }

    fn query(&self) -> Map<String, Value> {
        let Some(printer) = self.printer.upgrade() else { return Map::new() };
        let config = printer.config();
        let limits = printer.limits();
        into_map(json!({
            "settings": {
                "printer": {
                    "max_velocity": limits.max_velocity,
                    "max_accel": limits.max_accel,
                    "max_z_velocity": limits.max_z_velocity,
                    "max_z_accel": limits.max_z_accel,
                    "square_corner_velocity": limits.square_corner_velocity,
                },
                "extruder": config.printer.extruder,
                "heater_bed": config.printer.heater_bed,
                "serial": {
                    "port": config.serial.port,
                    "baud": printer.baud_rate(),
                },
            },
            "save_config_pending": false,
        }))
    }
}

struct McuObject {
    printer: Weak<Printer>,
}

impl PrinterObject for McuObject {
    fn name(&self) -> String {
        "mcu".to_string()
    }

    fn query(&self) -> Map<String, Value> {
        let Some(printer) = self.printer.upgrade() else { return Map::new() };
        let Some(info) = printer.firmware_info() else { return Map::new() };
        into_map(json!({
            "mcu_version": info.firmware_name,
            "mcu_build_versions": info.fields.get("SOURCE_CODE_URL").cloned().unwrap_or_default(),
            "mcu_constants": info.fields,
        }))
    }
}
