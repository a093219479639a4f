// src/print_job.rs - Print job lifecycle: select, stream, pause, resume, cancel
use crate::file_manager::{FileManager, FileManagerError};
use crate::gcode::executor::{ExecutorContext, ExecutorError};
use crate::gcode::parser::strip_comment;
use crate::objects::{ObjectRegistry, PrinterObject};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// Command used to wait until all queued moves have finished.
pub const DRAIN_COMMAND: &str = "M400";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrintState {
    Standby,
    Printing,
    Paused,
    Complete,
    Cancelled,
    Error,
}

impl PrintState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrintState::Standby => "standby",
            PrintState::Printing => "printing",
            PrintState::Paused => "paused",
            PrintState::Complete => "complete",
            PrintState::Cancelled => "cancelled",
            PrintState::Error => "error",
        }
    }

    /// A job is running or paused.
    pub fn is_active(&self) -> bool {
        matches!(self, PrintState::Printing | PrintState::Paused)
    }
}

impl std::fmt::Display for PrintState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PrintError {
    #[error("Cannot change the loaded file while a print is {0}")]
    AlreadyPrinting(PrintState),
    #[error("No file is loaded")]
    NoFileSelected,
    #[error("Cannot {action} while {state}")]
    InvalidTransition { action: &'static str, state: PrintState },
    #[error(transparent)]
    File(#[from] FileManagerError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

#[derive(Debug, Clone)]
pub struct PrintJob {
    pub id: Uuid,
    pub filename: String,
    pub path: PathBuf,
    pub file_size: u64,
    pub file_position: u64,
}

impl PrintJob {
    pub fn progress(&self) -> f64 {
        if self.file_size == 0 {
            0.0
        } else {
            (self.file_position as f64 / self.file_size as f64).min(1.0)
        }
    }
}

struct Status {
    state: PrintState,
    message: String,
    job: Option<PrintJob>,
    cancelled: Arc<AtomicBool>,
    /// Set while printing; paused time is excluded from `print_duration`.
    printing_since: Option<Instant>,
    print_duration: Duration,
    started_at: Option<Instant>,
    total_duration: Option<Duration>,
}

impl Status {
    fn accumulate(&mut self) {
        if let Some(since) = self.printing_since.take() {
            self.print_duration += since.elapsed();
        }
    }

    fn end(&mut self, state: PrintState, message: &str) {
        self.accumulate();
        self.cancelled.store(true, Ordering::Release);
        self.state = state;
        self.message = message.to_string();
        self.total_duration = self.started_at.map(|started| started.elapsed());
    }

    fn print_duration(&self) -> Duration {
        self.print_duration + self.printing_since.map_or(Duration::ZERO, |since| since.elapsed())
    }

    fn total_duration(&self) -> Duration {
        self.total_duration
            .or_else(|| self.started_at.map(|started| started.elapsed()))
            .unwrap_or(Duration::ZERO)
    }
}

pub struct PrintManager {
    main: Arc<ExecutorContext>,
    objects: Arc<ObjectRegistry>,
    files: FileManager,
    status: Mutex<Status>,
    /// Held while paused; the streamer takes it before every line.
    gate: Arc<tokio::sync::Mutex<()>>,
    pause_guard: Mutex<Option<OwnedMutexGuard<()>>>,
}

impl PrintManager {
    pub fn new(main: Arc<ExecutorContext>, objects: Arc<ObjectRegistry>, gcode_dir: impl AsRef<Path>) -> Arc<Self> {
        Arc::new(Self {
            main,
            objects,
            files: FileManager::new(gcode_dir.as_ref()),
            status: Mutex::new(Status {
                state: PrintState::Standby,
                message: String::new(),
                job: None,
                cancelled: Arc::new(AtomicBool::new(false)),
                printing_since: None,
                print_duration: Duration::ZERO,
                started_at: None,
                total_duration: None,
            }),
            gate: Arc::new(tokio::sync::Mutex::new(())),
            pause_guard: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_gate(&self) {
        self.pause_guard.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn state(&self) -> PrintState {
        self.lock().state
    }

    pub fn is_printing(&self) -> bool {
        self.state() == PrintState::Printing
    }

    pub fn current_job(&self) -> Option<PrintJob> {
        self.lock().job.clone()
    }

    pub fn register_objects(self: &Arc<Self>) {
        for kind in [PrintObjectKind::PrintStats, PrintObjectKind::VirtualSdcard, PrintObjectKind::PauseResume] {
            self.objects.register(Arc::new(PrintObject { manager: Arc::downgrade(self), kind }));
        }
    }

    fn emit(&self) {
        for kind in [PrintObjectKind::PrintStats, PrintObjectKind::VirtualSdcard, PrintObjectKind::PauseResume] {
            self.objects.emit(kind.name());
        }
    }

    /// Loads a file for printing. Rejected while a job is printing or paused.
    pub async fn select_file(&self, filename: &str) -> Result<(), PrintError> {
        let state = self.state();
        if state.is_active() {
            return Err(PrintError::AlreadyPrinting(state));
        }
        let info = self.files.inspect(filename).await?;
        {
            let mut status = self.lock();
            if status.state.is_active() {
                return Err(PrintError::AlreadyPrinting(status.state));
            }
            status.job = Some(PrintJob {
                id: Uuid::new_v4(),
                filename: filename.to_string(),
                path: info.path,
                file_size: info.size,
                file_position: 0,
            });
            status.state = PrintState::Standby;
            status.message.clear();
            status.print_duration = Duration::ZERO;
            status.started_at = None;
            status.total_duration = None;
        }
        tracing::info!("Loaded file {} ({} bytes)", filename, info.size);
        self.emit();
        Ok(())
    }

    pub fn reset_file(&self) -> Result<(), PrintError> {
        {
            let mut status = self.lock();
            if status.state.is_active() {
                return Err(PrintError::AlreadyPrinting(status.state));
            }
            status.job = None;
            status.state = PrintState::Standby;
            status.message.clear();
            status.print_duration = Duration::ZERO;
            status.started_at = None;
            status.total_duration = None;
        }
        self.emit();
        Ok(())
    }

    /// Starts streaming the loaded file from its beginning.
    pub fn start(self: &Arc<Self>) -> Result<(), PrintError> {
        let (path, cancelled) = {
            let mut status = self.lock();
            if status.state.is_active() {
                return Err(PrintError::InvalidTransition { action: "start", state: status.state });
            }
            let job = status.job.as_mut().ok_or(PrintError::NoFileSelected)?;
            job.file_position = 0;
            let path = job.path.clone();
            let filename = job.filename.clone();
            let now = Instant::now();
            let cancelled = Arc::new(AtomicBool::new(false));
            status.cancelled = cancelled.clone();
            status.state = PrintState::Printing;
            status.message.clear();
            status.print_duration = Duration::ZERO;
            status.printing_since = Some(now);
            status.started_at = Some(now);
            status.total_duration = None;
            tracing::info!("Starting print of {}", filename);
            (path, cancelled)
        };
        self.release_gate();
        self.emit();

        let manager = self.clone();
        tokio::spawn(async move { manager.stream(path, cancelled).await });
        Ok(())
    }

    async fn stream(self: Arc<Self>, path: PathBuf, cancelled: Arc<AtomicBool>) {
        let result = self.stream_lines(&path, &cancelled).await;
        if cancelled.load(Ordering::Acquire) {
            tracing::debug!("Streaming of {} stopped", path.display());
            return;
        }
        match result {
            Ok(()) => {
                if let Err(e) = drain(&self.main).await {
                    tracing::warn!("Final drain failed: {}", e);
                }
                let _gate = self.gate.lock().await;
                self.finish(&cancelled, PrintState::Complete, "");
            }
            Err(e) => {
                tracing::error!("Print of {} failed: {}", path.display(), e);
                self.finish(&cancelled, PrintState::Error, &e.to_string());
            }
        }
    }

    async fn stream_lines(&self, path: &Path, cancelled: &AtomicBool) -> Result<(), PrintError> {
        let file = tokio::fs::File::open(path).await?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        loop {
            drop(self.gate.lock().await);
            if cancelled.load(Ordering::Acquire) {
                return Ok(());
            }
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf).await?;
            if read == 0 {
                return Ok(());
            }
            let text = String::from_utf8_lossy(&buf);
            let line = strip_comment(&text);
            if let Some(pending) = self.main.queue_gcode(line, false, true) {
                pending.wait().await?;
            }
            if !self.advance(cancelled, read as u64) {
                return Ok(());
            }
        }
    }

    /// Moves the byte offset of the run owning `cancelled`. A run that has
    /// ended (possibly replaced by a newer one) leaves the job untouched.
    fn advance(&self, cancelled: &AtomicBool, bytes: u64) -> bool {
        {
            let mut status = self.lock();
            if cancelled.load(Ordering::Acquire) {
                return false;
            }
            if let Some(job) = status.job.as_mut() {
                job.file_position += bytes;
            }
        }
        self.objects.emit(PrintObjectKind::VirtualSdcard.name());
        true
    }

    fn finish(&self, cancelled: &AtomicBool, state: PrintState, message: &str) {
        {
            let mut status = self.lock();
            if cancelled.load(Ordering::Acquire) || status.state != PrintState::Printing {
                return;
            }
            status.end(state, message);
        }
        tracing::info!("Print finished: {}", state);
        self.emit();
    }

    /// Blocks the streamer between lines and waits for queued moves to finish.
    pub async fn pause(&self, context: &Arc<ExecutorContext>) -> Result<(), PrintError> {
        let state = self.state();
        if state != PrintState::Printing {
            return Err(PrintError::InvalidTransition { action: "pause", state });
        }
        // The streamer holds the gate while it finishes a job; the state only
        // changes once the gate is ours.
        let guard = self.gate.clone().lock_owned().await;
        {
            let mut status = self.lock();
            if status.state != PrintState::Printing {
                return Err(PrintError::InvalidTransition { action: "pause", state: status.state });
            }
            status.accumulate();
            status.state = PrintState::Paused;
        }
        *self.pause_guard.lock().unwrap_or_else(PoisonError::into_inner) = Some(guard);
        tracing::info!("Print paused");
        self.emit();
        drain(context).await?;
        Ok(())
    }

    pub fn resume(&self) -> Result<(), PrintError> {
        {
            let mut status = self.lock();
            if status.state != PrintState::Paused {
                return Err(PrintError::InvalidTransition { action: "resume", state: status.state });
            }
            status.state = PrintState::Printing;
            status.printing_since = Some(Instant::now());
        }
        self.release_gate();
        tracing::info!("Print resumed");
        self.emit();
        Ok(())
    }

    pub async fn cancel(&self, context: &Arc<ExecutorContext>) -> Result<(), PrintError> {
        {
            let mut status = self.lock();
            if !status.state.is_active() {
                return Err(PrintError::InvalidTransition { action: "cancel", state: status.state });
            }
            status.end(PrintState::Cancelled, "");
        }
        self.release_gate();
        tracing::info!("Print cancelled");
        self.emit();
        drain(context).await?;
        Ok(())
    }

    /// Stops any active job when the connection goes away.
    pub fn teardown(&self) {
        let was_active = {
            let mut status = self.lock();
            let active = status.state.is_active();
            if active {
                status.end(PrintState::Cancelled, "Lost connection to printer");
            }
            active
        };
        self.release_gate();
        if was_active {
            tracing::warn!("Print cancelled: connection closed");
            self.emit();
        }
    }

    fn status_object(&self, kind: PrintObjectKind) -> Map<String, Value> {
        let status = self.lock();
        let job = status.job.as_ref();
        let value = match kind {
            PrintObjectKind::PrintStats => json!({
                "filename": job.map_or("", |j| j.filename.as_str()),
                "total_duration": status.total_duration().as_secs_f64(),
                "print_duration": status.print_duration().as_secs_f64(),
                "filament_used": 0.0,
                "state": status.state,
                "message": status.message,
                "info": { "total_layer": null, "current_layer": null },
            }),
            PrintObjectKind::VirtualSdcard => json!({
                "file_path": job.map(|j| j.path.display().to_string()),
                "progress": job.map_or(0.0, PrintJob::progress),
                "is_active": status.state == PrintState::Printing,
                "file_position": job.map_or(0, |j| j.file_position),
                "file_size": job.map_or(0, |j| j.file_size),
            }),
            PrintObjectKind::PauseResume => json!({
                "is_paused": status.state == PrintState::Paused,
            }),
        };
        crate::gcode::state::into_map(value)
    }
}

async fn drain(context: &Arc<ExecutorContext>) -> Result<(), ExecutorError> {
    if let Some(pending) = context.queue_gcode(DRAIN_COMMAND, false, true) {
        pending.wait().await?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrintObjectKind {
    PrintStats,
    VirtualSdcard,
    PauseResume,
}

impl PrintObjectKind {
    fn name(&self) -> &'static str {
        match self {
            PrintObjectKind::PrintStats => "print_stats",
            PrintObjectKind::VirtualSdcard => "virtual_sdcard",
            PrintObjectKind::PauseResume => "pause_resume",
        }
    }
}

struct PrintObject {
    manager: Weak<PrintManager>,
    kind: PrintObjectKind,
}

impl PrinterObject for PrintObject {
    fn name(&self) -> String {
        self.kind.name().to_string()
    }

    fn query(&self) -> Map<String, Value> {
        self.manager
            .upgrade()
            .map(|manager| manager.status_object(self.kind))
            .unwrap_or_default()
    }
}
