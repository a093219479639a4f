// src/hardware/position.rs - Live toolhead position from M114 polling or position autoreport
use crate::communication::responses::parse_m114;
use crate::printer::Printer;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

pub const POSITION_COMMAND: &str = "M114";
pub const POSITION_POLL_INTERVAL: Duration = Duration::from_millis(1000);
pub const VELOCITY_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Samples further apart than this give no velocity.
pub const VELOCITY_STALE_AFTER: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSource {
    AutoReport,
    Poll(Duration),
}

/// Planar and extruder speed in mm/s between two samples.
pub fn velocity(previous: [f64; 4], current: [f64; 4], elapsed: Duration) -> (f64, f64) {
    if elapsed.is_zero() || elapsed >= VELOCITY_STALE_AFTER {
        return (0.0, 0.0);
    }
    let secs = elapsed.as_secs_f64();
    let distance = (0..3).map(|axis| (current[axis] - previous[axis]).powi(2)).sum::<f64>().sqrt();
    (distance / secs, (current[3] - previous[3]) / secs)
}

pub struct PositionWatcher {
    printer: Weak<Printer>,
    source: PositionSource,
    last_sample: Mutex<Option<(Instant, [f64; 4])>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl PositionWatcher {
    pub fn new(printer: Weak<Printer>, source: PositionSource) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self { printer, source, last_sample: Mutex::new(None), shutdown_tx })
    }

    /// Only autoreported positions are claimed; polled ones arrive as responses.
    pub fn handle(&self, line: &str) -> bool {
        if self.source != PositionSource::AutoReport {
            return false;
        }
        match parse_m114(line) {
            Some(position) => {
                self.record(position);
                true
            }
            None => false,
        }
    }

    pub fn start(self: &Arc<Self>) {
        let PositionSource::Poll(period) = self.source else {
            tracing::info!("Position is autoreported");
            return;
        };
        let watcher = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => watcher.poll().await,
                }
            }
            tracing::debug!("Position polling stopped");
        });
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    async fn poll(&self) {
        let pending = match self.printer.upgrade() {
            // M114 would sit between print lines; skip while printing.
            Some(printer) if printer.print_manager().is_printing() => return,
            Some(printer) => printer.queue_gcode(POSITION_COMMAND, false, true),
            None => return,
        };
        let Some(pending) = pending else { return };
        match pending.wait().await {
            Ok(response) => match response.lines().find_map(parse_m114) {
                Some(position) => self.record(position),
                None => tracing::debug!("No position in M114 response: {:?}", response),
            },
            Err(e) => tracing::debug!("Position poll failed: {}", e),
        }
    }

    fn record(&self, position: [f64; 4]) {
        let now = Instant::now();
        let previous = self.last_sample.lock().unwrap_or_else(PoisonError::into_inner).replace((now, position));
        let (speed, extruder_speed) = match previous {
            Some((at, last)) => velocity(last, position, now.duration_since(at)),
            None => (0.0, 0.0),
        };
        if let Some(printer) = self.printer.upgrade() {
            printer.update_position(position, speed, extruder_speed);
        }
    }
}
