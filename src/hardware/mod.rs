// src/hardware/mod.rs - Watchers that keep temperature and position objects current
pub mod position;
pub mod temperature;

pub use position::{PositionSource, PositionWatcher};
pub use temperature::TemperatureWatcher;

use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WatcherError {
    #[error("A {0} watcher is already registered")]
    Duplicate(&'static str),
}

/// A periodic or autoreport-driven source of printer state. Each watcher may
/// claim incoming lines before they reach the command router.
#[derive(Clone)]
pub enum Watcher {
    Temperature(Arc<TemperatureWatcher>),
    Position(Arc<PositionWatcher>),
}

impl Watcher {
    pub fn kind(&self) -> &'static str {
        match self {
            Watcher::Temperature(_) => "temperature",
            Watcher::Position(_) => "position",
        }
    }

    /// Returns true when the line was consumed.
    pub fn handle(&self, line: &str) -> bool {
        match self {
            Watcher::Temperature(watcher) => watcher.handle(line),
            Watcher::Position(watcher) => watcher.handle(line),
        }
    }

    pub fn start(&self) {
        match self {
            Watcher::Temperature(watcher) => watcher.start(),
            Watcher::Position(watcher) => watcher.start(),
        }
    }

    pub fn stop(&self) {
        match self {
            Watcher::Temperature(watcher) => watcher.stop(),
            Watcher::Position(watcher) => watcher.stop(),
        }
    }
}

/// Registered watchers in registration order. At most one of each kind, so a
/// source can never be both polled and autoreported.
#[derive(Default)]
pub struct WatcherSet {
    watchers: RwLock<Vec<Watcher>>,
}

impl WatcherSet {
    pub fn add(&self, watcher: Watcher) -> Result<(), WatcherError> {
        let mut watchers = self.watchers.write().unwrap_or_else(PoisonError::into_inner);
        if watchers.iter().any(|existing| existing.kind() == watcher.kind()) {
            return Err(WatcherError::Duplicate(watcher.kind()));
        }
        tracing::debug!("Registered {} watcher", watcher.kind());
        watchers.push(watcher);
        Ok(())
    }

    /// Offers a line to each watcher in turn until one claims it.
    pub fn offer(&self, line: &str) -> bool {
        let watchers = self.watchers.read().unwrap_or_else(PoisonError::into_inner).clone();
        watchers.iter().any(|watcher| watcher.handle(line))
    }

    pub fn start_all(&self) {
        for watcher in self.watchers.read().unwrap_or_else(PoisonError::into_inner).iter() {
            watcher.start();
        }
    }

    pub fn stop_all(&self) {
        let watchers: Vec<Watcher> = self.watchers.write().unwrap_or_else(PoisonError::into_inner).drain(..).collect();
        for watcher in watchers {
            watcher.stop();
        }
    }

    pub fn len(&self) -> usize {
        self.watchers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::ObjectRegistry;
    use std::sync::Weak;
    use std::time::Duration;

    #[test]
    fn one_watcher_per_kind() {
        let objects = Arc::new(ObjectRegistry::new());
        let set = WatcherSet::default();
        set.add(Watcher::Temperature(TemperatureWatcher::new(Weak::new(), objects.clone(), false))).unwrap();
        set.add(Watcher::Position(PositionWatcher::new(Weak::new(), PositionSource::AutoReport))).unwrap();

        let polled_twice = Watcher::Temperature(TemperatureWatcher::new(Weak::new(), objects.clone(), true));
        assert_eq!(set.add(polled_twice), Err(WatcherError::Duplicate("temperature")));
        let position_twice = Watcher::Position(PositionWatcher::new(Weak::new(), PositionSource::Poll(Duration::from_secs(1))));
        assert_eq!(set.add(position_twice), Err(WatcherError::Duplicate("position")));
        assert_eq!(set.len(), 2);

        assert!(set.offer("T:20.00 /0.00 B:19.50 /0.00 @:0 B@:0"));
        assert!(objects.contains("extruder"));
        assert!(set.offer("X:1.00 Y:2.00 Z:3.00 E:0.00 Count X:0 Y:0 Z:0"));
        assert!(!set.offer("ok"));

        set.stop_all();
        assert!(set.is_empty());
    }
}
