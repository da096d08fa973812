//! Domain event fan-out to application watchers

use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::pipeline::event::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Ready,
    Begin,
    Finished,
    Eos,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Ready,
        EventKind::Begin,
        EventKind::Finished,
        EventKind::Eos,
        EventKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Ready => "ready",
            EventKind::Begin => "begin",
            EventKind::Finished => "finished",
            EventKind::Eos => "eos",
            EventKind::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    /// The backbone is running
    Ready,
    /// Motion started
    Begin,
    /// Motion stopped for at least the configured gap
    Finished,
    Eos,
    Error { code: ErrorCode, message: String },
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::Ready => EventKind::Ready,
            DomainEvent::Begin => EventKind::Begin,
            DomainEvent::Finished => EventKind::Finished,
            DomainEvent::Eos => EventKind::Eos,
            DomainEvent::Error { .. } => EventKind::Error,
        }
    }
}

/// A watcher callback. Identity is the allocation: the same `Watcher` clone
/// registers once, two separately created closures are two watchers.
pub type Watcher = Arc<dyn Fn(&DomainEvent) + Send + Sync>;

pub fn watcher<F>(f: F) -> Watcher
where
    F: Fn(&DomainEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Watcher registry keyed by event kind.
#[derive(Default)]
pub struct Beacon {
    watchers: RwLock<HashMap<EventKind, Vec<Watcher>>>,
}

impl Beacon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `watcher` for `kind`. Returns false if it was already there.
    pub fn watch(&self, kind: EventKind, watcher: Watcher) -> bool {
        let Ok(mut watchers) = self.watchers.write() else {
            return false;
        };
        let list = watchers.entry(kind).or_default();
        if list.iter().any(|w| Arc::ptr_eq(w, &watcher)) {
            return false;
        }
        list.push(watcher);
        true
    }

    /// Remove `watcher` from `kind`. Returns false if it was not registered.
    pub fn unwatch(&self, kind: EventKind, watcher: &Watcher) -> bool {
        let Ok(mut watchers) = self.watchers.write() else {
            return false;
        };
        let Some(list) = watchers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|w| !Arc::ptr_eq(w, watcher));
        before != list.len()
    }

    pub fn watcher_count(&self, kind: EventKind) -> usize {
        self.watchers
            .read()
            .map(|w| w.get(&kind).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Call every watcher of the event's kind, in registration order.
    ///
    /// The list is copied first so watchers may (un)register from inside the
    /// callback.
    pub fn emit(&self, event: &DomainEvent) {
        let watchers = self
            .watchers
            .read()
            .map(|w| w.get(&event.kind()).cloned().unwrap_or_default())
            .unwrap_or_default();
        debug!("Beacon: {} to {} watcher(s)", event.kind(), watchers.len());
        for watcher in watchers {
            watcher(event);
        }
    }
}

impl std::fmt::Debug for Beacon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for kind in EventKind::ALL {
            map.entry(&kind, &self.watcher_count(kind));
        }
        map.finish()
    }
}
