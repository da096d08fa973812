use log::{debug, warn};

use super::beacon::{Beacon, DomainEvent};
use crate::pipeline::event::ControlEvent;
use crate::stages::motion::{MOTION_BEGIN, MOTION_FINISHED};

/// Turns control events into domain events.
///
/// Element events only count when posted by the analysis stage; anything it
/// posts without a known key is logged and dropped.
#[derive(Debug, Clone)]
pub struct EventRouter {
    analysis: String,
}

impl EventRouter {
    pub fn new(analysis: impl Into<String>) -> Self {
        Self {
            analysis: analysis.into(),
        }
    }

    pub fn classify(&self, event: &ControlEvent) -> Option<DomainEvent> {
        match event {
            ControlEvent::Element { source, fields } if *source == self.analysis => {
                if fields.contains_key(MOTION_BEGIN) {
                    Some(DomainEvent::Begin)
                } else if fields.contains_key(MOTION_FINISHED) {
                    Some(DomainEvent::Finished)
                } else {
                    warn!(
                        "EventRouter: unrecognized payload from {}: {:?}",
                        source, fields
                    );
                    None
                }
            }
            ControlEvent::Element { source, .. } => {
                debug!("EventRouter: ignoring element event from {}", source);
                None
            }
            ControlEvent::EndOfStream { .. } => Some(DomainEvent::Eos),
            ControlEvent::Error { code, message } => Some(DomainEvent::Error {
                code: *code,
                message: message.clone(),
            }),
        }
    }

    /// Classify `event` and emit the result on `beacon`, returning it.
    pub fn dispatch(&self, event: &ControlEvent, beacon: &Beacon) -> Option<DomainEvent> {
        let domain = self.classify(event)?;
        beacon.emit(&domain);
        Some(domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::beacon::{EventKind, watcher};
    use crate::pipeline::event::ErrorCode;
    use serde_json::{Map, Value, json};
    use std::sync::{Arc, Mutex};

    fn element(source: &str, key: &str) -> ControlEvent {
        let mut fields = Map::new();
        fields.insert(key.to_string(), json!(0));
        ControlEvent::element(source, fields)
    }

    #[test]
    fn test_dispatch_order() {
        let router = EventRouter::new("motion-detector");
        let beacon = Beacon::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let w = watcher(move |e| s.lock().unwrap().push(e.kind()));
        for kind in EventKind::ALL {
            beacon.watch(kind, w.clone());
        }

        for event in [
            element("motion-detector", MOTION_BEGIN),
            element("motion-detector", MOTION_FINISHED),
            ControlEvent::EndOfStream {
                source: "testsrc0".to_string(),
            },
        ] {
            router.dispatch(&event, &beacon);
        }

        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::Begin, EventKind::Finished, EventKind::Eos]
        );
    }

    #[test]
    fn test_ignored_payloads() {
        let router = EventRouter::new("motion-detector");
        assert_eq!(router.classify(&element("motion-detector", "cells")), None);
        assert_eq!(router.classify(&element("other", MOTION_BEGIN)), None);
        assert_eq!(
            router.classify(&ControlEvent::element("motion-detector", Map::<String, Value>::new())),
            None
        );
    }

    #[test]
    fn test_errors_always_surface() {
        let router = EventRouter::new("motion-detector");
        let event = ControlEvent::error(ErrorCode::Resource, "sink: disk full");
        assert_eq!(
            router.classify(&event),
            Some(DomainEvent::Error {
                code: ErrorCode::Resource,
                message: "sink: disk full".to_string()
            })
        );
    }
}
