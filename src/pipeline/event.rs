//! Control-plane events and the bus that carries them off the data thread

use log::debug;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Coarse classification of an error posted by a stage or source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A stage failed while processing a frame
    Stream,
    /// A stage could not acquire or release a resource (file, device)
    Resource,
    /// The source failed to produce a frame
    Source,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Stream => "stream",
            ErrorCode::Resource => "resource",
            ErrorCode::Source => "source",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Out-of-band message emitted by the graph, distinct from the frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// Stage-specific structured data
    Element {
        source: String,
        fields: Map<String, Value>,
    },
    /// The source ran dry
    EndOfStream { source: String },
    Error { code: ErrorCode, message: String },
}

impl ControlEvent {
    pub fn element(source: &str, fields: Map<String, Value>) -> Self {
        ControlEvent::Element {
            source: source.to_string(),
            fields,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ControlEvent::Error {
            code,
            message: message.into(),
        }
    }
}

type Handler = Arc<dyn Fn(ControlEvent) + Send + Sync>;

/// Delivery point for control events.
///
/// The handler runs on whichever thread posts, usually the data thread, so it
/// must only hand the event off (push onto a queue) and return.
#[derive(Clone, Default)]
pub struct Bus {
    handler: Option<Handler>,
}

impl Bus {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(ControlEvent) + Send + Sync + 'static,
    {
        Self {
            handler: Some(Arc::new(handler)),
        }
    }

    pub fn post(&self, event: ControlEvent) {
        match &self.handler {
            Some(handler) => handler(event),
            None => debug!("Bus: no subscriber, dropping {:?}", event),
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.handler.is_some()
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}
