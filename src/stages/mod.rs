//! Built-in stage library
//!
//! Converters and encoders pass frames through untouched and only advertise
//! the caps their output would carry. Real media processing plugs in through
//! [`StageRegistry::register`].

pub mod motion;
pub mod passthrough;
pub mod sink;
pub mod tee;
pub mod testsrc;

use crate::error::Error;
use crate::pipeline::describe::CAPSFILTER;
use crate::pipeline::registry::StageRegistry;
use crate::pipeline::stage::Element;
use crate::pipeline::types::Caps;

pub use motion::MotionCells;
pub use passthrough::Passthrough;
pub use sink::{FakeSink, FileSink};
pub use tee::Tee;
pub use testsrc::TestSource;

/// Converters that keep whatever they are given
const IDENTITY_KINDS: &[&str] = &["queue", "identity", "videoconvert", "videoscale"];

/// Pass-through stages that advertise a fixed output type
const TYPED_KINDS: &[(&str, &str)] = &[
    ("decodebin", "video/x-raw"),
    ("jpegenc", "image/jpeg"),
    ("x264enc", "video/x-h264"),
    ("mp4mux", "video/quicktime"),
];

/// Display sinks; frames are counted and discarded
const DISPLAY_KINDS: &[&str] = &["autovideosink", "xvimagesink"];

pub fn fakesink() -> Element {
    Element::Stage(Box::new(FakeSink::new("fakesink")))
}

pub fn register_builtins(registry: &mut StageRegistry) {
    for &kind in IDENTITY_KINDS {
        registry.register(kind, move |_| {
            Ok(Element::Stage(Box::new(Passthrough::new(kind, Caps::any()))))
        });
    }

    for &(kind, caps) in TYPED_KINDS {
        registry.register(kind, move |_| {
            Ok(Element::Stage(Box::new(Passthrough::new(kind, Caps::new(caps)))))
        });
    }

    registry.register(CAPSFILTER, |spec| {
        let raw = spec.property("caps").unwrap_or_default();
        let caps = Caps::parse(raw).ok_or_else(|| Error::parse(format!("bad caps {:?}", raw)))?;
        Ok(Element::Stage(Box::new(Passthrough::filter(caps))))
    });

    registry.register("tee", |_| Ok(Element::Stage(Box::new(Tee::new()))));
    registry.register("fakesink", |_| Ok(fakesink()));
    for &kind in DISPLAY_KINDS {
        registry.register(kind, move |_| {
            Ok(Element::Stage(Box::new(FakeSink::new(kind))))
        });
    }
    registry.register("filesink", |spec| {
        Ok(Element::Stage(Box::new(FileSink::from_spec(spec)?)))
    });
    registry.register("testsrc", |spec| {
        Ok(Element::Source(Box::new(TestSource::from_spec(spec)?)))
    });
    registry.register("motioncells", |spec| {
        Ok(Element::Stage(Box::new(MotionCells::from_spec(spec)?)))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::describe::parse;

    #[test]
    fn test_builtins_cover_default_descriptions() {
        let registry = StageRegistry::with_builtins();
        for desc in [
            "testsrc ! decodebin ! videoconvert ! tee name=output ! fakesink",
            "queue name=live-input ! videoconvert ! queue ! xvimagesink",
            "queue ! jpegenc ! filesink location=/tmp/x.jpg",
            "queue ! x264enc ! mp4mux ! queue ! filesink location=/tmp/x.mp4",
            "videoscale ! video/x-raw,width=160,height=120 ! motioncells gap=3",
        ] {
            for spec in parse(desc).unwrap().elements {
                assert!(registry.make(&spec).is_ok(), "{} from {}", spec.kind, desc);
            }
        }
    }

    #[test]
    fn test_unknown_kind() {
        let registry = StageRegistry::with_builtins();
        let spec = parse("v4l2src").unwrap().elements.remove(0);
        assert!(matches!(registry.make(&spec), Err(Error::Parse(_))));
    }
}
