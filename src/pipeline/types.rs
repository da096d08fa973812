//! Core types carried through the stage graph

use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Timestamp representation for frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp {
    /// Microseconds since the source started
    pub micros: i64,
}

impl Timestamp {
    /// Create a new timestamp from microseconds
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Create a timestamp from a duration since the source started
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            micros: duration.as_micros() as i64,
        }
    }

    /// Create a timestamp from instant relative to base
    pub fn from_instant(instant: Instant, base: Instant) -> Self {
        Self::from_duration(instant.saturating_duration_since(base))
    }

    /// Convert to duration (negative timestamps clamp to zero)
    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.micros.max(0) as u64)
    }

    /// Calculate the absolute difference between two timestamps
    pub fn diff(&self, other: Timestamp) -> Duration {
        Duration::from_micros(self.micros.abs_diff(other.micros))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}µs", self.micros)
    }
}

/// A single video frame travelling through the graph.
///
/// The payload is reference counted so fan-out at a junction only clones
/// the handle, never the pixels.
#[derive(Clone)]
pub struct Frame {
    /// Raw or encoded payload
    pub data: Bytes,

    /// Presentation timestamp
    pub pts: Timestamp,

    /// Monotonic sequence number assigned by the source
    pub sequence: u64,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,
}

impl Frame {
    /// Create a new video frame
    pub fn video(data: Bytes, pts: Timestamp, sequence: u64, width: u32, height: u32) -> Self {
        Self {
            data,
            pts,
            sequence,
            width,
            height,
        }
    }

    /// Get the size of the frame data in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("pts", &self.pts)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("size", &self.size())
            .finish()
    }
}

/// Media type carried on a link, e.g. `video/x-raw,width=160,height=120`.
///
/// `Caps::any()` matches everything and is what pass-through stages report.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Caps {
    media_type: Option<String>,
    fields: BTreeMap<String, String>,
}

impl Caps {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn new(media_type: &str) -> Self {
        Self {
            media_type: Some(media_type.to_string()),
            fields: BTreeMap::new(),
        }
    }

    /// Parse the compact `type/subtype,key=value,...` notation.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split(',').map(str::trim);
        let media_type = parts.next().filter(|m| m.contains('/'))?;
        let mut caps = Self::new(media_type);
        for part in parts.filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=')?;
            caps.fields
                .insert(key.trim().to_string(), value.trim().to_string());
        }
        Some(caps)
    }

    pub fn media_type(&self) -> Option<&str> {
        self.media_type.as_deref()
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn is_any(&self) -> bool {
        self.media_type.is_none()
    }

    /// Two caps are compatible when either side is unconstrained, or the
    /// media types match and every field present on both sides agrees.
    pub fn can_intersect(&self, other: &Caps) -> bool {
        match (&self.media_type, &other.media_type) {
            (None, _) | (_, None) => true,
            (Some(a), Some(b)) if a != b => false,
            _ => self
                .fields
                .iter()
                .all(|(k, v)| other.fields.get(k).is_none_or(|o| o == v)),
        }
    }
}

impl std::fmt::Display for Caps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.media_type {
            None => write!(f, "ANY"),
            Some(media_type) => {
                write!(f, "{}", media_type)?;
                for (k, v) in &self.fields {
                    write!(f, ",{}={}", k, v)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps_parse() {
        let caps = Caps::parse("video/x-raw,width=160,height=120").unwrap();
        assert_eq!(caps.media_type(), Some("video/x-raw"));
        assert_eq!(caps.field("width"), Some("160"));
        assert_eq!(caps.to_string(), "video/x-raw,height=120,width=160");

        assert!(Caps::parse("queue").is_none());
        assert!(Caps::parse("video/x-raw,broken").is_none());
    }

    #[test]
    fn test_caps_intersection() {
        let raw = Caps::new("video/x-raw");
        let small = Caps::parse("video/x-raw,width=160").unwrap();
        let other = Caps::parse("video/x-raw,width=320").unwrap();
        let jpeg = Caps::new("image/jpeg");

        assert!(Caps::any().can_intersect(&jpeg));
        assert!(raw.can_intersect(&small));
        assert!(!small.can_intersect(&other));
        assert!(!raw.can_intersect(&jpeg));
    }

    #[test]
    fn test_timestamp_diff() {
        let a = Timestamp::from_micros(1_500_000);
        let b = Timestamp::from_micros(500_000);
        assert_eq!(a.diff(b), Duration::from_secs(1));
        assert_eq!(b.diff(a), Duration::from_secs(1));
        assert_eq!(Timestamp::from_micros(-5).as_duration(), Duration::ZERO);
    }
}
