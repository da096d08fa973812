//! Backbone and branch descriptions

use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};
use crate::pipeline::describe;

pub const LIVE: &str = "live";
pub const SNAPSHOT: &str = "snapshot";
pub const ENCODE: &str = "encode";

/// Branch parameter naming the snapshot file, without extension
pub const SNAPSHOT_OUTPUT: &str = "snapshot_output";
/// Branch parameter naming the recording file, without extension
pub const ENCODE_OUTPUT: &str = "encode_output";

/// Last stage of the snapshot branch; its input link carries the barrier
pub const SNAPSHOT_SINK: &str = "snapshot-filesink";

pub const DEFAULT_JUNCTION: &str = "output";
pub const DEFAULT_ANALYSIS: &str = "motion-detector";

/// Capture, decode, fan-out and analysis. `{src}` and `{motion_gap}` are
/// filled from configuration.
pub const BACKBONE: &str = "{src} ! decodebin ! videoconvert ! tee name=output \
    output. ! queue ! videoscale ! video/x-raw,width=160,height=120 \
    ! motioncells name=motion-detector gap={motion_gap} ! fakesink";

static DEFAULT_BRANCHES: Lazy<BTreeMap<&'static str, &'static str>> = Lazy::new(|| {
    BTreeMap::from([
        (
            LIVE,
            "queue name=live-input ! videoconvert ! queue ! xvimagesink",
        ),
        (
            SNAPSHOT,
            "queue name=snapshot-input ! jpegenc \
             ! filesink name=snapshot-filesink location={snapshot_output}.jpg",
        ),
        (
            ENCODE,
            "queue name=encode-input ! videoconvert ! x264enc ! mp4mux ! queue \
             ! filesink location={encode_output}.mp4",
        ),
    ])
});

/// Name of the stage a branch is linked into from the junction
pub fn input_name(branch: &str) -> String {
    format!("{}-input", branch)
}

/// Known branch descriptions, by branch name
#[derive(Debug, Clone)]
pub struct BranchCatalog {
    descriptions: BTreeMap<String, String>,
}

impl BranchCatalog {
    /// Default descriptions with `overrides` replacing or adding entries
    pub fn new(overrides: &HashMap<String, String>) -> Self {
        let mut descriptions: BTreeMap<String, String> = DEFAULT_BRANCHES
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (name, description) in overrides {
            descriptions.insert(name.clone(), description.clone());
        }
        Self { descriptions }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.descriptions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.descriptions.keys().map(String::as_str)
    }

    /// The branch description with `params` substituted
    pub fn resolve(&self, name: &str, params: &HashMap<String, String>) -> Result<String> {
        let template = self
            .descriptions
            .get(name)
            .ok_or_else(|| Error::config(format!("unknown branch {}", name)))?;
        describe::resolve(template, params)
    }
}

impl Default for BranchCatalog {
    fn default() -> Self {
        Self::new(&HashMap::new())
    }
}
