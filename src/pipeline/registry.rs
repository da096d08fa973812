//! Element factories keyed by kind

use std::collections::HashMap;
use std::sync::Arc;

use super::describe::ElementSpec;
use super::stage::Element;
use crate::error::{Error, Result};

pub type Factory = Arc<dyn Fn(&ElementSpec) -> Result<Element> + Send + Sync>;

/// Maps element kinds (`queue`, `filesink`, ...) to constructors.
///
/// `StageRegistry::default()` carries the built-in stage library; callers
/// register their own kinds on top, replacing built-ins of the same name.
#[derive(Clone)]
pub struct StageRegistry {
    factories: HashMap<String, Factory>,
}

impl StageRegistry {
    /// A registry with no kinds at all
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the built-in stage library
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        crate::stages::register_builtins(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&ElementSpec) -> Result<Element> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn make(&self, spec: &ElementSpec) -> Result<Element> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| Error::parse(format!("no element kind {:?}", spec.kind)))?;
        factory(spec)
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("StageRegistry").field("kinds", &kinds).finish()
    }
}
