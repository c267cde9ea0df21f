//! Process-wide registry of the effective configuration, exposed as JSON.
//!
//! Writers register per-section options as they come up; readers dump the
//! whole tree. Three submaps are kept: the options as configured, and the
//! defaults that would apply for a cluster and for a clusterset.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionId {
    pub section: String,
    pub key: Option<String>,
}

impl SectionId {
    pub fn new(section: impl Into<String>, key: Option<&str>) -> Self {
        Self {
            section: section.into(),
            key: key.map(|k| k.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultsScope {
    Cluster,
    ClusterSet,
}

type SectionMap = BTreeMap<SectionId, Map<String, Value>>;

#[derive(Debug, Default)]
struct Registry {
    configured: SectionMap,
    defaults_cluster: SectionMap,
    defaults_clusterset: SectionMap,
}

#[derive(Debug, Default)]
pub struct DynamicConfig {
    registry: Mutex<Registry>,
}

impl DynamicConfig {
    pub fn shared() -> &'static DynamicConfig {
        static SHARED: OnceLock<DynamicConfig> = OnceLock::new();
        SHARED.get_or_init(DynamicConfig::default)
    }

    /// Options with no value (`Value::Null`) are omitted from the dump.
    pub fn set_option_configured(
        &self,
        section_id: &SectionId,
        option: &str,
        value: impl Into<Value>,
    ) {
        let value = value.into();
        if value.is_null() {
            return;
        }
        let mut registry = self.registry.lock();
        registry
            .configured
            .entry(section_id.clone())
            .or_default()
            .insert(option.to_string(), value);
    }

    /// Registers the same default for both the cluster and clusterset scope.
    pub fn set_option_default(
        &self,
        section_id: &SectionId,
        option: &str,
        value: impl Into<Value> + Clone,
    ) {
        self.set_option_default_per(DefaultsScope::Cluster, section_id, option, value.clone());
        self.set_option_default_per(DefaultsScope::ClusterSet, section_id, option, value);
    }

    pub fn set_option_default_per(
        &self,
        scope: DefaultsScope,
        section_id: &SectionId,
        option: &str,
        value: impl Into<Value>,
    ) {
        let value = value.into();
        if value.is_null() {
            return;
        }
        let mut registry = self.registry.lock();
        let map = match scope {
            DefaultsScope::Cluster => &mut registry.defaults_cluster,
            DefaultsScope::ClusterSet => &mut registry.defaults_clusterset,
        };
        map.entry(section_id.clone())
            .or_default()
            .insert(option.to_string(), value);
    }

    pub fn dump_configured(&self) -> Value {
        let registry = self.registry.lock();
        dump(&registry.configured)
    }

    pub fn dump_defaults(&self, scope: DefaultsScope) -> Value {
        let registry = self.registry.lock();
        match scope {
            DefaultsScope::Cluster => dump(&registry.defaults_cluster),
            DefaultsScope::ClusterSet => dump(&registry.defaults_clusterset),
        }
    }

    pub fn clear(&self) {
        let mut registry = self.registry.lock();
        *registry = Registry::default();
    }
}

// sections with a key nest their options under the key:
// {"routing": {"ro": {...}}}; without a key: {"io": {...}}.
fn dump(sections: &SectionMap) -> Value {
    let mut top = Map::new();
    for (section_id, options) in sections {
        let options = Value::Object(options.clone());
        match &section_id.key {
            Some(key) => {
                let entry = top
                    .entry(section_id.section.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(nested) = entry {
                    nested.insert(key.clone(), options);
                }
            }
            None => {
                top.insert(section_id.section.clone(), options);
            }
        }
    }
    Value::Object(top)
}
