//! Exportable view of a namespace.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::portable::{Portable, to_portable};
use crate::script::{Namespace, Value, builtins};

/// Names that never leave the host, independent of their values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRules {
    pub reserved_prefix: String,
    pub allowed_underscore: Vec<String>,
    pub excluded_names: Vec<String>,
}

impl Default for SnapshotRules {
    fn default() -> Self {
        Self {
            reserved_prefix: "_".to_string(),
            allowed_underscore: ["_", "__", "___"].map(String::from).to_vec(),
            excluded_names: ["In", "Out", "exit", "quit"].map(String::from).to_vec(),
        }
    }
}

impl SnapshotRules {
    pub fn is_reserved_name(&self, name: &str) -> bool {
        if self.excluded_names.iter().any(|excluded| excluded == name) {
            return true;
        }
        !self.reserved_prefix.is_empty()
            && name.starts_with(&self.reserved_prefix)
            && !self.allowed_underscore.iter().any(|allowed| allowed == name)
    }

    /// Reserved names, modules, and builtins bound under their own name.
    pub fn is_excluded(&self, name: &str, value: &Value) -> bool {
        self.is_reserved_name(name)
            || matches!(value, Value::Module(_))
            || builtins::is_builtin_binding(name, value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedName {
    pub name: String,
    pub type_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub entries: BTreeMap<String, Portable>,
    pub skipped: Vec<SkippedName>,
}

impl Snapshot {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Values that failed to serialize once, keyed by name and allocation.
///
/// The cache keeps its own handle on each value so the allocation stays
/// alive; a rebinding always gets a new identity and is tried again.
#[derive(Debug, Default)]
pub struct UnserializableCache {
    known: HashMap<String, Value>,
}

impl UnserializableCache {
    fn contains(&self, name: &str, value: &Value) -> bool {
        let Some(id) = value.identity() else {
            return false;
        };
        self.known
            .get(name)
            .and_then(Value::identity)
            .is_some_and(|known| known == id)
    }

    fn remember(&mut self, name: &str, value: &Value) {
        if value.identity().is_some() {
            self.known.insert(name.to_string(), value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

pub fn snapshot(
    namespace: &Namespace,
    rules: &SnapshotRules,
    cache: &mut UnserializableCache,
) -> Snapshot {
    let mut out = Snapshot::default();
    for (name, value) in namespace {
        if rules.is_excluded(name, value) || cache.contains(name, value) {
            continue;
        }
        match to_portable(value) {
            Ok(portable) => {
                out.entries.insert(name.clone(), portable);
            }
            Err(err) => {
                cache.remember(name, value);
                out.skipped.push(SkippedName {
                    name: name.clone(),
                    type_name: err.type_name,
                    reason: err.reason,
                });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::script::ModuleKind;

    fn iterator() -> Value {
        Value::Iterator(Rc::new(RefCell::new(Default::default())))
    }

    #[test]
    fn applies_exclusion_rules() {
        let mut ns = Namespace::new();
        ns.insert("x".into(), Value::Int(1));
        ns.insert("_".into(), Value::Int(2));
        ns.insert("_hidden".into(), Value::Int(3));
        ns.insert("Out".into(), Value::dict(BTreeMap::new()));
        ns.insert("math".into(), Value::Module(ModuleKind::Math));
        ns.insert("print".into(), Value::Builtin("print"));
        ns.insert("say".into(), Value::Builtin("print"));

        let snap = snapshot(&ns, &SnapshotRules::default(), &mut UnserializableCache::default());
        let names: Vec<&str> = snap.names().collect();
        assert_eq!(names, vec!["_", "say", "x"]);
        assert!(snap.skipped.is_empty());
    }

    #[test]
    fn unserializable_values_are_reported_once_per_binding() {
        let mut ns = Namespace::new();
        ns.insert("it".into(), iterator());
        ns.insert("ok".into(), Value::str("fine"));
        let rules = SnapshotRules::default();
        let mut cache = UnserializableCache::default();

        let first = snapshot(&ns, &rules, &mut cache);
        assert_eq!(first.skipped.len(), 1);
        assert_eq!(first.skipped[0].name, "it");
        assert_eq!(first.skipped[0].type_name, "iterator");
        assert!(first.entries.contains_key("ok"));

        let second = snapshot(&ns, &rules, &mut cache);
        assert!(second.skipped.is_empty());
        assert!(!second.entries.contains_key("it"));

        ns.insert("it".into(), iterator());
        let third = snapshot(&ns, &rules, &mut cache);
        assert_eq!(third.skipped.len(), 1);
    }

    #[test]
    fn rebinding_after_drop_is_tried_again() {
        let rules = SnapshotRules::default();
        let mut cache = UnserializableCache::default();
        let mut ns = Namespace::new();
        for round in 0..50 {
            // Replacing the binding drops the namespace's handle on the old value.
            ns.insert("it".into(), iterator());
            let snap = snapshot(&ns, &rules, &mut cache);
            assert_eq!(snap.skipped.len(), 1, "round {round}");
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn custom_rules_replace_defaults() {
        let rules = SnapshotRules {
            reserved_prefix: "tmp_".into(),
            allowed_underscore: Vec::new(),
            excluded_names: vec!["secret".into()],
        };
        assert!(rules.is_reserved_name("tmp_a"));
        assert!(rules.is_reserved_name("secret"));
        assert!(!rules.is_reserved_name("_private"));
    }
}
