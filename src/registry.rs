use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::portable::{Portable, from_portable};
use crate::script::Namespace;

pub const DEFAULT_NAMESPACE: &str = "default";

/// A namespace shared between the host and the engine's drain steps.
pub type NamespaceHandle = Rc<RefCell<Namespace>>;

/// Named namespaces. `default` is the host's live globals.
#[derive(Debug)]
pub struct NamespaceRegistry {
    globals: NamespaceHandle,
    named: RefCell<BTreeMap<String, NamespaceHandle>>,
}

impl NamespaceRegistry {
    pub fn new(globals: NamespaceHandle) -> Self {
        Self {
            globals,
            named: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn globals(&self) -> NamespaceHandle {
        self.globals.clone()
    }

    pub fn get_or_create(&self, name: &str) -> NamespaceHandle {
        if name == DEFAULT_NAMESPACE {
            return self.globals.clone();
        }
        self.named
            .borrow_mut()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Applies `changed` key by key. Names absent from `changed` are untouched.
    pub fn merge(&self, name: &str, changed: BTreeMap<String, Portable>) -> Vec<String> {
        let target = self.get_or_create(name);
        let mut target = target.borrow_mut();
        let mut merged = Vec::with_capacity(changed.len());
        for (key, value) in changed {
            target.insert(key.clone(), from_portable(value));
            merged.push(key);
        }
        merged
    }

    pub fn get_namespace(&self, name: &str) -> Namespace {
        self.get_or_create(name).borrow().clone()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = vec![DEFAULT_NAMESPACE.to_string()];
        names.extend(self.named.borrow().keys().cloned());
        names
    }

    /// What a generation targeting `name` starts from: the named entries with
    /// the host globals layered on top.
    pub fn base_for(&self, name: &str) -> Namespace {
        let mut base = if name == DEFAULT_NAMESPACE {
            Namespace::new()
        } else {
            self.get_namespace(name)
        };
        base.extend(
            self.globals
                .borrow()
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        base
    }
}
