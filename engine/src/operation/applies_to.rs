//! The set of domain objects an operation affects

use serde::Serialize;

/// The object kinds an operation can be recorded against, with the related
/// references each one implies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectRef {
    Pool {
        pool: String,
    },
    Host {
        host: String,
        pool: Option<String>,
    },
    Vm {
        vm: String,
        /// Parent VM when this VM is a snapshot
        snapshot_of: Option<String>,
        resident_on: Option<String>,
        pool: Option<String>,
    },
    Template {
        template: String,
        pool: Option<String>,
    },
    Sr {
        sr: String,
        pool: Option<String>,
    },
}

impl ObjectRef {
    /// The object's own reference followed by the ones it implies
    pub fn refs(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        match self {
            ObjectRef::Pool { pool } => refs.push(pool.as_str()),
            ObjectRef::Host { host, pool } => {
                refs.push(host.as_str());
                refs.extend(pool.as_deref());
            }
            ObjectRef::Vm {
                vm,
                snapshot_of,
                resident_on,
                pool,
            } => {
                refs.push(vm.as_str());
                refs.extend(snapshot_of.as_deref());
                refs.extend(resident_on.as_deref());
                refs.extend(pool.as_deref());
            }
            ObjectRef::Template { template, pool } => {
                refs.push(template.as_str());
                refs.extend(pool.as_deref());
            }
            ObjectRef::Sr { sr, pool } => {
                refs.push(sr.as_str());
                refs.extend(pool.as_deref());
            }
        }
        refs
    }
}

/// Insertion-ordered, deduplicated identifiers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AppliesTo(Vec<String>);

impl AppliesTo {
    pub fn add(&mut self, object: &ObjectRef) {
        for reference in object.refs() {
            self.add_ref(reference);
        }
    }

    pub fn add_ref(&mut self, reference: &str) {
        if !reference.is_empty() && !self.contains(reference) {
            self.0.push(reference.to_string());
        }
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.0.iter().any(|r| r == reference)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
