//! Namespace definitions and lookup.

use std::sync::Arc;

use crate::arbiter::ConflictPolicy;

/// A named keyspace with its own conflict-resolution policy.
#[derive(Debug)]
pub struct Namespace {
    pub name: String,
    pub id: u32,
    pub policy: ConflictPolicy,
}

impl Namespace {
    pub fn new(name: impl Into<String>, id: u32, policy: ConflictPolicy) -> Arc<Namespace> {
        Arc::new(Namespace {
            name: name.into(),
            id,
            policy,
        })
    }
}

/// Registry of the node's configured namespaces.
///
/// The set is fixed at startup; lookups are by name bytes (requests carry the
/// namespace name) or by id (acks echo the namespace index).
#[derive(Debug, Default)]
pub struct NamespaceRegistry {
    namespaces: Vec<Arc<Namespace>>,
}

impl NamespaceRegistry {
    pub fn new(namespaces: Vec<Arc<Namespace>>) -> Self {
        Self { namespaces }
    }

    pub fn get_by_name_bytes(&self, name: &[u8]) -> Option<Arc<Namespace>> {
        self.namespaces
            .iter()
            .find(|ns| ns.name.as_bytes() == name)
            .cloned()
    }

    pub fn get_by_id(&self, id: u32) -> Option<Arc<Namespace>> {
        self.namespaces.iter().find(|ns| ns.id == id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Namespace>> {
        self.namespaces.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name_bytes_and_id() {
        let reg = NamespaceRegistry::new(vec![
            Namespace::new("bar", 1, ConflictPolicy::Generation),
            Namespace::new("baz", 2, ConflictPolicy::LastUpdateTime),
        ]);

        assert_eq!(reg.get_by_name_bytes(b"bar").map(|ns| ns.id), Some(1));
        assert_eq!(reg.get_by_id(2).map(|ns| ns.name.clone()), Some("baz".into()));
        assert!(reg.get_by_name_bytes(b"nope").is_none());
        assert!(reg.get_by_id(9).is_none());
    }
}
