//! Host resource registry.
//!
//! Built once at startup and shared read-only between slot workers.

use ci_protocol::{ResourceId, SessionStatus};

/// Which host resource implementation serves a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    ResourceManager,
    ApplicationInfo,
    ConditionalAccess,
    DateTime,
    Mmi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub id: ResourceId,
    pub kind: ResourceKind,
}

/// Resources the host offers to modules.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    entries: Vec<Registration>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the five standard resources.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(ResourceId::RESOURCE_MANAGER, ResourceKind::ResourceManager);
        registry.register(ResourceId::APPLICATION_INFO, ResourceKind::ApplicationInfo);
        registry.register(ResourceId::CONDITIONAL_ACCESS, ResourceKind::ConditionalAccess);
        registry.register(ResourceId::DATE_TIME, ResourceKind::DateTime);
        registry.register(ResourceId::MMI, ResourceKind::Mmi);
        registry
    }

    /// Add or replace the registration for `id`'s class and type.
    pub fn register(&mut self, id: ResourceId, kind: ResourceKind) {
        self.entries.retain(|entry| !same_resource(entry.id, id));
        self.entries.push(Registration { id, kind });
    }

    /// Ids of every registered resource, for the RM profile reply.
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        self.entries.iter().map(|entry| entry.id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the registration serving `requested`.
    ///
    /// Public ids match on class and type; the registered version must be
    /// at least the requested one. Private ids match exactly.
    pub fn lookup(&self, requested: ResourceId) -> Result<Registration, SessionStatus> {
        let entry = self
            .entries
            .iter()
            .find(|entry| same_resource(entry.id, requested))
            .ok_or(SessionStatus::NotFound)?;

        match (entry.id.decode_public(), requested.decode_public()) {
            (Some(have), Some(want)) if have.resource_version < want.resource_version => {
                Err(SessionStatus::VersionTooLow)
            }
            _ => Ok(*entry),
        }
    }
}

fn same_resource(a: ResourceId, b: ResourceId) -> bool {
    match (a.decode_public(), b.decode_public()) {
        (Some(a), Some(b)) => {
            a.resource_class == b.resource_class && a.resource_type == b.resource_type
        }
        (None, None) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_standard_resources() {
        let registry = ResourceRegistry::standard();
        assert_eq!(registry.len(), 5);
        let found = registry.lookup(ResourceId::CONDITIONAL_ACCESS).unwrap();
        assert_eq!(found.kind, ResourceKind::ConditionalAccess);
    }

    #[test]
    fn test_lookup_older_version_matches() {
        let mut registry = ResourceRegistry::new();
        registry.register(ResourceId::public(0x40, 1, 2), ResourceKind::Mmi);
        let found = registry.lookup(ResourceId::public(0x40, 1, 1)).unwrap();
        assert_eq!(found.id, ResourceId::public(0x40, 1, 2));
    }

    #[test]
    fn test_lookup_newer_version_rejected() {
        let registry = ResourceRegistry::standard();
        assert_eq!(
            registry.lookup(ResourceId::public(0x03, 1, 2)),
            Err(SessionStatus::VersionTooLow)
        );
    }

    #[test]
    fn test_lookup_unknown_class() {
        let registry = ResourceRegistry::standard();
        assert_eq!(
            registry.lookup(ResourceId::public(0x8C, 1, 1)),
            Err(SessionStatus::NotFound)
        );
    }

    #[test]
    fn test_private_ids_match_exactly() {
        let mut registry = ResourceRegistry::new();
        let private = ResourceId(0xC000_1234);
        registry.register(private, ResourceKind::Mmi);
        assert!(registry.lookup(private).is_ok());
        assert_eq!(
            registry.lookup(ResourceId(0xC000_1235)),
            Err(SessionStatus::NotFound)
        );
    }

    #[test]
    fn test_register_replaces_same_class() {
        let mut registry = ResourceRegistry::standard();
        registry.register(ResourceId::public(0x24, 1, 3), ResourceKind::DateTime);
        assert_eq!(registry.len(), 5);
        assert!(registry.lookup(ResourceId::public(0x24, 1, 3)).is_ok());
    }
}
