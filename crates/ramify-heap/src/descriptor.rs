//! Type descriptor registry.
//!
//! Each managed type registers a descriptor so polymorphic objects can be
//! enumerated generically by an external trace pass. Behavior dispatch is
//! ordinary Rust trait objects; the registry carries only the identity an
//! external scanner needs.

use std::fmt;

use parking_lot::RwLock;

/// Identity of one registered managed type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TypeDescriptor {
    /// Stable type name.
    pub name: &'static str,
    /// Registration ordinal, usable as a discriminator in scan output.
    pub tag: u16,
}

/// Index of a descriptor in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[repr(transparent)]
pub struct DescriptorId(u16);

impl DescriptorId {
    #[inline]
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "desc#{}", self.0)
    }
}

/// Registry of managed type descriptors.
#[derive(Default)]
pub struct DescriptorRegistry {
    entries: RwLock<Vec<TypeDescriptor>>,
}

impl DescriptorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`, returning its id. Idempotent per name.
    ///
    /// # Panics
    ///
    /// Panics if more than `u16::MAX` types are registered.
    pub fn register(&self, name: &'static str) -> DescriptorId {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.iter().find(|d| d.name == name) {
            return DescriptorId(existing.tag);
        }
        let tag = u16::try_from(entries.len()).expect("descriptor registry overflow");
        entries.push(TypeDescriptor { name, tag });
        tracing::debug!(target: "ramify.heap", name, tag, "type_descriptor_registered");
        DescriptorId(tag)
    }

    /// Look up a descriptor by id.
    #[must_use]
    pub fn get(&self, id: DescriptorId) -> Option<TypeDescriptor> {
        self.entries.read().get(id.0 as usize).copied()
    }

    /// Snapshot of every registered descriptor, in registration order.
    #[must_use]
    pub fn descriptors(&self) -> Vec<TypeDescriptor> {
        self.entries.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl fmt::Debug for DescriptorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorRegistry")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_per_name() {
        let registry = DescriptorRegistry::new();
        let a = registry.register("record");
        let b = registry.register("history-node");
        let a_again = registry.register("record");

        assert_eq!(a, a_again);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(a).unwrap().name, "record");
        assert_eq!(registry.descriptors()[1].name, "history-node");
    }
}
