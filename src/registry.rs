//! Catalog entities and the diff-based refresh used by the registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::driver::{
    InterfaceHandle, InterfaceInfo, TransportLayerHandle, TransportLayerInfo, TransportLayerType,
};
use crate::error::{BatchOutcome, Result};

/// A transport layer. The set of transport layers is fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportLayer {
    info: TransportLayerInfo,
}

impl TransportLayer {
    pub(crate) const fn new(info: TransportLayerInfo) -> Self {
        Self { info }
    }

    /// Driver handle.
    pub const fn handle(&self) -> TransportLayerHandle {
        self.info.handle
    }

    /// Unique identifier.
    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Transport technology.
    pub const fn kind(&self) -> TransportLayerType {
        self.info.kind
    }

    /// Full description.
    pub const fn info(&self) -> &TransportLayerInfo {
        &self.info
    }
}

/// An interface (network adapter, USB host controller, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    info: InterfaceInfo,
}

impl Interface {
    pub(crate) const fn new(info: InterfaceInfo) -> Self {
        Self { info }
    }

    /// Driver handle.
    pub const fn handle(&self) -> InterfaceHandle {
        self.info.handle
    }

    /// Unique identifier.
    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Transport technology.
    pub const fn kind(&self) -> TransportLayerType {
        self.info.kind
    }

    /// Handle of the owning transport layer.
    pub const fn transport_layer_handle(&self) -> TransportLayerHandle {
        self.info.transport_layer
    }

    /// Full description.
    pub const fn info(&self) -> &InterfaceInfo {
        &self.info
    }
}

/// What a catalog refresh changed.
#[derive(Debug)]
pub(crate) struct Reconciled<K, V> {
    pub(crate) added: Vec<K>,
    pub(crate) removed: Vec<Arc<V>>,
    pub(crate) outcome: BatchOutcome,
}

/// Bring `catalog` in line with the driver's `listed` entries.
///
/// Entries no longer listed are removed, entries still listed keep their
/// existing object (and therefore identity), and new entries are built with
/// `create`. A failing `create` skips that entry and is recorded in the
/// outcome; the rest of the catalog is still updated.
pub(crate) fn reconcile<K, V, I, KeyFn, CreateFn>(
    catalog: &mut BTreeMap<K, Arc<V>>,
    listed: Vec<I>,
    key_of: KeyFn,
    mut create: CreateFn,
) -> Reconciled<K, V>
where
    K: Ord + Clone,
    KeyFn: Fn(&I) -> K,
    CreateFn: FnMut(I) -> Result<V>,
{
    let listed: BTreeMap<K, I> = listed.into_iter().map(|item| (key_of(&item), item)).collect();

    let stale: Vec<K> = catalog
        .keys()
        .filter(|key| !listed.contains_key(*key))
        .cloned()
        .collect();
    let removed = stale
        .iter()
        .filter_map(|key| catalog.remove(key))
        .collect();

    let mut outcome = BatchOutcome::new();
    let mut added = Vec::new();
    for (key, item) in listed {
        if catalog.contains_key(&key) {
            continue;
        }
        if let Some(value) = outcome.keep(create(item)) {
            catalog.insert(key.clone(), Arc::new(value));
            added.push(key);
        }
    }

    Reconciled {
        added,
        removed,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_reconcile_preserves_identity() {
        let mut catalog: BTreeMap<u32, Arc<String>> = BTreeMap::new();
        catalog.insert(1, Arc::new("one".to_owned()));
        catalog.insert(2, Arc::new("two".to_owned()));
        let kept = Arc::clone(&catalog[&1]);

        let result = reconcile(&mut catalog, vec![1u32, 3], |id| *id, |id| Ok(format!("new {id}")));

        assert_eq!(result.added, vec![3]);
        assert_eq!(result.removed.len(), 1);
        assert_eq!(result.removed[0].as_str(), "two");
        assert!(Arc::ptr_eq(&catalog[&1], &kept));
        assert_eq!(catalog[&3].as_str(), "new 3");
        assert!(result.outcome.is_clean());
    }

    #[test]
    fn test_reconcile_skips_failed_entries() {
        let mut catalog: BTreeMap<u32, Arc<u32>> = BTreeMap::new();
        let result = reconcile(&mut catalog, vec![1u32, 2, 3], |id| *id, |id| {
            if id == 2 {
                Err(Error::TlNotFound("tl".to_owned()))
            } else {
                Ok(id)
            }
        });

        assert_eq!(catalog.len(), 2);
        assert_eq!(result.outcome.completed, 2);
        assert_eq!(result.outcome.first_error, Some(Error::TlNotFound("tl".to_owned())));
    }

    #[test]
    fn test_reconcile_empty_listing_clears() {
        let mut catalog: BTreeMap<u32, Arc<u32>> = BTreeMap::new();
        catalog.insert(5, Arc::new(5));
        let result = reconcile(&mut catalog, Vec::<u32>::new(), |id| *id, Ok);
        assert!(catalog.is_empty());
        assert_eq!(result.removed.len(), 1);
    }
}
