//! Registry of mapping units.

use super::unit::MappingUnit;
use crate::error::{AppResult, MappingError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Default)]
struct Registry {
    units: HashMap<String, Arc<MappingUnit>>,
    by_name: BTreeMap<String, String>,
}

/// Owns every [`MappingUnit`] of a session, keyed by id with a name index.
///
/// Both the id and the name of a unit are unique within the hub.
#[derive(Debug, Default)]
pub struct MappingHub {
    registry: RwLock<Registry>,
}

impl MappingHub {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register an empty unit.
    pub fn create_unit(
        &self,
        name: impl Into<String>,
        scan_params: BTreeMap<String, String>,
    ) -> AppResult<Arc<MappingUnit>> {
        self.insert(Arc::new(MappingUnit::new(name, scan_params)))
    }

    /// Register an existing unit.
    pub fn insert(&self, unit: Arc<MappingUnit>) -> AppResult<Arc<MappingUnit>> {
        let mut registry = self.registry.write();
        if registry.units.contains_key(unit.unit_id()) {
            return Err(MappingError::DuplicateUnit(unit.unit_id().to_string()));
        }
        if registry.by_name.contains_key(unit.unit_name()) {
            return Err(MappingError::DuplicateUnit(unit.unit_name().to_string()));
        }
        registry
            .by_name
            .insert(unit.unit_name().to_string(), unit.unit_id().to_string());
        registry
            .units
            .insert(unit.unit_id().to_string(), unit.clone());
        info!(unit = %unit.unit_name(), id = %unit.unit_id(), "Registered mapping unit");
        Ok(unit)
    }

    /// Look up by id.
    pub fn get(&self, unit_id: &str) -> Option<Arc<MappingUnit>> {
        self.registry.read().units.get(unit_id).cloned()
    }

    /// Look up by name.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<MappingUnit>> {
        let registry = self.registry.read();
        let id = registry.by_name.get(name)?;
        registry.units.get(id).cloned()
    }

    /// Remove by id.
    pub fn remove(&self, unit_id: &str) -> AppResult<Arc<MappingUnit>> {
        let mut registry = self.registry.write();
        let unit = registry
            .units
            .remove(unit_id)
            .ok_or_else(|| MappingError::UnknownUnit(unit_id.to_string()))?;
        registry.by_name.retain(|_, id| id != unit_id);
        Ok(unit)
    }

    /// Point a new name at a unit.
    ///
    /// Units carry their creation name; the hub's index is what callers
    /// resolve names against.
    pub fn rename(&self, unit_id: &str, new_name: &str) -> AppResult<()> {
        let mut registry = self.registry.write();
        if !registry.units.contains_key(unit_id) {
            return Err(MappingError::UnknownUnit(unit_id.to_string()));
        }
        match registry.by_name.get(new_name) {
            Some(id) if id == unit_id => return Ok(()),
            Some(_) => return Err(MappingError::DuplicateUnit(new_name.to_string())),
            None => {}
        }
        registry.by_name.retain(|_, id| id != unit_id);
        registry
            .by_name
            .insert(new_name.to_string(), unit_id.to_string());
        Ok(())
    }

    /// Name the hub resolves to `unit_id`.
    pub fn name_of(&self, unit_id: &str) -> Option<String> {
        self.registry
            .read()
            .by_name
            .iter()
            .find(|(_, id)| id.as_str() == unit_id)
            .map(|(name, _)| name.clone())
    }

    /// All unit ids.
    pub fn ids(&self) -> Vec<String> {
        self.registry.read().units.keys().cloned().collect()
    }

    /// All unit names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.registry.read().by_name.keys().cloned().collect()
    }

    /// Number of units.
    pub fn len(&self) -> usize {
        self.registry.read().units.len()
    }

    /// Whether the hub is empty.
    pub fn is_empty(&self) -> bool {
        self.registry.read().units.is_empty()
    }

    /// `base`, or `base_n` for the smallest `n` that is free.
    pub fn unique_name(&self, base: &str) -> String {
        let registry = self.registry.read();
        if !registry.by_name.contains_key(base) {
            return base.to_string();
        }
        (1..)
            .map(|n| format!("{base}_{n}"))
            .find(|name| !registry.by_name.contains_key(name))
            .unwrap_or_else(|| base.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_and_ids_are_unique() {
        let hub = MappingHub::new();
        let unit = hub.create_unit("map", BTreeMap::new()).unwrap();

        assert!(matches!(
            hub.create_unit("map", BTreeMap::new()),
            Err(MappingError::DuplicateUnit(_))
        ));
        assert!(matches!(hub.insert(unit.clone()), Err(MappingError::DuplicateUnit(_))));

        let same_id = Arc::new(MappingUnit::with_id(unit.unit_id(), "other", BTreeMap::new()));
        assert!(hub.insert(same_id).is_err());
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn lookup_rename_remove() {
        let hub = MappingHub::new();
        let a = hub.create_unit("a", BTreeMap::new()).unwrap();
        hub.create_unit("b", BTreeMap::new()).unwrap();

        assert_eq!(hub.get_by_name("a").unwrap().unit_id(), a.unit_id());
        assert!(hub.rename(a.unit_id(), "b").is_err());
        hub.rename(a.unit_id(), "c").unwrap();
        assert!(hub.get_by_name("a").is_none());
        assert_eq!(hub.name_of(a.unit_id()).as_deref(), Some("c"));

        hub.remove(a.unit_id()).unwrap();
        assert!(hub.get(a.unit_id()).is_none());
        assert!(matches!(hub.remove(a.unit_id()), Err(MappingError::UnknownUnit(_))));
        assert_eq!(hub.names(), vec!["b".to_string()]);
    }

    #[test]
    fn unique_name_counts_up() {
        let hub = MappingHub::new();
        assert_eq!(hub.unique_name("map"), "map");
        hub.create_unit("map", BTreeMap::new()).unwrap();
        hub.create_unit("map_1", BTreeMap::new()).unwrap();
        assert_eq!(hub.unique_name("map"), "map_2");
    }
}
