use std::collections::HashMap;

use tessera_types::{Effect, EffectId, EffectKey, EffectSpec};

use crate::store::{StateStore, StoreResult};

/// Reconcile the predefined catalog into the store: insert missing keys and
/// refresh names and descriptions of existing ones. Nothing is deleted.
pub fn sync_catalog<S: StateStore + ?Sized>(
    store: &S,
    catalog: &[EffectSpec],
) -> StoreResult<Vec<Effect>> {
    let effects = store.upsert_effects(catalog)?;
    log::info!(target: "catalog", "synced {} predefined effects ({} in store)", catalog.len(), effects.len());
    Ok(effects)
}

/// Id → key lookup of the catalog, filled lazily from the store.
#[derive(Debug, Default)]
pub struct EffectKeyCache {
    keys: HashMap<EffectId, EffectKey>,
}

impl EffectKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_for<S: StateStore + ?Sized>(
        &mut self,
        store: &S,
        id: EffectId,
    ) -> StoreResult<EffectKey> {
        if let Some(key) = self.keys.get(&id) {
            return Ok(key.clone());
        }
        // One miss usually means the catalog was synced since we last looked.
        for effect in store.effects()? {
            self.keys.insert(effect.id, effect.css_key);
        }
        match self.keys.get(&id) {
            Some(key) => Ok(key.clone()),
            None => store.effect(id).map(|e| e.css_key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::MemoryStore;

    #[test]
    fn sync_is_idempotent() {
        let store = MemoryStore::new();
        let config = Config::from_toml("").unwrap();
        let first = sync_catalog(&store, config.catalog()).unwrap();
        let second = sync_catalog(&store, config.catalog()).unwrap();
        assert_eq!(first.len(), config.catalog().len());
        assert_eq!(first, second);
    }

    #[test]
    fn cache_resolves_ids() {
        let store = MemoryStore::new();
        let effects = sync_catalog(&store, Config::from_toml("").unwrap().catalog()).unwrap();
        let mut cache = EffectKeyCache::new();
        let blackout = effects.iter().find(|e| e.css_key.as_str() == "apagon").unwrap();
        assert_eq!(cache.key_for(&store, blackout.id).unwrap(), blackout.css_key);
        assert!(cache.key_for(&store, EffectId::new(999)).is_err());
    }
}
