use crate::cache::{validate_for_key, CacheEntry, CacheKey, LayerCache};
use crate::layers::Layer;
use crate::StoreError;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use strata_schema::{LayerId, StepId};

struct Slot {
    layer: Layer,
    content: Vec<u8>,
    last_used: i64,
}

#[derive(Default)]
struct State {
    index: HashMap<StepId, LayerId>,
    layers: HashMap<LayerId, Slot>,
    clock: i64,
}

impl State {
    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }
}

/// Process-local layer cache.
///
/// All state sits behind one mutex, so a lookup-or-store sequence from
/// several threads observes a single binding per key.
#[derive(Default)]
pub struct MemoryLayerCache {
    state: Mutex<State>,
}

impl MemoryLayerCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.state().map(|s| s.layers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LayerCache for MemoryLayerCache {
    fn lookup(&self, key: &CacheKey) -> Result<Option<Layer>, StoreError> {
        let mut state = self.state()?;
        let Some(id) = state.index.get(&key.step_id()).cloned() else {
            return Ok(None);
        };
        let now = state.tick();
        let slot = state
            .layers
            .get_mut(&id)
            .ok_or_else(|| StoreError::LayerNotFound(id.to_string()))?;
        slot.last_used = now;
        Ok(Some(slot.layer.clone()))
    }

    fn store(&self, key: &CacheKey, layer: Layer, content: &[u8]) -> Result<Layer, StoreError> {
        validate_for_key(key, &layer, content)?;
        let mut state = self.state()?;
        let step = key.step_id();

        if let Some(existing) = state.index.get(&step) {
            return state
                .layers
                .get(existing)
                .map(|slot| slot.layer.clone())
                .ok_or_else(|| StoreError::LayerNotFound(existing.to_string()));
        }
        if let Some(parent) = &layer.parent {
            if !state.layers.contains_key(parent) {
                return Err(StoreError::BrokenChain {
                    layer: layer.id.to_string(),
                    reason: format!("parent {} is not cached", parent.short()),
                });
            }
        }

        let now = state.tick();
        state.index.insert(step, layer.id.clone());
        state.layers.insert(
            layer.id.clone(),
            Slot {
                layer: layer.clone(),
                content: content.to_vec(),
                last_used: now,
            },
        );
        Ok(layer)
    }

    fn get(&self, id: &LayerId) -> Result<Layer, StoreError> {
        self.state()?
            .layers
            .get(id)
            .map(|slot| slot.layer.clone())
            .ok_or_else(|| StoreError::LayerNotFound(id.to_string()))
    }

    fn content(&self, id: &LayerId) -> Result<Vec<u8>, StoreError> {
        let state = self.state()?;
        let slot = state
            .layers
            .get(id)
            .ok_or_else(|| StoreError::LayerNotFound(id.to_string()))?;
        slot.layer.verify_content(&slot.content)?;
        Ok(slot.content.clone())
    }

    fn entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        let state = self.state()?;
        let mut out: Vec<CacheEntry> = state
            .layers
            .values()
            .map(|slot| CacheEntry {
                layer: slot.layer.clone(),
                last_used: slot.last_used,
            })
            .collect();
        out.sort_by(|a, b| a.layer.id.cmp(&b.layer.id));
        Ok(out)
    }

    fn remove(&self, id: &LayerId) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let slot = state
            .layers
            .remove(id)
            .ok_or_else(|| StoreError::LayerNotFound(id.to_string()))?;
        if state.index.get(&slot.layer.step_id) == Some(id) {
            state.index.remove(&slot.layer.step_id);
        }
        Ok(())
    }
}
