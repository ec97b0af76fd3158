use crate::cache::{CacheEntry, DiskLayerCache, LayerCache};
use crate::images::ImageStore;
use crate::StoreError;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use strata_schema::{LayerId, ObjectHash};
use tracing::{debug, info};

/// Outcome of an LRU eviction pass.
#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct EvictionReport {
    pub budget: u64,
    pub total_before: u64,
    pub total_after: u64,
    /// Layers removed (or, in a dry run, that would be removed), oldest first.
    pub evicted: Vec<LayerId>,
    pub freed: u64,
    /// Set when every remaining layer is pinned or has a child and the
    /// cache is still larger than the budget.
    pub over_budget: bool,
}

/// Choose which layers to evict to bring the cache within `budget` bytes.
///
/// Only leaves are candidates: a layer with a cached child is never chosen,
/// though it becomes a candidate once all its children are chosen. Pinned
/// layers are never chosen. Among candidates the least recently used goes
/// first.
pub fn plan_eviction(
    entries: &[CacheEntry],
    budget: u64,
    pinned: &HashSet<LayerId>,
) -> EvictionReport {
    let total: u64 = entries.iter().map(|e| e.layer.size).sum();
    let mut report = EvictionReport {
        budget,
        total_before: total,
        total_after: total,
        ..Default::default()
    };

    let present: HashSet<&LayerId> = entries.iter().map(|e| &e.layer.id).collect();
    let mut children: HashMap<&LayerId, usize> = HashMap::new();
    for entry in entries {
        if let Some(parent) = &entry.layer.parent {
            if present.contains(parent) {
                *children.entry(parent).or_default() += 1;
            }
        }
    }

    let mut alive: Vec<&CacheEntry> = entries.iter().collect();
    alive.sort_by(|a, b| {
        a.last_used
            .cmp(&b.last_used)
            .then_with(|| a.layer.id.cmp(&b.layer.id))
    });

    while report.total_after > budget {
        let candidate = alive.iter().position(|e| {
            !pinned.contains(&e.layer.id) && children.get(&e.layer.id).copied().unwrap_or(0) == 0
        });
        let Some(pos) = candidate else {
            report.over_budget = true;
            break;
        };
        let victim = alive.remove(pos);
        report.total_after -= victim.layer.size;
        report.freed += victim.layer.size;
        if let Some(parent) = &victim.layer.parent {
            if let Some(count) = children.get_mut(parent) {
                *count -= 1;
            }
        }
        report.evicted.push(victim.layer.id.clone());
    }
    report
}

/// Evict least-recently-used leaf layers until `cache` fits in `budget`.
pub fn evict_lru(
    cache: &dyn LayerCache,
    budget: u64,
    pinned: &HashSet<LayerId>,
    dry_run: bool,
) -> Result<EvictionReport, StoreError> {
    evict_lru_with_cancel(cache, budget, pinned, dry_run, || false)
}

/// [`evict_lru`] that checks `should_stop` before each removal. The
/// report reflects only the removals that actually happened.
pub fn evict_lru_with_cancel(
    cache: &dyn LayerCache,
    budget: u64,
    pinned: &HashSet<LayerId>,
    dry_run: bool,
    should_stop: impl Fn() -> bool,
) -> Result<EvictionReport, StoreError> {
    let entries = cache.entries()?;
    let plan = plan_eviction(&entries, budget, pinned);
    if dry_run {
        return Ok(plan);
    }

    let sizes: HashMap<&LayerId, u64> = entries.iter().map(|e| (&e.layer.id, e.layer.size)).collect();
    let mut report = EvictionReport {
        budget,
        total_before: plan.total_before,
        total_after: plan.total_before,
        over_budget: plan.over_budget,
        ..Default::default()
    };
    for id in &plan.evicted {
        if should_stop() {
            report.over_budget = report.total_after > budget;
            break;
        }
        cache.remove(id)?;
        let size = sizes.get(id).copied().unwrap_or(0);
        report.total_after -= size;
        report.freed += size;
        report.evicted.push(id.clone());
        debug!("evicted layer {} ({size} bytes)", id.short());
    }
    Ok(report)
}

/// Combined eviction and orphan sweep over the on-disk cache.
#[derive(Debug, Default, Clone, Serialize)]
pub struct GcReport {
    pub pinned: usize,
    pub eviction: Option<EvictionReport>,
    /// Archives no layer record refers to.
    pub orphaned_objects: Vec<ObjectHash>,
    pub removed_objects: usize,
    /// Access-time files left behind by removed layers.
    pub stale_access: usize,
}

pub struct GarbageCollector<'a> {
    cache: &'a DiskLayerCache,
}

impl<'a> GarbageCollector<'a> {
    pub fn new(cache: &'a DiskLayerCache) -> Self {
        Self { cache }
    }

    /// Every layer reachable from a recorded image.
    ///
    /// Fails if any image record is unreadable, since its layers could not
    /// be protected.
    pub fn pinned_layers(&self) -> Result<HashSet<LayerId>, StoreError> {
        let images = ImageStore::new(self.cache.layout().clone());
        let mut pinned = HashSet::new();
        for entry in images.list_with_errors()? {
            let image = entry.map_err(|(_, e)| e)?;
            pinned.extend(image.layer_ids().cloned());
        }
        Ok(pinned)
    }

    pub fn collect(&self, budget: Option<u64>, dry_run: bool) -> Result<GcReport, StoreError> {
        self.collect_with_cancel(budget, dry_run, || false)
    }

    pub fn collect_with_cancel(
        &self,
        budget: Option<u64>,
        dry_run: bool,
        should_stop: impl Fn() -> bool,
    ) -> Result<GcReport, StoreError> {
        let pinned = self.pinned_layers()?;
        let mut report = GcReport {
            pinned: pinned.len(),
            ..Default::default()
        };

        if let Some(budget) = budget {
            let eviction =
                evict_lru_with_cancel(self.cache, budget, &pinned, dry_run, &should_stop)?;
            info!(
                "eviction: {} layer(s), {} bytes freed, {} of {} bytes used",
                eviction.evicted.len(),
                eviction.freed,
                eviction.total_after,
                budget
            );
            report.eviction = Some(eviction);
        }

        let mut live_objects: HashSet<ObjectHash> = HashSet::new();
        let mut live_layers: HashSet<String> = HashSet::new();
        for id in self.cache.layer_ids()? {
            // An unreadable record could reference any archive; skip the sweep.
            match self.cache.get(&id) {
                Ok(layer) => {
                    live_objects.insert(layer.tar_hash);
                }
                Err(_) => return Ok(report),
            }
            live_layers.insert(id.into_inner());
        }

        for hash in self.cache.objects().list()? {
            if !live_objects.contains(&hash) {
                report.orphaned_objects.push(hash);
            }
        }

        let access_dir = self.cache.layout().access_dir();
        let mut stale_access = Vec::new();
        if access_dir.exists() {
            for entry in fs::read_dir(&access_dir)? {
                let entry = entry?;
                if let Some(name) = entry.file_name().to_str() {
                    if !name.starts_with('.') && !live_layers.contains(name) {
                        stale_access.push(entry.path());
                    }
                }
            }
        }
        report.stale_access = stale_access.len();

        if !dry_run {
            for hash in &report.orphaned_objects {
                if should_stop() {
                    break;
                }
                self.cache.objects().remove(hash)?;
                report.removed_objects += 1;
            }
            for path in &stale_access {
                if should_stop() {
                    break;
                }
                fs::remove_file(path)?;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;
    use crate::images::{Image, ImageLayer};
    use crate::layers::Layer;
    use crate::layout::StoreLayout;
    use crate::memory::MemoryLayerCache;
    use strata_schema::{image_digest, ManifestHash};

    fn put(cache: &dyn LayerCache, parent: Option<&Layer>, tag: &str, size: usize) -> Layer {
        let content = vec![tag.as_bytes()[0]; size];
        match parent {
            None => cache
                .store(&CacheKey::base(tag), Layer::base(tag, &content), &content)
                .unwrap(),
            Some(p) => {
                let m = ManifestHash::new(tag);
                cache
                    .store(
                        &CacheKey::step(p.id.clone(), m.clone()),
                        Layer::install(&p.id, &m, &content),
                        &content,
                    )
                    .unwrap()
            }
        }
    }

    /// base(10) -> a(10) -> b(10), base -> c(10); lookups leave `c` oldest.
    fn fixture(cache: &MemoryLayerCache) -> (Layer, Layer, Layer, Layer) {
        let base = put(cache, None, "base", 10);
        let c = put(cache, Some(&base), "c", 10);
        let a = put(cache, Some(&base), "a", 10);
        let b = put(cache, Some(&a), "b", 10);
        (base, a, b, c)
    }

    #[test]
    fn within_budget_evicts_nothing() {
        let cache = MemoryLayerCache::new();
        fixture(&cache);
        let report = evict_lru(&cache, 100, &HashSet::new(), false).unwrap();
        assert!(report.evicted.is_empty());
        assert_eq!(report.total_before, 40);
        assert_eq!(report.total_after, 40);
        assert!(!report.over_budget);
    }

    #[test]
    fn evicts_oldest_leaf_first() {
        let cache = MemoryLayerCache::new();
        let (_base, _a, _b, c) = fixture(&cache);
        let report = evict_lru(&cache, 30, &HashSet::new(), false).unwrap();
        assert_eq!(report.evicted, vec![c.id.clone()]);
        assert_eq!(report.total_after, 30);
        assert_eq!(report.freed, 10);
        assert!(cache.get(&c.id).is_err());
    }

    #[test]
    fn never_removes_a_parent_before_its_children() {
        let cache = MemoryLayerCache::new();
        let (base, a, b, _c) = fixture(&cache);
        // Make the base the least recently used layer.
        cache.lookup(&CacheKey::base("base")).unwrap();
        let report = evict_lru(&cache, 0, &HashSet::new(), false).unwrap();
        assert_eq!(report.evicted.len(), 4);
        let pos = |id: &LayerId| report.evicted.iter().position(|e| e == id).unwrap();
        assert!(pos(&b.id) < pos(&a.id));
        assert!(pos(&a.id) < pos(&base.id));
        assert!(cache.is_empty());
    }

    #[test]
    fn pinned_chain_survives() {
        let cache = MemoryLayerCache::new();
        let (base, a, b, c) = fixture(&cache);
        let pinned: HashSet<LayerId> = [base.id.clone(), a.id.clone(), b.id.clone()].into();
        let report = evict_lru(&cache, 0, &pinned, false).unwrap();
        assert_eq!(report.evicted, vec![c.id]);
        assert!(report.over_budget);
        assert_eq!(report.total_after, 30);
        for layer in [&base, &a, &b] {
            cache.get(&layer.id).unwrap();
        }
        cache.chain(&b.id).unwrap();
    }

    #[test]
    fn dry_run_removes_nothing() {
        let cache = MemoryLayerCache::new();
        fixture(&cache);
        let report = evict_lru(&cache, 0, &HashSet::new(), true).unwrap();
        assert_eq!(report.evicted.len(), 4);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn cancel_stops_eviction() {
        let cache = MemoryLayerCache::new();
        fixture(&cache);
        let report =
            evict_lru_with_cancel(&cache, 0, &HashSet::new(), false, || true).unwrap();
        assert!(report.evicted.is_empty());
        assert!(report.over_budget);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn remaining_chains_stay_complete() {
        let cache = MemoryLayerCache::new();
        fixture(&cache);
        evict_lru(&cache, 20, &HashSet::new(), false).unwrap();
        for entry in cache.entries().unwrap() {
            cache.chain(&entry.layer.id).unwrap();
        }
    }

    fn disk_fixture() -> (tempfile::TempDir, DiskLayerCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskLayerCache::open(StoreLayout::new(dir.path())).unwrap();
        (dir, cache)
    }

    #[test]
    fn collector_pins_recorded_images() {
        let (_dir, cache) = disk_fixture();
        let base = put(&cache, None, "base", 10);
        let a = put(&cache, Some(&base), "a", 10);
        let b = put(&cache, Some(&base), "x", 10);

        let chain = [&base, &a];
        let image = Image {
            digest: image_digest("base", chain.iter().map(|l| &l.id)),
            base_ref: "base".to_owned(),
            layers: chain.iter().map(|l| ImageLayer::from(*l)).collect(),
        };
        ImageStore::new(cache.layout().clone()).put(&image).unwrap();

        let report = GarbageCollector::new(&cache).collect(Some(0), false).unwrap();
        let eviction = report.eviction.unwrap();
        assert_eq!(eviction.evicted, vec![b.id.clone()]);
        assert!(eviction.over_budget);
        assert_eq!(report.pinned, 2);
        image.verify_lineage(&cache).unwrap();
        assert!(!cache.objects().exists(&b.tar_hash));
    }

    #[test]
    fn collector_sweeps_orphan_objects() {
        let (_dir, cache) = disk_fixture();
        put(&cache, None, "base", 10);
        let orphan = cache.objects().put(b"nobody refers to me").unwrap();

        let dry = GarbageCollector::new(&cache).collect(None, true).unwrap();
        assert_eq!(dry.orphaned_objects, vec![orphan.clone()]);
        assert!(cache.objects().exists(&orphan));

        let report = GarbageCollector::new(&cache).collect(None, false).unwrap();
        assert_eq!(report.removed_objects, 1);
        assert!(!cache.objects().exists(&orphan));
        assert!(report.eviction.is_none());
    }
}
