use crate::assembler::assemble;
use crate::concurrency::{CancelToken, LockMode, StoreLock};
use crate::executor::{BuildExecutor, StepResult};
use crate::lifecycle::{validate_transition, BuildState};
use crate::CoreError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_runtime::{sweep_stale_overlays, Backend};
use strata_schema::{load_manifests, ImageDigest, LayerId, Manifest};
use strata_store::{
    verify_store_integrity, DiskLayerCache, GarbageCollector, GcReport, Image, ImageStore,
    IntegrityReport, Layer, LayerCache, StoreLayout,
};
use tracing::{debug, info, warn};

/// One position in a finished build.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// 0 for the base layer, `i` for the `i`-th manifest.
    pub index: usize,
    pub layer_id: LayerId,
    pub cached: bool,
    /// Manifest the layer was built from; `None` for the base.
    pub manifest: Option<PathBuf>,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub image: Image,
    pub steps: Vec<StepReport>,
}

impl BuildReport {
    pub fn cached_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.cached).count()
    }

    pub fn built_steps(&self) -> usize {
        self.steps.len() - self.cached_steps()
    }
}

/// How a build ended when it did not fail.
#[derive(Debug)]
pub enum BuildOutcome {
    Completed(BuildReport),
    /// Stopped by the cancel token. Layers finished before that point stay
    /// cached; no image was assembled.
    Cancelled { completed_steps: usize },
}

impl BuildOutcome {
    pub fn report(&self) -> Option<&BuildReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Cancelled { .. } => None,
        }
    }

    pub fn into_report(self) -> Option<BuildReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Cancelled { .. } => None,
        }
    }
}

/// Drives one build through its states. [`build`](Self::build) consumes the
/// builder, so each builder yields exactly one outcome.
pub struct Builder<'a> {
    executor: &'a BuildExecutor,
    state: BuildState,
    steps: Vec<StepReport>,
}

impl<'a> Builder<'a> {
    pub fn new(executor: &'a BuildExecutor) -> Self {
        Self {
            executor,
            state: BuildState::Init,
            steps: Vec::new(),
        }
    }

    pub fn state(&self) -> &BuildState {
        &self.state
    }

    /// Build `base_ref` plus one layer per manifest file, in order.
    pub fn build<P: AsRef<Path>>(
        self,
        base_ref: &str,
        manifest_paths: &[P],
    ) -> Result<BuildOutcome, CoreError> {
        self.run(base_ref, || Ok(load_manifests(manifest_paths)?))
    }

    /// Like [`build`](Self::build) for manifests already in memory.
    pub fn build_manifests(
        self,
        base_ref: &str,
        manifests: Vec<Manifest>,
    ) -> Result<BuildOutcome, CoreError> {
        self.run(base_ref, || Ok(manifests))
    }

    fn run(
        mut self,
        base_ref: &str,
        load: impl FnOnce() -> Result<Vec<Manifest>, CoreError>,
    ) -> Result<BuildOutcome, CoreError> {
        match self.pipeline(base_ref, load) {
            Ok(image) => {
                info!(
                    "built image {} ({} layers, {} cached)",
                    image.digest.short(),
                    image.layers.len(),
                    self.steps.iter().filter(|s| s.cached).count()
                );
                Ok(BuildOutcome::Completed(BuildReport {
                    image,
                    steps: self.steps,
                }))
            }
            Err(err) => {
                let failed = BuildState::Failed {
                    reason: err.to_string(),
                };
                if let Err(e) = self.advance(failed) {
                    warn!("could not record build failure: {e}");
                }
                if matches!(err, CoreError::Cancelled) {
                    info!("build cancelled after {} step(s)", self.steps.len());
                    Ok(BuildOutcome::Cancelled {
                        completed_steps: self.steps.len(),
                    })
                } else {
                    Err(err)
                }
            }
        }
    }

    fn pipeline(
        &mut self,
        base_ref: &str,
        load: impl FnOnce() -> Result<Vec<Manifest>, CoreError>,
    ) -> Result<Image, CoreError> {
        self.advance(BuildState::LoadingManifests)?;
        let manifests = load()?;
        debug!("loaded {} manifest(s)", manifests.len());

        self.advance(BuildState::Step { index: 0 })?;
        self.check_cancelled()?;
        let base = self.executor.resolve_base(base_ref)?;
        self.record(0, &base, None);

        let mut layers: Vec<Layer> = Vec::with_capacity(manifests.len() + 1);
        layers.push(base.layer);
        for (offset, manifest) in manifests.iter().enumerate() {
            let index = offset + 1;
            self.advance(BuildState::Step { index })?;
            self.check_cancelled()?;
            let step = self.executor.execute(&layers[offset], manifest)?;
            self.record(index, &step, Some(manifest.source()));
            layers.push(step.layer);
        }

        self.advance(BuildState::Assembling)?;
        let image = assemble(base_ref, &layers)?;
        image.verify_lineage(self.executor.cache().as_ref())?;
        self.advance(BuildState::Done)?;
        Ok(image)
    }

    fn advance(&mut self, next: BuildState) -> Result<(), CoreError> {
        validate_transition(&self.state, &next)?;
        debug!("build state {} -> {next}", self.state);
        self.state = next;
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), CoreError> {
        if self.executor.cancel_token().is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        Ok(())
    }

    fn record(&mut self, index: usize, step: &StepResult, manifest: Option<&Path>) {
        self.steps.push(StepReport {
            index,
            layer_id: step.layer.id.clone(),
            cached: step.cached,
            manifest: manifest.map(Path::to_path_buf),
            size: step.layer.size,
        });
    }
}

/// Entry point over an on-disk store: builds, the image registry,
/// eviction, and verification.
pub struct Engine {
    layout: StoreLayout,
    cache: Arc<DiskLayerCache>,
    images: ImageStore,
    cache_budget: Option<u64>,
}

impl Engine {
    /// Open (creating if needed) the store at `store_root`.
    ///
    /// Overlays left behind by killed builds are removed.
    pub fn open(store_root: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let layout = StoreLayout::new(store_root);
        let cache = DiskLayerCache::open(layout.clone())?;
        let swept = sweep_stale_overlays(&layout.staging_dir())?;
        if swept > 0 {
            warn!("removed {swept} stale overlay(s) left by interrupted builds");
        }
        Ok(Self {
            images: ImageStore::new(layout.clone()),
            cache: Arc::new(cache),
            layout,
            cache_budget: None,
        })
    }

    /// Evict down to `budget` bytes after every successful build.
    #[must_use]
    pub fn with_cache_budget(mut self, budget: Option<u64>) -> Self {
        self.cache_budget = budget;
        self
    }

    pub fn store_layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn cache(&self) -> Arc<dyn LayerCache> {
        self.cache.clone()
    }

    pub fn executor(&self, backend: Backend, cancel: &CancelToken) -> BuildExecutor {
        BuildExecutor::new(self.cache(), backend, self.layout.staging_dir())
            .with_cancel(cancel.clone())
    }

    /// Build and record an image. Holds the store lock shared for the
    /// duration, so gc waits for running builds.
    pub fn build<P: AsRef<Path>>(
        &self,
        backend: Backend,
        base_ref: &str,
        manifest_paths: &[P],
        cancel: &CancelToken,
    ) -> Result<BuildOutcome, CoreError> {
        let outcome = {
            let _lock = StoreLock::acquire(&self.layout.lock_file(), LockMode::Shared)?;
            let executor = self.executor(backend, cancel);
            let outcome = Builder::new(&executor).build(base_ref, manifest_paths)?;
            if let BuildOutcome::Completed(report) = &outcome {
                self.images.put(&report.image)?;
                debug!("recorded image {}", report.image.digest);
            }
            outcome
        };

        if let (Some(budget), BuildOutcome::Completed(_)) = (self.cache_budget, &outcome) {
            self.evict_after_build(budget);
        }
        Ok(outcome)
    }

    fn evict_after_build(&self, budget: u64) {
        match StoreLock::try_acquire(&self.layout.lock_file(), LockMode::Exclusive) {
            Ok(Some(lock)) => {
                if let Err(e) = self.gc(&lock, Some(budget), false, &CancelToken::new()) {
                    warn!("post-build eviction failed: {e}");
                }
            }
            Ok(None) => debug!("store busy, skipping post-build eviction"),
            Err(e) => warn!("could not lock store for eviction: {e}"),
        }
    }

    /// Evict to `budget` (when given) and sweep unreferenced archives.
    ///
    /// Requires a `&StoreLock` as proof that the caller holds the store
    /// lock; it should be exclusive so no build is running.
    pub fn gc(
        &self,
        _lock: &StoreLock,
        budget: Option<u64>,
        dry_run: bool,
        cancel: &CancelToken,
    ) -> Result<GcReport, CoreError> {
        info!("running garbage collection (budget={budget:?}, dry_run={dry_run})");
        let gc = GarbageCollector::new(&self.cache);
        Ok(gc.collect_with_cancel(budget, dry_run, || cancel.is_cancelled())?)
    }

    pub fn images(&self) -> Result<Vec<Image>, CoreError> {
        Ok(self.images.list()?)
    }

    /// Look up an image by digest or unique digest prefix.
    pub fn inspect(&self, digest_or_prefix: &str) -> Result<Image, CoreError> {
        Ok(self.images.resolve(digest_or_prefix)?)
    }

    pub fn recorded_at(&self, digest: &ImageDigest) -> Result<String, CoreError> {
        Ok(self.images.recorded_at(digest)?)
    }

    /// Walk `image`'s chain through the cache.
    pub fn verify_image(&self, image: &Image) -> Result<(), CoreError> {
        Ok(image.verify_lineage(&*self.cache)?)
    }

    /// Forget a recorded image so its layers become evictable.
    pub fn remove_image(
        &self,
        _lock: &StoreLock,
        digest_or_prefix: &str,
    ) -> Result<ImageDigest, CoreError> {
        let image = self.images.resolve(digest_or_prefix)?;
        self.images.remove(&image.digest)?;
        info!("removed image {}", image.digest.short());
        Ok(image.digest)
    }

    pub fn verify_store(&self) -> Result<IntegrityReport, CoreError> {
        Ok(verify_store_integrity(&self.layout)?)
    }
}
