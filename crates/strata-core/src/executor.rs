use crate::concurrency::CancelToken;
use crate::CoreError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_runtime::{Backend, BaseResolver, Installer, Overlay, RuntimeError};
use strata_schema::Manifest;
use strata_store::{pack_layer, CacheKey, Layer, LayerCache};
use tracing::{debug, info};

/// A layer produced or reused by one build step.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub layer: Layer,
    /// True when the layer came from the cache and nothing was installed.
    pub cached: bool,
}

/// Runs build steps against a shared layer cache.
///
/// Every miss runs in its own [`Overlay`] under `staging`, which is torn
/// down when the step returns, whatever the outcome.
pub struct BuildExecutor {
    cache: Arc<dyn LayerCache>,
    resolver: Arc<dyn BaseResolver>,
    installer: Arc<dyn Installer>,
    staging: PathBuf,
    cancel: CancelToken,
}

impl BuildExecutor {
    pub fn new(cache: Arc<dyn LayerCache>, backend: Backend, staging: impl Into<PathBuf>) -> Self {
        Self {
            cache,
            resolver: backend.resolver,
            installer: backend.installer,
            staging: staging.into(),
            cancel: CancelToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cache(&self) -> &Arc<dyn LayerCache> {
        &self.cache
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn staging(&self) -> &Path {
        &self.staging
    }

    /// The layer for base reference `base_ref`, resolving and caching it on
    /// first use.
    pub fn resolve_base(&self, base_ref: &str) -> Result<StepResult, CoreError> {
        let key = CacheKey::base(base_ref);
        if let Some(layer) = self.cache.lookup(&key)? {
            debug!("cache hit for {key}: {}", layer.id.short());
            return Ok(StepResult {
                layer,
                cached: true,
            });
        }
        self.check_cancelled()?;

        info!("resolving base {base_ref} with {}", self.resolver.name());
        let overlay = Overlay::acquire(&self.staging)?;
        self.resolver
            .resolve_base(base_ref, &overlay.root())
            .map_err(|e| self.runtime_error(e))?;
        let content = pack_layer(&overlay.root())
            .map_err(|e| CoreError::FilesystemCapture(e.to_string()))?;

        let layer = self
            .cache
            .store(&key, Layer::base(base_ref, &content), &content)?;
        debug!(
            "stored base layer {} ({} bytes)",
            layer.id.short(),
            layer.size
        );
        Ok(StepResult {
            layer,
            cached: false,
        })
    }

    /// The layer produced by installing `manifest` on top of `parent`.
    pub fn execute(&self, parent: &Layer, manifest: &Manifest) -> Result<StepResult, CoreError> {
        let key = CacheKey::step(parent.id.clone(), manifest.hash().clone());
        if let Some(layer) = self.cache.lookup(&key)? {
            debug!("cache hit for {key}: {}", layer.id.short());
            return Ok(StepResult {
                layer,
                cached: true,
            });
        }
        self.check_cancelled()?;

        info!(
            "building {} ({} requirements) on {}",
            manifest.source().display(),
            manifest.specifiers().len(),
            parent.id.short()
        );
        let overlay = Overlay::acquire(&self.staging)?;

        let chain = self.cache.chain(&parent.id)?;
        let contents = chain
            .iter()
            .map(|layer| self.cache.content(&layer.id))
            .collect::<Result<Vec<_>, _>>()?;
        overlay.materialize(contents.iter().map(Vec::as_slice))?;

        let root = overlay.root();
        for specifier in manifest.specifiers() {
            self.check_cancelled()?;
            debug!("installing {specifier}");
            let output = self
                .installer
                .install(specifier, &root)
                .map_err(|e| self.runtime_error(e))?;
            if !output.success() {
                // An installer killed by the same interrupt is not a failure.
                self.check_cancelled()?;
                return Err(CoreError::InstallFailure {
                    specifier: specifier.to_string(),
                    exit: output.exit,
                    output: output.combined(),
                });
            }
        }

        let delta = overlay.diff().map_err(|e| self.runtime_error(e))?;
        let layer = Layer::install(&parent.id, manifest.hash(), &delta);
        let layer = self.cache.store(&key, layer, &delta)?;
        debug!("stored layer {} ({} bytes)", layer.id.short(), layer.size);
        Ok(StepResult {
            layer,
            cached: false,
        })
    }

    fn check_cancelled(&self) -> Result<(), CoreError> {
        if self.cancel.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn runtime_error(&self, err: RuntimeError) -> CoreError {
        if self.cancel.is_cancelled() {
            return CoreError::Cancelled;
        }
        match err {
            RuntimeError::Capture(msg) => CoreError::FilesystemCapture(msg),
            other => CoreError::Runtime(other),
        }
    }
}
