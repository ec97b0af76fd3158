use crate::cache::{DiskLayerCache, LayerCache};
use crate::images::ImageStore;
use crate::layout::StoreLayout;
use crate::StoreError;
use serde::Serialize;

#[derive(Debug, Default, Serialize)]
pub struct IntegrityReport {
    pub objects_checked: usize,
    pub objects_passed: usize,
    pub layers_checked: usize,
    pub layers_passed: usize,
    pub bindings_checked: usize,
    pub bindings_passed: usize,
    pub images_checked: usize,
    pub images_passed: usize,
    pub failed: Vec<IntegrityFailure>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Serialize)]
pub struct IntegrityFailure {
    pub hash: String,
    pub reason: String,
}

fn fail(report: &mut IntegrityReport, hash: &str, reason: String) {
    report.failed.push(IntegrityFailure {
        hash: hash.to_owned(),
        reason,
    });
}

/// Check every object, layer record, key binding, and image in the store.
///
/// Nothing is repaired; problems are collected into the report.
pub fn verify_store_integrity(layout: &StoreLayout) -> Result<IntegrityReport, StoreError> {
    let cache = DiskLayerCache::open(layout.clone())?;
    let images = ImageStore::new(layout.clone());
    let mut report = IntegrityReport::default();

    let all_objects = cache.objects().list()?;
    report.objects_checked = all_objects.len();
    for hash in &all_objects {
        match cache.objects().get(hash) {
            Ok(_) => report.objects_passed += 1,
            Err(StoreError::IntegrityFailure { actual, .. }) => {
                fail(&mut report, hash, format!("object hash mismatch: got {actual}"));
            }
            Err(e) => fail(&mut report, hash, format!("object read error: {e}")),
        }
    }

    let all_layers = cache.layer_ids()?;
    report.layers_checked = all_layers.len();
    for id in &all_layers {
        let layer = match cache.get(id) {
            Ok(layer) => layer,
            Err(StoreError::IntegrityFailure { actual, .. }) => {
                fail(&mut report, id, format!("layer checksum mismatch: got {actual}"));
                continue;
            }
            Err(e) => {
                fail(&mut report, id, format!("layer read error: {e}"));
                continue;
            }
        };
        if let Some(parent) = &layer.parent {
            if !cache.contains(parent) {
                fail(&mut report, id, format!("parent layer {parent} is missing"));
                continue;
            }
        }
        if !cache.objects().exists(&layer.tar_hash) {
            fail(
                &mut report,
                id,
                format!("layer archive {} is missing", layer.tar_hash),
            );
            continue;
        }
        report.layers_passed += 1;
    }

    let bindings = cache.bindings()?;
    report.bindings_checked = bindings.len();
    for (step, id) in &bindings {
        match cache.get(id) {
            Ok(layer) if layer.step_id == *step => report.bindings_passed += 1,
            Ok(layer) => fail(
                &mut report,
                step,
                format!("bound to layer {id} which belongs to step {}", layer.step_id),
            ),
            Err(e) => fail(
                &mut report,
                step,
                format!("bound to unreadable layer {id}: {e}"),
            ),
        }
    }

    let all_images = images.list_with_errors()?;
    report.images_checked = all_images.len();
    for entry in all_images {
        match entry {
            Ok(image) => match image.verify_lineage(&cache as &dyn LayerCache) {
                Ok(()) => report.images_passed += 1,
                Err(e) => fail(&mut report, &image.digest, format!("lineage error: {e}")),
            },
            Err((digest, e)) => fail(&mut report, &digest, format!("image read error: {e}")),
        }
    }

    Ok(report)
}
