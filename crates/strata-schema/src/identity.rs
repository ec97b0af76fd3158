//! Deterministic identities for steps, layers, and images.
//!
//! Every identity is a blake3 hash over a domain tag followed by
//! NUL-separated inputs, so values from different domains never collide
//! and reordering inputs always changes the result.

use crate::types::{ImageDigest, LayerId, ManifestHash, StepId};

const STEP_DOMAIN: &[u8] = b"strata-step-v1";
const BASE_DOMAIN: &[u8] = b"strata-base-v1";
const LAYER_DOMAIN: &[u8] = b"strata-layer-v1";
const IMAGE_DOMAIN: &[u8] = b"strata-image-v1";

fn hash_parts(domain: &[u8], parts: &[&[u8]]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(b"\0");
        hasher.update(part);
    }
    hasher.finalize().to_hex().to_string()
}

/// Identity of the step that materializes the base image reference.
pub fn base_step_id(base_ref: &str) -> StepId {
    StepId::new(hash_parts(BASE_DOMAIN, &[base_ref.as_bytes()]))
}

/// Identity of applying `manifest` atop `parent`.
pub fn step_id(parent: &LayerId, manifest: &ManifestHash) -> StepId {
    StepId::new(hash_parts(
        STEP_DOMAIN,
        &[parent.as_bytes(), manifest.as_bytes()],
    ))
}

/// Identity of a layer: the step that produced it plus its content hash.
pub fn layer_id(step: &StepId, tar_hash: &str) -> LayerId {
    LayerId::new(hash_parts(
        LAYER_DOMAIN,
        &[step.as_bytes(), tar_hash.as_bytes()],
    ))
}

/// Digest of an image: the base reference and its ordered layer-id chain.
pub fn image_digest<'a>(
    base_ref: &str,
    layers: impl IntoIterator<Item = &'a LayerId>,
) -> ImageDigest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(IMAGE_DOMAIN);
    hasher.update(b"\0");
    hasher.update(base_ref.as_bytes());
    for layer in layers {
        hasher.update(b"\0");
        hasher.update(layer.as_bytes());
    }
    ImageDigest::new(hasher.finalize().to_hex().to_string())
}
