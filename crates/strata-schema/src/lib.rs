//! Requirement manifests, identifier newtypes, and identity hashing for strata.
//!
//! This crate defines the schema layer: pip-style manifest parsing into an
//! ordered, canonical `Manifest` with a stable content hash, and the
//! deterministic step/layer/image identities that make builds reproducible.

pub mod identity;
pub mod manifest;
pub mod types;

pub use identity::{base_step_id, image_digest, layer_id, step_id};
pub use manifest::{
    load_manifest, load_manifests, parse_manifest, parse_manifest_str, Manifest, ManifestError,
    Specifier, VersionConstraint, VersionOp,
};
pub use types::{ImageDigest, LayerId, ManifestHash, ObjectHash, StepId};
