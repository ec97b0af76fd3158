use crate::CoreError;
use strata_schema::image_digest;
use strata_store::{Image, ImageLayer, Layer, LayerSource};

/// Stitch an ordered layer chain into an [`Image`].
///
/// `layers[0]` must be the base layer for `base_ref` and every later layer
/// must name its predecessor as parent.
pub fn assemble(base_ref: &str, layers: &[Layer]) -> Result<Image, CoreError> {
    let Some(base) = layers.first() else {
        return Err(CoreError::BrokenLineage {
            position: 0,
            expected: format!("base layer for {base_ref}"),
            found: "no layers".to_owned(),
        });
    };
    match &base.source {
        LayerSource::Base { reference } if reference == base_ref && base.parent.is_none() => {}
        LayerSource::Base { reference } => {
            return Err(CoreError::BrokenLineage {
                position: 0,
                expected: format!("base layer for {base_ref}"),
                found: format!("base layer for {reference}"),
            })
        }
        LayerSource::Install { .. } => {
            return Err(CoreError::BrokenLineage {
                position: 0,
                expected: format!("base layer for {base_ref}"),
                found: format!("install layer {}", base.id),
            })
        }
    }

    for (position, pair) in layers.windows(2).enumerate() {
        let (prev, layer) = (&pair[0], &pair[1]);
        if layer.is_base() || layer.parent.as_ref() != Some(&prev.id) {
            return Err(CoreError::BrokenLineage {
                position: position + 1,
                expected: prev.id.to_string(),
                found: layer
                    .parent
                    .as_ref()
                    .map_or_else(|| "no parent".to_owned(), ToString::to_string),
            });
        }
    }

    let digest = image_digest(base_ref, layers.iter().map(|l| &l.id));
    Ok(Image {
        digest,
        base_ref: base_ref.to_owned(),
        layers: layers.iter().map(ImageLayer::from).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_schema::ManifestHash;

    fn chain() -> Vec<Layer> {
        let base = Layer::base("tf:19.11", b"base");
        let numpy = Layer::install(&base.id, &ManifestHash::new("m1"), b"numpy");
        let gym = Layer::install(&numpy.id, &ManifestHash::new("m2"), b"gym");
        vec![base, numpy, gym]
    }

    #[test]
    fn assembles_valid_chain() {
        let layers = chain();
        let image = assemble("tf:19.11", &layers).unwrap();
        assert_eq!(image.layers.len(), 3);
        assert_eq!(image.base_ref, "tf:19.11");
        assert_eq!(image.top_layer(), Some(&layers[2].id));
        assert_eq!(image.layers[0].manifest_hash, None);
        assert_eq!(
            image.layers[2].manifest_hash,
            Some(ManifestHash::new("m2"))
        );
    }

    #[test]
    fn digest_is_deterministic() {
        let a = assemble("tf:19.11", &chain()).unwrap();
        let b = assemble("tf:19.11", &chain()).unwrap();
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
    }

    #[test]
    fn base_only_image_is_valid() {
        let layers = chain();
        let image = assemble("tf:19.11", &layers[..1]).unwrap();
        assert_eq!(image.layers.len(), 1);
        assert_ne!(image.digest, assemble("tf:19.11", &layers).unwrap().digest);
    }

    #[test]
    fn empty_chain_is_broken() {
        assert!(matches!(
            assemble("tf:19.11", &[]),
            Err(CoreError::BrokenLineage { position: 0, .. })
        ));
    }

    #[test]
    fn wrong_base_is_broken() {
        assert!(matches!(
            assemble("tf:20.01", &chain()),
            Err(CoreError::BrokenLineage { position: 0, .. })
        ));
    }

    #[test]
    fn chain_must_start_with_base() {
        let layers = chain();
        assert!(matches!(
            assemble("tf:19.11", &layers[1..]),
            Err(CoreError::BrokenLineage { position: 0, .. })
        ));
    }

    #[test]
    fn gap_in_chain_is_reported_with_position() {
        let mut layers = chain();
        layers.remove(1);
        match assemble("tf:19.11", &layers).unwrap_err() {
            CoreError::BrokenLineage {
                position,
                expected,
                found,
            } => {
                assert_eq!(position, 1);
                assert_eq!(expected, layers[0].id.to_string());
                assert_ne!(found, expected);
            }
            other => panic!("expected BrokenLineage, got {other:?}"),
        }
    }

    #[test]
    fn reordered_chain_is_broken() {
        let mut layers = chain();
        layers.swap(1, 2);
        assert!(assemble("tf:19.11", &layers).is_err());
    }
}
