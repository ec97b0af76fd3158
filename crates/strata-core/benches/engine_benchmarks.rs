use criterion::{criterion_group, criterion_main, Criterion};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_core::{CancelToken, Engine};
use strata_runtime::{Backend, MockInstaller, MockResolver};
use strata_schema::{base_step_id, image_digest, layer_id, parse_manifest_str, step_id, LayerId};

fn create_manifests(dir: &Path) -> Vec<PathBuf> {
    let general = dir.join("general.txt");
    fs::write(
        &general,
        "numpy==1.17\nscipy>=1.3,<1.4\npandas~=0.25\nmatplotlib\n",
    )
    .unwrap();
    let control = dir.join("control.txt");
    fs::write(&control, "gym==0.15\nmujoco-py<2.1\n").unwrap();
    vec![general, control]
}

fn mock_backend() -> Backend {
    Backend {
        resolver: Arc::new(MockResolver),
        installer: Arc::new(MockInstaller::new()),
    }
}

fn bench_identity(c: &mut Criterion) {
    let manifest = parse_manifest_str("numpy==1.17\ngym==0.15\n").unwrap();
    c.bench_function("identity_chain_3_layers", |b| {
        b.iter(|| {
            let base = layer_id(&base_step_id("tf:19.11"), "a".repeat(64).as_str());
            let one = layer_id(&step_id(&base, manifest.hash()), "b".repeat(64).as_str());
            let two = layer_id(&step_id(&one, manifest.hash()), "c".repeat(64).as_str());
            let chain: [&LayerId; 3] = [&base, &one, &two];
            image_digest("tf:19.11", chain)
        });
    });
}

fn bench_manifest_parse(c: &mut Criterion) {
    let text: String = (0..200)
        .map(|i| format!("package-{i}[extra]>=1.{i},<2.0 ; python_version >= \"3.6\"  # pinned\n"))
        .collect();
    c.bench_function("manifest_parse_200_lines", |b| {
        b.iter(|| parse_manifest_str(&text).unwrap());
    });
}

fn bench_build(c: &mut Criterion) {
    c.bench_function("engine_build_mock_2_manifests", |b| {
        b.iter_with_setup(
            || {
                let store_dir = tempfile::tempdir().unwrap();
                let project_dir = tempfile::tempdir().unwrap();
                let manifests = create_manifests(project_dir.path());
                let engine = Engine::open(store_dir.path()).unwrap();
                (store_dir, project_dir, manifests, engine)
            },
            |(_sd, _pd, manifests, engine)| {
                engine
                    .build(mock_backend(), "tf:19.11", &manifests, &CancelToken::new())
                    .unwrap();
            },
        );
    });
}

fn bench_rebuild_cached(c: &mut Criterion) {
    c.bench_function("engine_rebuild_fully_cached", |b| {
        b.iter_with_setup(
            || {
                let store_dir = tempfile::tempdir().unwrap();
                let project_dir = tempfile::tempdir().unwrap();
                let manifests = create_manifests(project_dir.path());
                let engine = Engine::open(store_dir.path()).unwrap();
                engine
                    .build(mock_backend(), "tf:19.11", &manifests, &CancelToken::new())
                    .unwrap();
                (store_dir, project_dir, manifests, engine)
            },
            |(_sd, _pd, manifests, engine)| {
                engine
                    .build(mock_backend(), "tf:19.11", &manifests, &CancelToken::new())
                    .unwrap();
            },
        );
    });
}

criterion_group!(
    benches,
    bench_identity,
    bench_manifest_parse,
    bench_build,
    bench_rebuild_cached
);
criterion_main!(benches);
