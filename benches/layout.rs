//! Cache layout and validation benchmarks
//!
//! Benchmarks for the hot lookups behind every status query:
//! - Folder name derivation and parsing
//! - Completeness validation of an installed snapshot
//! - Discovery of cached repositories under a populated root

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use model_cache::layout::{folder_name, parse_folder_name};
use model_cache::manifest::QWEN2_5_OMNI_FILES;
use model_cache::{CacheLayout, RepoKind, RepositoryId, SUCCESS_MARKER, is_valid_model_dir};
use std::fs;
use std::hint::black_box;
use tempfile::TempDir;

fn bench_folder_name(c: &mut Criterion) {
    let mut group = c.benchmark_group("folder_name");

    for identifier in ["org/name", "MNN/Qwen2.5-Omni-3B-MNN", "a/b/c/d/e/f"] {
        group.bench_with_input(
            BenchmarkId::new("derive", identifier),
            &identifier,
            |b, identifier| b.iter(|| folder_name(RepoKind::Model, black_box(identifier))),
        );

        let name = folder_name(RepoKind::Model, identifier);
        group.bench_with_input(BenchmarkId::new("parse", identifier), &name, |b, name| {
            b.iter(|| parse_folder_name(black_box(name)))
        });
    }

    group.finish();
}

fn bench_validate(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    for file in QWEN2_5_OMNI_FILES {
        fs::write(temp_dir.path().join(file), b"x").unwrap();
    }
    fs::write(temp_dir.path().join(SUCCESS_MARKER), b"").unwrap();

    let mut group = c.benchmark_group("validate");

    group.bench_function("marker_only", |b| {
        b.iter(|| is_valid_model_dir::<&str>(black_box(temp_dir.path()), &[]))
    });

    group.bench_function("full_manifest", |b| {
        b.iter(|| is_valid_model_dir(black_box(temp_dir.path()), QWEN2_5_OMNI_FILES))
    });

    group.finish();
}

fn bench_discovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("list_cached_repositories");

    for repo_count in [10, 100, 1000] {
        let temp_dir = TempDir::new().unwrap();
        let layout = CacheLayout::new(temp_dir.path());
        for i in 0..repo_count {
            let id = RepositoryId::model(&format!("org/model-{}", i)).unwrap();
            fs::create_dir_all(layout.snapshot_dir(&id, "abc123")).unwrap();
        }

        group.bench_with_input(
            BenchmarkId::from_parameter(repo_count),
            &layout,
            |b, layout| b.iter(|| layout.list_cached_repositories()),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_folder_name, bench_validate, bench_discovery);
criterion_main!(benches);
